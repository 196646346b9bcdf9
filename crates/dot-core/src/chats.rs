//! Chats the bot has seen messages from, used as broadcast targets

use dot_ipc::{is_group_chat, InboundMessage};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownChat {
    pub channel: String,
    pub chat_id: String,
    /// Unix seconds of the latest message
    pub last_seen: u64,
}

impl KnownChat {
    pub fn is_group(&self) -> bool {
        is_group_chat(&self.chat_id)
    }
}

#[derive(Default)]
pub struct ChatBook {
    chats: RwLock<BTreeMap<String, KnownChat>>,
}

impl ChatBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: &InboundMessage) {
        if message.is_broadcast() || message.chat_id.trim().is_empty() {
            return;
        }
        let mut chats = self.chats.write();
        let entry = chats
            .entry(message.chat_id.clone())
            .or_insert_with(|| KnownChat {
                channel: message.channel.clone(),
                chat_id: message.chat_id.clone(),
                last_seen: message.timestamp,
            });
        entry.channel = message.channel.clone();
        entry.last_seen = entry.last_seen.max(message.timestamp);
    }

    /// Most recently active first
    pub fn private_chats(&self) -> Vec<KnownChat> {
        self.filtered(|chat| !chat.is_group())
    }

    /// Most recently active first
    pub fn group_chats(&self) -> Vec<KnownChat> {
        self.filtered(KnownChat::is_group)
    }

    fn filtered(&self, keep: impl Fn(&KnownChat) -> bool) -> Vec<KnownChat> {
        let mut chats: Vec<KnownChat> = self
            .chats
            .read()
            .values()
            .filter(|chat| keep(chat))
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.chat_id.cmp(&b.chat_id)));
        chats
    }

    pub fn len(&self) -> usize {
        self.chats.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_chats_once_and_orders_by_activity() {
        let book = ChatBook::new();
        book.record(&InboundMessage::new("whatsapp", "a@s.whatsapp.net", "a@s.whatsapp.net", "hi").with_timestamp(10));
        book.record(&InboundMessage::new("whatsapp", "b@s.whatsapp.net", "b@s.whatsapp.net", "hi").with_timestamp(20));
        book.record(&InboundMessage::new("whatsapp", "a@s.whatsapp.net", "a@s.whatsapp.net", "again").with_timestamp(30));
        book.record(&InboundMessage::new("whatsapp", "a@s.whatsapp.net", "team@g.us", "yo").with_timestamp(5));
        book.record(&InboundMessage::new("whatsapp", "a@s.whatsapp.net", "status@broadcast", "x"));

        assert_eq!(book.len(), 3);
        let private: Vec<String> = book.private_chats().into_iter().map(|c| c.chat_id).collect();
        assert_eq!(private, vec!["a@s.whatsapp.net".to_string(), "b@s.whatsapp.net".to_string()]);
        assert_eq!(book.group_chats().len(), 1);
        assert_eq!(book.group_chats()[0].last_seen, 5);
    }
}
