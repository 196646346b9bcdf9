//! Terminal transport for trying the bot locally
//!
//! Each stdin line is one inbound message: plain text from the local identity,
//! `sender|chat|text` to impersonate someone else (group chats end in `@g.us`), or a
//! JSON-encoded message when mentions or timestamps matter.

use anyhow::Result;
use async_trait::async_trait;
use dot_core::ChannelAdapter;
use dot_ipc::{EventBus, InboundMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

pub const CHANNEL: &str = "console";
pub const DEFAULT_IDENTITY: &str = "console@s.whatsapp.net";

pub struct ConsoleAdapter {
    identity: String,
}

impl ConsoleAdapter {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }

    pub fn parse_line(&self, line: &str) -> Option<InboundMessage> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }

        if line.trim_start().starts_with('{') {
            match InboundMessage::from_json(line) {
                Ok(message) => return Some(message),
                Err(e) => warn!("Not a JSON message, treating it as text: {}", e),
            }
        }

        let parts: Vec<&str> = line.splitn(3, '|').collect();
        if let [sender, chat, text] = parts.as_slice() {
            let (sender, chat) = (sender.trim(), chat.trim());
            if !sender.is_empty() && !chat.is_empty() {
                let from_me = sender == self.identity;
                return Some(InboundMessage::new(CHANNEL, sender, chat, text).from_me(from_me));
            }
        }

        Some(InboundMessage::new(CHANNEL, &self.identity, &self.identity, line))
    }
}

#[async_trait]
impl ChannelAdapter for ConsoleAdapter {
    fn channel_name(&self) -> &str {
        CHANNEL
    }

    async fn start(&self, event_bus: EventBus) -> Result<()> {
        let mut outbound = event_bus.outbound_subscribe();
        tokio::spawn(async move {
            loop {
                match outbound.recv().await {
                    Ok(message) => {
                        if message.mentions.is_empty() {
                            println!("[{}] {}", message.chat_id, message.text);
                        } else {
                            println!(
                                "[{}] {} (mentions: {})",
                                message.chat_id,
                                message.text,
                                message.mentions.len()
                            );
                        }
                    }
                    Err(RecvError::Lagged(n)) => warn!("Console output lagged by {} messages", n),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        info!("Console ready: type a message, or sender|chat|text");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(message) = self.parse_line(&line) {
                event_bus.publish(message)?;
            }
        }
        info!("Console input closed");
        Ok(())
    }
}
