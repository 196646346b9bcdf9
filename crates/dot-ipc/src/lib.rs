//! Dot IPC - Inter-Process Communication
//!
//! Message records and the event bus between transport adapters and the core

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

/// Chat identifiers carrying this suffix are group chats
pub const GROUP_SUFFIX: &str = "@g.us";
pub const BROADCAST_SUFFIX: &str = "@broadcast";

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn default_trace_id() -> String {
    generate_trace_id()
}

fn default_timestamp() -> u64 {
    now_unix_secs()
}

pub fn is_group_chat(chat_id: &str) -> bool {
    chat_id.ends_with(GROUP_SUFFIX)
}

/// One inbound message as delivered by a transport adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    pub channel: String,
    pub sender: String,
    pub chat_id: String,
    pub body: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub mentions: Vec<String>,
    /// Unix seconds
    #[serde(default = "default_timestamp")]
    pub timestamp: u64,
}

impl InboundMessage {
    pub fn new(channel: &str, sender: &str, chat_id: &str, body: &str) -> Self {
        Self {
            id: generate_trace_id(),
            trace_id: generate_trace_id(),
            channel: channel.to_string(),
            sender: sender.to_string(),
            chat_id: chat_id.to_string(),
            body: body.to_string(),
            from_me: false,
            mentions: Vec::new(),
            timestamp: now_unix_secs(),
        }
    }

    pub fn from_me(mut self, from_me: bool) -> Self {
        self.from_me = from_me;
        self
    }

    pub fn with_mentions(mut self, mentions: Vec<String>) -> Self {
        self.mentions = mentions;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_group(&self) -> bool {
        is_group_chat(&self.chat_id)
    }

    pub fn is_broadcast(&self) -> bool {
        self.chat_id.ends_with(BROADCAST_SUFFIX)
    }

    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub text: String,
    /// Id of the inbound message being answered
    pub reply_to: Option<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
}

impl OutboundMessage {
    /// A message to any chat, not answering anything
    pub fn to_chat(channel: &str, chat_id: &str, text: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            reply_to: None,
            mentions: Vec::new(),
        }
    }

    pub fn reply_to(message: &InboundMessage, text: &str) -> Self {
        Self {
            channel: message.channel.clone(),
            chat_id: message.chat_id.clone(),
            text: text.to_string(),
            reply_to: Some(message.id.clone()),
            mentions: Vec::new(),
        }
    }

    pub fn with_mentions(mut self, mentions: Vec<String>) -> Self {
        self.mentions = mentions;
        self
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<InboundMessage>,
    outbound: broadcast::Sender<OutboundMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_CAPACITY);

        Self {
            inbound: inbound_tx,
            outbound: outbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, message: InboundMessage) -> anyhow::Result<()> {
        tracing::debug!(trace_id = %message.trace_id, chat = %message.chat_id, "inbound published");
        self.inbound.send(message)?;
        Ok(())
    }

    pub fn outbound_sender(&self) -> broadcast::Sender<OutboundMessage> {
        self.outbound.clone()
    }

    pub fn outbound_subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
