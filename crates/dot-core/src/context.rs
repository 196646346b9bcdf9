use crate::chats::ChatBook;
use crate::command::{ChatType, Tier};
use crate::dispatch::Replier;
use crate::loader::CommandSource;
use crate::permissions::{GroupDirectory, PermissionResolver};
use crate::registry::CommandRegistry;
use chrono::{DateTime, Utc};
use dot_config::BotConfig;
use dot_ipc::{InboundMessage, OutboundMessage};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BotInfo {
    pub name: String,
    pub version: String,
    pub prefix: String,
    pub tagline: String,
    pub started_at: Instant,
    pub started_at_wall: DateTime<Utc>,
}

impl BotInfo {
    pub fn from_config(bot: &BotConfig) -> Self {
        Self {
            name: bot.name.clone(),
            version: bot.version.clone(),
            prefix: bot.prefix.clone(),
            tagline: bot.tagline.clone(),
            started_at: Instant::now(),
            started_at_wall: Utc::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Everything a handler may reach besides its own message
pub struct BotServices {
    pub bot: BotInfo,
    pub registry: CommandRegistry,
    pub permissions: Arc<PermissionResolver>,
    pub groups: Arc<dyn GroupDirectory>,
    pub source: Arc<dyn CommandSource>,
    pub replier: Arc<dyn Replier>,
    pub chats: Arc<ChatBook>,
}

#[derive(Clone)]
pub struct CommandContext {
    pub message: InboundMessage,
    /// Name or alias the caller typed
    pub invoked_as: String,
    pub args: Vec<String>,
    pub tier: Tier,
    pub services: Arc<BotServices>,
}

impl CommandContext {
    pub fn registry(&self) -> &CommandRegistry {
        &self.services.registry
    }

    pub fn bot(&self) -> &BotInfo {
        &self.services.bot
    }

    pub fn chat_type(&self) -> ChatType {
        ChatType::of_chat(&self.message.chat_id)
    }

    pub fn is_group(&self) -> bool {
        self.message.is_group()
    }

    /// Sends an extra message to the originating chat ahead of the handler's return value
    pub async fn reply(&self, text: &str) -> anyhow::Result<()> {
        self.services.replier.reply(&self.message, text).await
    }

    pub async fn reply_with_mentions(&self, text: &str, mentions: Vec<String>) -> anyhow::Result<()> {
        self.services
            .replier
            .reply_with_mentions(&self.message, text, mentions)
            .await
    }

    /// Sends to any chat on the caller's channel
    pub async fn send(&self, outbound: OutboundMessage) -> anyhow::Result<()> {
        self.services.replier.send(outbound).await
    }
}
