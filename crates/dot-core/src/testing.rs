//! Shared fixtures for unit tests

use crate::chats::ChatBook;
use crate::command::Tier;
use crate::context::{BotInfo, BotServices, CommandContext};
use crate::dispatch::{DispatchSettings, Dispatcher, Replier};
use crate::handlers::builtin_commands;
use crate::permissions::{AdminStore, GroupDirectory, PermissionResolver, StaticGroupDirectory};
use crate::registry::CommandRegistry;
use anyhow::Result;
use async_trait::async_trait;
use dot_config::{BotConfig, Config};
use dot_ipc::{InboundMessage, OutboundMessage};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Keeps every outbound message instead of sending it
#[derive(Default)]
pub struct RecordingReplier {
    sent: Mutex<Vec<OutboundMessage>>,
}

#[async_trait]
impl Replier for RecordingReplier {
    async fn send(&self, outbound: OutboundMessage) -> Result<()> {
        self.sent.lock().push(outbound);
        Ok(())
    }
}

pub struct TestBed {
    pub services: Arc<BotServices>,
    replier: Arc<RecordingReplier>,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_groups(Arc::new(StaticGroupDirectory::new()))
    }

    pub fn with_groups(groups: Arc<dyn GroupDirectory>) -> Self {
        let replier = Arc::new(RecordingReplier::default());
        let permissions = PermissionResolver::new(
            AdminStore::in_memory(Vec::new()),
            Arc::clone(&groups),
            Duration::from_secs(300),
        );
        let services = BotServices {
            bot: BotInfo::from_config(&BotConfig::default()),
            registry: CommandRegistry::new(),
            permissions: Arc::new(permissions),
            groups,
            source: Arc::new(builtin_commands()),
            replier: Arc::clone(&replier) as Arc<dyn Replier>,
            chats: Arc::new(ChatBook::new()),
        };
        Self {
            services: Arc::new(services),
            replier,
        }
    }

    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings::from_config(&Config::default())
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.services), self.settings())
    }

    pub fn outbound(&self) -> Vec<OutboundMessage> {
        self.replier.sent.lock().clone()
    }

    pub fn sent(&self) -> Vec<(String, Vec<String>)> {
        self.outbound()
            .into_iter()
            .map(|out| (out.text, out.mentions))
            .collect()
    }

    pub fn replies(&self) -> Vec<String> {
        self.sent().into_iter().map(|(text, _)| text).collect()
    }
}

pub fn context_for(bed: &TestBed, sender: &str, chat_id: &str, tier: Tier) -> CommandContext {
    CommandContext {
        message: InboundMessage::new("whatsapp", sender, chat_id, "$test"),
        invoked_as: "test".to_string(),
        args: Vec::new(),
        tier,
        services: Arc::clone(&bed.services),
    }
}
