//! Dot Core
//!
//! Command engine runtime: registry, permission gates, hot reload and dispatch

pub mod chats;
pub mod command;
pub mod context;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod loader;
pub mod permissions;
pub mod registry;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use chats::{ChatBook, KnownChat};
pub use command::{
    handler_fn, ChatType, CommandBuilder, CommandDescriptor, CommandHandler, CommandMeta,
    CooldownTable, Tier,
};
pub use context::{BotInfo, BotServices, CommandContext};
pub use conversation::Conversation;
pub use dispatch::{
    parse_command, BusReplier, DispatchOutcome, DispatchSettings, Dispatcher, IgnoreReason,
    ParsedCommand, Replier,
};
pub use error::{CommandError, DefinitionError, ReloadError};
pub use handlers::{builtin_commands, builtin_handlers};
pub use loader::{
    CommandLoader, CommandSource, DirectoryCommandSource, HandlerTable, ReloadReport,
    ScannedUnits, StaticCommandSource, TomlCommandLoader,
};
pub use permissions::{
    AdminStore, GroupDirectory, GroupParticipant, ParticipantRole, PermissionResolver,
    StaticGroupDirectory,
};
pub use registry::{CommandRegistry, RegistryStats};
pub use watcher::{spawn_watcher, WatcherHandle};

use anyhow::Result;
use dot_config::Config;
use dot_ipc::{EventBus, InboundMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A transport that feeds inbound messages into the bus and delivers outbound ones
#[async_trait::async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel_name(&self) -> &str;
    async fn start(&self, event_bus: EventBus) -> Result<()>;
}

type ScopeLocks = Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>;

pub struct DotRuntime {
    config: Config,
    event_bus: EventBus,
    services: Arc<BotServices>,
    dispatcher: Arc<Dispatcher>,
}

impl DotRuntime {
    /// Commands come from the configured directory, handlers from the built-in table
    pub fn new(config: Config, groups: Arc<dyn GroupDirectory>) -> Result<Self> {
        let loader = Arc::new(TomlCommandLoader::new(builtin_handlers()));
        let source = Arc::new(DirectoryCommandSource::new(config.commands_dir(), loader));
        Self::with_source(config, groups, source)
    }

    pub fn with_source(
        config: Config,
        groups: Arc<dyn GroupDirectory>,
        source: Arc<dyn CommandSource>,
    ) -> Result<Self> {
        config.validate()?;

        let event_bus = EventBus::new();
        let permissions = Arc::new(PermissionResolver::from_config(
            &config,
            Arc::clone(&groups),
        ));
        let services = Arc::new(BotServices {
            bot: BotInfo::from_config(&config.bot),
            registry: CommandRegistry::new(),
            permissions,
            groups,
            source,
            replier: Arc::new(BusReplier::new(event_bus.outbound_sender())),
            chats: Arc::new(ChatBook::new()),
        });

        let mut dispatcher =
            Dispatcher::new(Arc::clone(&services), DispatchSettings::from_config(&config));
        if let Some(conversation) = Conversation::from_config(&config)? {
            info!("Conversation fallback enabled");
            dispatcher = dispatcher.with_conversation(Arc::new(conversation));
        }

        Ok(Self {
            config,
            event_bus,
            services,
            dispatcher: Arc::new(dispatcher),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn services(&self) -> &Arc<BotServices> {
        &self.services
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.services.registry
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// A source that cannot be read leaves the registry empty; the bot still starts
    pub fn load_commands(&self) -> ReloadReport {
        match self.services.source.load_all(&self.services.registry) {
            Ok(report) => {
                for failed in &report.failed {
                    warn!("Command unit {} not loaded: {}", failed.unit, failed.error);
                }
                report
            }
            Err(e) => {
                error!(
                    "Failed to load commands from {}: {}",
                    self.services.source.describe(),
                    e
                );
                ReloadReport::default()
            }
        }
    }

    pub fn start_watcher(&self, seed: &ReloadReport) -> Option<WatcherHandle> {
        if !self.config.commands.hot_reload {
            return None;
        }
        let (dir, loader) = self.services.source.watch_target()?;
        match spawn_watcher(
            dir,
            loader,
            self.services.registry.clone(),
            Duration::from_millis(self.config.commands.debounce_ms),
            seed,
        ) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Hot reload disabled: {:#}", e);
                None
            }
        }
    }

    /// Runs until the adapter stops or Ctrl-C; in-flight dispatches are awaited
    pub async fn run(&self, adapter: Arc<dyn ChannelAdapter>) -> Result<()> {
        let report = self.load_commands();
        info!(
            "{} v{} ready with {} commands (prefix {})",
            self.services.bot.name,
            self.services.bot.version,
            self.services.registry.len(),
            self.services.bot.prefix
        );
        let _watcher = self.start_watcher(&report);

        let mut inbound_rx = self.event_bus.subscribe();
        let channel = adapter.channel_name().to_string();
        let bus = self.event_bus.clone();
        let mut adapter_task = tokio::spawn(async move { adapter.start(bus).await });
        info!("Channel adapter started: {}", channel);

        let scope_locks: ScopeLocks = Arc::new(Mutex::new(HashMap::new()));
        let semaphore = self
            .config
            .dispatch
            .max_concurrency
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let mut workers = JoinSet::new();
        let mut adapter_done = false;

        loop {
            tokio::select! {
                result = inbound_rx.recv() => {
                    match result {
                        Ok(message) => {
                            self.spawn_dispatch(&mut workers, message, &scope_locks, semaphore.clone());
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Event bus closed, stopping dispatcher");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Event bus lagged by {} messages", n);
                        }
                    }
                }
                finished = &mut adapter_task => {
                    adapter_done = true;
                    match finished {
                        Ok(Ok(())) => info!("Channel adapter {} stopped", channel),
                        Ok(Err(e)) => error!("Channel adapter {} failed: {:#}", channel, e),
                        Err(e) => error!("Channel adapter {} task aborted: {}", channel, e),
                    }
                    break;
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        error!("Dispatch worker failed: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if !adapter_done {
            adapter_task.abort();
        }
        // Messages the adapter published right before stopping
        while let Ok(message) = inbound_rx.try_recv() {
            self.spawn_dispatch(&mut workers, message, &scope_locks, semaphore.clone());
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Dispatch worker failed: {}", e);
            }
        }
        info!("Dot runtime stopped");
        Ok(())
    }

    fn spawn_dispatch(
        &self,
        workers: &mut JoinSet<()>,
        message: InboundMessage,
        scope_locks: &ScopeLocks,
        semaphore: Option<Arc<Semaphore>>,
    ) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let scope_locks = Arc::clone(scope_locks);
        let scope_key = format!("{}:{}", message.channel, message.chat_id);
        let trace_id = message.trace_id.clone();

        workers.spawn(async move {
            let scope_lock = get_or_create_scope_lock(&scope_locks, &scope_key).await;
            let _scope_guard = scope_lock.lock_owned().await;

            let _permit = match semaphore {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(err) => {
                        error!(
                            "Dispatch semaphore closed (trace_id={}): {}",
                            trace_id, err
                        );
                        return;
                    }
                },
                None => None,
            };

            let outcome = dispatcher.dispatch(message).await;
            debug!(trace_id = %trace_id, ?outcome, "dispatch finished");
        });
    }
}

async fn get_or_create_scope_lock(scope_locks: &ScopeLocks, scope_key: &str) -> Arc<Mutex<()>> {
    let mut locks = scope_locks.lock().await;
    locks
        .entry(scope_key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}
