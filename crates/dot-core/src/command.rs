//! Command descriptors: metadata, gating and per-caller cooldowns

use crate::error::{CommandError, DefinitionError};
use crate::CommandContext;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Caller access level, ordered from least to most privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    User,
    Admin,
    SuperUser,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::User, Tier::Admin, Tier::SuperUser];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::User => "user",
            Tier::Admin => "admin",
            Tier::SuperUser => "super-user",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "user" => Ok(Tier::User),
            "admin" => Ok(Tier::Admin),
            "super-user" | "superuser" | "super_user" => Ok(Tier::SuperUser),
            other => anyhow::bail!("unknown tier '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[default]
    Both,
    Group,
    Private,
}

impl ChatType {
    pub fn of_chat(chat_id: &str) -> Self {
        if dot_ipc::is_group_chat(chat_id) {
            ChatType::Group
        } else {
            ChatType::Private
        }
    }

    /// A restriction is compatible with a chat kind when either side is `Both` or they match
    pub fn allows(&self, chat: ChatType) -> bool {
        matches!((self, chat), (ChatType::Both, _) | (_, ChatType::Both)) || *self == chat
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Both => "both",
            ChatType::Group => "group",
            ChatType::Private => "private",
        }
    }

    pub(crate) fn scope_label(&self) -> &'static str {
        match self {
            ChatType::Both => "all chats",
            ChatType::Group => "groups",
            ChatType::Private => "private chats",
        }
    }
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "both" | "any" => Ok(ChatType::Both),
            "group" | "groups" => Ok(ChatType::Group),
            "private" | "dm" => Ok(ChatType::Private),
            other => anyhow::bail!("unknown chat type '{}'", other),
        }
    }
}

/// Read-only projection of a descriptor, safe to hand out for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMeta {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: String,
    pub category: String,
    pub chat_type: ChatType,
    pub permissions: Vec<Tier>,
    pub cooldown_secs: u64,
    pub example: String,
}

impl CommandMeta {
    pub fn allows_tier(&self, tier: Tier) -> bool {
        self.permissions.contains(&tier)
    }

    /// Example text with `{prefix}` replaced by the live prefix
    pub fn example_for(&self, prefix: &str) -> String {
        self.example.replace("{prefix}", prefix)
    }

    pub fn super_user_only(&self) -> bool {
        self.permissions == [Tier::SuperUser]
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn run(&self, ctx: CommandContext) -> anyhow::Result<Option<String>>;
}

/// Adapts an async closure into a [`CommandHandler`]
pub struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(CommandContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
{
    async fn run(&self, ctx: CommandContext) -> anyhow::Result<Option<String>> {
        (self.func)(ctx).await
    }
}

pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn CommandHandler>
where
    F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
{
    Arc::new(FnHandler { func })
}

/// Last-invocation stamps per caller. Entries expire lazily; nothing is scheduled.
#[derive(Debug)]
pub struct CooldownTable {
    window: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl CooldownTable {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Checks the caller against the window and stamps `now` on success.
    ///
    /// Check and stamp happen under one lock so two concurrent invocations by the
    /// same caller cannot both pass. On rejection returns the remaining whole seconds,
    /// rounded up.
    pub fn try_stamp(&self, caller: &str, now: Instant) -> Result<(), u64> {
        if self.window.is_zero() {
            return Ok(());
        }

        let mut entries = self.entries.lock();
        if let Some(last) = entries.get(caller) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.window {
                let remaining_ms = (self.window - elapsed).as_millis() as u64;
                return Err(remaining_ms.div_ceil(1000));
            }
        }

        let window = self.window;
        entries.retain(|_, last| now.saturating_duration_since(*last) < window);
        entries.insert(caller.to_string(), now);
        Ok(())
    }

    pub fn remaining(&self, caller: &str, now: Instant) -> Option<Duration> {
        let entries = self.entries.lock();
        let last = entries.get(caller)?;
        let elapsed = now.saturating_duration_since(*last);
        (elapsed < self.window).then(|| self.window - elapsed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One registered command. Metadata never changes after construction;
/// a reload builds a fresh descriptor with a fresh cooldown table.
pub struct CommandDescriptor {
    meta: CommandMeta,
    handler: Arc<dyn CommandHandler>,
    cooldowns: CooldownTable,
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl CommandDescriptor {
    pub fn builder(name: &str) -> CommandBuilder {
        CommandBuilder::new(name)
    }

    /// Validates `meta` and pairs it with `handler`
    pub fn from_parts(
        meta: CommandMeta,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Self, DefinitionError> {
        let mut builder = CommandBuilder::new(&meta.name)
            .aliases(meta.aliases.iter().map(String::as_str))
            .description(&meta.description)
            .category(&meta.category)
            .chat_type(meta.chat_type)
            .permissions(meta.permissions.iter().copied())
            .cooldown_secs(meta.cooldown_secs)
            .example(&meta.example);
        builder.handler = Some(handler);
        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.meta.aliases
    }

    pub fn category(&self) -> &str {
        &self.meta.category
    }

    pub fn chat_type(&self) -> ChatType {
        self.meta.chat_type
    }

    pub fn permissions(&self) -> &[Tier] {
        &self.meta.permissions
    }

    pub fn meta(&self) -> &CommandMeta {
        &self.meta
    }

    pub fn summary(&self) -> CommandMeta {
        self.meta.clone()
    }

    pub fn handler(&self) -> Arc<dyn CommandHandler> {
        Arc::clone(&self.handler)
    }

    pub fn cooldowns(&self) -> &CooldownTable {
        &self.cooldowns
    }

    /// Runs the gates in order: permission, chat type, cooldown.
    /// A passing cooldown gate stamps the caller.
    pub fn admit(
        &self,
        caller: &str,
        tier: Tier,
        chat_id: &str,
        now: Instant,
    ) -> Result<(), CommandError> {
        if !self.meta.allows_tier(tier) {
            return Err(CommandError::PermissionDenied {
                required: self.meta.permissions.clone(),
                actual: tier,
            });
        }

        if !self.meta.chat_type.allows(ChatType::of_chat(chat_id)) {
            return Err(CommandError::WrongChatType {
                allowed: self.meta.chat_type,
            });
        }

        self.cooldowns
            .try_stamp(caller, now)
            .map_err(|remaining_secs| CommandError::CooldownActive { remaining_secs })
    }

    pub async fn execute(&self, ctx: CommandContext) -> Result<Option<String>, CommandError> {
        self.execute_at(ctx, Instant::now()).await
    }

    pub async fn execute_at(
        &self,
        ctx: CommandContext,
        now: Instant,
    ) -> Result<Option<String>, CommandError> {
        self.admit(&ctx.message.sender, ctx.tier, &ctx.message.chat_id, now)?;
        debug!(command = %self.meta.name, sender = %ctx.message.sender, tier = %ctx.tier, "command admitted");
        self.handler
            .run(ctx)
            .await
            .map_err(CommandError::HandlerFailure)
    }
}

pub struct CommandBuilder {
    name: String,
    aliases: Vec<String>,
    description: String,
    category: String,
    chat_type: ChatType,
    permissions: Vec<Tier>,
    cooldown_secs: u64,
    example: String,
    handler: Option<Arc<dyn CommandHandler>>,
}

impl CommandBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim().to_lowercase(),
            aliases: Vec::new(),
            description: String::new(),
            category: "general".to_string(),
            chat_type: ChatType::Both,
            permissions: vec![Tier::User],
            cooldown_secs: 0,
            example: String::new(),
            handler: None,
        }
    }

    pub fn aliases<'a>(mut self, aliases: impl IntoIterator<Item = &'a str>) -> Self {
        self.aliases = aliases
            .into_iter()
            .map(|alias| alias.trim().to_lowercase())
            .collect();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        let category = category.trim();
        if !category.is_empty() {
            self.category = category.to_string();
        }
        self
    }

    pub fn chat_type(mut self, chat_type: ChatType) -> Self {
        self.chat_type = chat_type;
        self
    }

    pub fn permissions(mut self, tiers: impl IntoIterator<Item = Tier>) -> Self {
        self.permissions = tiers.into_iter().collect();
        self
    }

    pub fn cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    pub fn example(mut self, example: &str) -> Self {
        self.example = example.to_string();
        self
    }

    pub fn handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn handler_fn<F, Fut>(self, func: F) -> Self
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
    {
        self.handler(handler_fn(func))
    }

    pub fn build(self) -> Result<CommandDescriptor, DefinitionError> {
        if self.name.is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(DefinitionError::InvalidName(self.name));
        }
        if self.permissions.is_empty() {
            return Err(DefinitionError::NoPermissions(self.name));
        }

        let mut aliases: Vec<String> = Vec::with_capacity(self.aliases.len());
        for alias in self.aliases {
            if alias.is_empty() || alias.chars().any(char::is_whitespace) {
                return Err(DefinitionError::InvalidAlias {
                    name: self.name,
                    alias,
                });
            }
            if alias != self.name && !aliases.contains(&alias) {
                aliases.push(alias);
            }
        }

        let mut permissions: Vec<Tier> = Vec::with_capacity(self.permissions.len());
        for tier in self.permissions {
            if !permissions.contains(&tier) {
                permissions.push(tier);
            }
        }

        let Some(handler) = self.handler else {
            return Err(DefinitionError::MissingHandler(self.name));
        };

        Ok(CommandDescriptor {
            cooldowns: CooldownTable::new(Duration::from_secs(self.cooldown_secs)),
            meta: CommandMeta {
                name: self.name,
                aliases,
                description: self.description,
                category: self.category,
                chat_type: self.chat_type,
                permissions,
                cooldown_secs: self.cooldown_secs,
                example: self.example,
            },
            handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context_for, TestBed};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PRIVATE_CHAT: &str = "15550001111@s.whatsapp.net";
    const GROUP_CHAT: &str = "1203630001@g.us";

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn CommandHandler> {
        handler_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some("ran".to_string()))
            }
        })
    }

    fn tagall(counter: Arc<AtomicUsize>) -> CommandDescriptor {
        CommandDescriptor::builder("tagall")
            .aliases(["everyone", "mentionall", "alert"])
            .category("group")
            .chat_type(ChatType::Group)
            .permissions([Tier::Admin, Tier::SuperUser])
            .cooldown_secs(30)
            .handler(counting(counter))
            .build()
            .expect("valid descriptor")
    }

    #[test]
    fn builder_applies_defaults() {
        let cmd = CommandDescriptor::builder("Echo")
            .handler_fn(|_ctx| async { Ok(None) })
            .build()
            .expect("build");
        assert_eq!(cmd.name(), "echo");
        assert!(cmd.aliases().is_empty());
        assert_eq!(cmd.category(), "general");
        assert_eq!(cmd.chat_type(), ChatType::Both);
        assert_eq!(cmd.permissions(), &[Tier::User]);
        assert_eq!(cmd.meta().cooldown_secs, 0);
        assert_eq!(cmd.meta().description, "");
    }

    #[test]
    fn builder_rejects_empty_name_and_permissions() {
        assert!(matches!(
            CommandDescriptor::builder("  ").build(),
            Err(DefinitionError::EmptyName)
        ));
        assert!(matches!(
            CommandDescriptor::builder("x")
                .permissions(Vec::new())
                .build(),
            Err(DefinitionError::NoPermissions(_))
        ));
        assert!(matches!(
            CommandDescriptor::builder("x").aliases(["a b"]).build(),
            Err(DefinitionError::InvalidAlias { .. })
        ));
    }

    #[test]
    fn builder_requires_a_handler() {
        assert!(matches!(
            CommandDescriptor::builder("ghost").build(),
            Err(DefinitionError::MissingHandler(name)) if name == "ghost"
        ));
    }

    #[test]
    fn builder_drops_self_alias_and_duplicates() {
        let cmd = CommandDescriptor::builder("ping")
            .aliases(["P", "ping", "p", "latency"])
            .permissions([Tier::User, Tier::User, Tier::Admin])
            .build()
            .expect("build");
        assert_eq!(cmd.aliases(), &["p".to_string(), "latency".to_string()]);
        assert_eq!(cmd.permissions(), &[Tier::User, Tier::Admin]);
    }

    #[test]
    fn tier_serde_names() {
        let json = serde_json::to_string(&Tier::SuperUser).expect("serialize");
        assert_eq!(json, "\"super-user\"");
        let tier: Tier = "super-user".parse().expect("parse");
        assert_eq!(tier, Tier::SuperUser);
        assert!("root".parse::<Tier>().is_err());
    }

    #[test]
    fn chat_type_compatibility() {
        assert!(ChatType::Both.allows(ChatType::Group));
        assert!(ChatType::Group.allows(ChatType::Group));
        assert!(!ChatType::Group.allows(ChatType::Private));
        assert!(!ChatType::Private.allows(ChatType::Group));
        assert!(ChatType::Private.allows(ChatType::Both));
        assert_eq!(ChatType::of_chat(GROUP_CHAT), ChatType::Group);
        assert_eq!(ChatType::of_chat(PRIVATE_CHAT), ChatType::Private);
    }

    #[test]
    fn cooldown_rounds_remaining_up() {
        let table = CooldownTable::new(Duration::from_secs(10));
        let start = Instant::now();
        assert!(table.try_stamp("u", start).is_ok());
        assert_eq!(
            table.try_stamp("u", start + Duration::from_millis(1)),
            Err(10)
        );
        assert_eq!(
            table.try_stamp("u", start + Duration::from_millis(8_500)),
            Err(2)
        );
        assert!(table.try_stamp("u", start + Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn cooldown_is_per_caller_and_purges_expired() {
        let table = CooldownTable::new(Duration::from_secs(5));
        let start = Instant::now();
        assert!(table.try_stamp("a", start).is_ok());
        assert!(table.try_stamp("b", start).is_ok());
        assert_eq!(table.len(), 2);
        assert!(table.try_stamp("c", start + Duration::from_secs(6)).is_ok());
        assert_eq!(table.len(), 1);
        assert!(table.remaining("a", start + Duration::from_secs(6)).is_none());
    }

    #[test]
    fn zero_cooldown_never_blocks() {
        let table = CooldownTable::new(Duration::ZERO);
        let now = Instant::now();
        assert!(table.try_stamp("u", now).is_ok());
        assert!(table.try_stamp("u", now).is_ok());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn ping_runs_for_user_in_private_chat() {
        let bed = TestBed::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let ping = CommandDescriptor::builder("ping")
            .permissions(Tier::ALL)
            .handler(counting(Arc::clone(&counter)))
            .build()
            .expect("build");

        let ctx = context_for(&bed, "u1@s.whatsapp.net", PRIVATE_CHAT, Tier::User);
        let reply = ping.execute(ctx).await.expect("no gate error");
        assert_eq!(reply.as_deref(), Some("ran"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tagall_denies_user_in_group() {
        let bed = TestBed::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let cmd = tagall(Arc::clone(&counter));

        let ctx = context_for(&bed, "u1@s.whatsapp.net", GROUP_CHAT, Tier::User);
        let err = cmd.execute(ctx).await.expect_err("denied");
        assert!(matches!(
            err,
            CommandError::PermissionDenied {
                actual: Tier::User,
                ..
            }
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(cmd.cooldowns().is_empty());
    }

    #[tokio::test]
    async fn tagall_rejects_private_chat_for_admin() {
        let bed = TestBed::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let cmd = tagall(Arc::clone(&counter));

        let ctx = context_for(&bed, "a1@s.whatsapp.net", PRIVATE_CHAT, Tier::Admin);
        let err = cmd.execute(ctx).await.expect_err("wrong chat");
        assert!(matches!(
            err,
            CommandError::WrongChatType {
                allowed: ChatType::Group
            }
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tagall_cooldown_blocks_then_reopens() {
        let bed = TestBed::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let cmd = tagall(Arc::clone(&counter));
        let start = Instant::now();

        let first = context_for(&bed, "a1@s.whatsapp.net", GROUP_CHAT, Tier::Admin);
        assert!(cmd.execute_at(first, start).await.is_ok());

        let second = context_for(&bed, "a1@s.whatsapp.net", GROUP_CHAT, Tier::Admin);
        let err = cmd
            .execute_at(second, start + Duration::from_secs(1))
            .await
            .expect_err("cooldown");
        match err {
            CommandError::CooldownActive { remaining_secs } => {
                assert!((29..=30).contains(&remaining_secs))
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let other_caller = context_for(&bed, "a2@s.whatsapp.net", GROUP_CHAT, Tier::Admin);
        assert!(cmd
            .execute_at(other_caller, start + Duration::from_secs(1))
            .await
            .is_ok());

        let third = context_for(&bed, "a1@s.whatsapp.net", GROUP_CHAT, Tier::Admin);
        assert!(cmd
            .execute_at(third, start + Duration::from_secs(30))
            .await
            .is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failing_handler_still_stamps_cooldown() {
        let bed = TestBed::new();
        let cmd = CommandDescriptor::builder("boom")
            .cooldown_secs(10)
            .handler_fn(|_ctx| async { Err(anyhow::anyhow!("exploded")) })
            .build()
            .expect("build");
        let now = Instant::now();

        let ctx = context_for(&bed, "u1@s.whatsapp.net", PRIVATE_CHAT, Tier::User);
        let err = cmd.execute_at(ctx, now).await.expect_err("handler error");
        assert!(matches!(err, CommandError::HandlerFailure(_)));
        assert!(cmd.cooldowns().remaining("u1@s.whatsapp.net", now).is_some());
    }
}
