//! Inbound message pipeline: screen, parse, resolve, gate, run, reply

use crate::error::CommandError;
use crate::context::{BotServices, CommandContext};
use crate::conversation::Conversation;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dot_config::Config;
use dot_ipc::{now_unix_secs, InboundMessage, OutboundMessage};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use unicode_normalization::UnicodeNormalization;

pub const EMPTY_COMMAND_REPLY: &str = "Please enter a command after the prefix.";

/// Delivery of outbound text, either back to the originating chat or to any chat
#[async_trait]
pub trait Replier: Send + Sync {
    async fn send(&self, outbound: OutboundMessage) -> Result<()>;

    async fn reply(&self, message: &InboundMessage, text: &str) -> Result<()> {
        self.send(OutboundMessage::reply_to(message, text)).await
    }

    async fn reply_with_mentions(
        &self,
        message: &InboundMessage,
        text: &str,
        mentions: Vec<String>,
    ) -> Result<()> {
        self.send(OutboundMessage::reply_to(message, text).with_mentions(mentions))
            .await
    }
}

/// Publishes on the outbound side of the event bus
pub struct BusReplier {
    outbound: broadcast::Sender<OutboundMessage>,
}

impl BusReplier {
    pub fn new(outbound: broadcast::Sender<OutboundMessage>) -> Self {
        Self { outbound }
    }
}

#[async_trait]
impl Replier for BusReplier {
    async fn send(&self, outbound: OutboundMessage) -> Result<()> {
        if outbound.text.trim().is_empty() {
            warn!("Attempted to send empty message to {}", outbound.chat_id);
            return Ok(());
        }
        self.outbound
            .send(outbound)
            .map(|_| ())
            .map_err(|e| anyhow!("no outbound subscriber: {}", e))
    }
}

fn is_stripped(c: char) -> bool {
    matches!(
        c,
        '\u{0300}'..='\u{036f}' | '\u{200b}'..='\u{200d}' | '\u{feff}' | '\u{2060}'
    )
}

/// NFKC, then drops combining marks and zero-width characters, lower-cased
pub fn normalize_command_name(token: &str) -> String {
    token
        .nfkc()
        .filter(|c| !is_stripped(*c) && !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Normalized; empty when nothing follows the prefix
    pub name: String,
    /// As typed
    pub args: Vec<String>,
}

/// `None` when the raw body does not start with the prefix
pub fn parse_command(body: &str, prefix: &str) -> Option<ParsedCommand> {
    if prefix.is_empty() {
        return None;
    }
    let rest = body.strip_prefix(prefix)?;
    let mut parts = rest.split_whitespace();
    let name = parts.next().map(normalize_command_name).unwrap_or_default();
    Some(ParsedCommand {
        name,
        args: parts.map(str::to_string).collect(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    EmptyBody,
    Broadcast,
    SelfMessage,
    Stale,
    NoPrefix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ignored(IgnoreReason),
    Replied(String),
    /// Handled without a reply
    Silent,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub prefix: String,
    pub listen_to_self: bool,
    pub max_message_age_secs: u64,
    pub apology: String,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefix: config.bot.prefix.clone(),
            listen_to_self: config.bot.listen_to_self,
            max_message_age_secs: config.bot.max_message_age_secs,
            apology: config.bot.apology.clone(),
        }
    }
}

pub struct Dispatcher {
    services: Arc<BotServices>,
    settings: DispatchSettings,
    conversation: Option<Arc<Conversation>>,
}

impl Dispatcher {
    pub fn new(services: Arc<BotServices>, settings: DispatchSettings) -> Self {
        Self {
            services,
            settings,
            conversation: None,
        }
    }

    pub fn with_conversation(mut self, conversation: Arc<Conversation>) -> Self {
        self.conversation = Some(conversation);
        self
    }

    pub fn services(&self) -> &Arc<BotServices> {
        &self.services
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    fn screen(&self, message: &InboundMessage, now_unix: u64) -> Option<IgnoreReason> {
        if message.body.trim().is_empty() {
            return Some(IgnoreReason::EmptyBody);
        }
        if message.is_broadcast() {
            return Some(IgnoreReason::Broadcast);
        }
        if message.from_me && !self.settings.listen_to_self {
            return Some(IgnoreReason::SelfMessage);
        }
        let max_age = self.settings.max_message_age_secs;
        if max_age > 0 && message.age_secs(now_unix) > max_age {
            return Some(IgnoreReason::Stale);
        }
        None
    }

    pub async fn dispatch(&self, message: InboundMessage) -> DispatchOutcome {
        self.dispatch_at(message, now_unix_secs()).await
    }

    pub async fn dispatch_at(&self, message: InboundMessage, now_unix: u64) -> DispatchOutcome {
        if let Some(reason) = self.screen(&message, now_unix) {
            debug!(trace_id = %message.trace_id, ?reason, "inbound message ignored");
            return DispatchOutcome::Ignored(reason);
        }
        self.services.chats.record(&message);

        let received_at = Instant::now();
        let Some(parsed) = parse_command(&message.body, &self.settings.prefix) else {
            return self.converse(message, received_at).await;
        };

        info!(
            trace_id = %message.trace_id,
            command = %parsed.name,
            sender = %message.sender,
            from_me = message.from_me,
            "command received"
        );

        if parsed.name.is_empty() {
            return self
                .deliver(&message, EMPTY_COMMAND_REPLY.to_string(), received_at)
                .await;
        }

        let Some(descriptor) = self.services.registry.get(&parsed.name) else {
            let not_found = CommandError::CommandNotFound {
                name: parsed.name,
                prefix: self.settings.prefix.clone(),
            };
            return self
                .deliver(&message, not_found.to_string(), received_at)
                .await;
        };

        let tier = self.services.permissions.resolve(&message).await;
        debug!(sender = %message.sender, %tier, "permission resolved");

        let ctx = CommandContext {
            message: message.clone(),
            invoked_as: parsed.name,
            args: parsed.args,
            tier,
            services: Arc::clone(&self.services),
        };

        match descriptor.execute(ctx).await {
            Ok(Some(text)) if !text.trim().is_empty() => {
                self.deliver(&message, text, received_at).await
            }
            Ok(_) => DispatchOutcome::Silent,
            Err(gate) if gate.is_gate() => {
                debug!(command = %descriptor.name(), "gate rejected: {}", gate);
                self.deliver(&message, gate.to_string(), received_at).await
            }
            Err(e) => {
                error!(
                    trace_id = %message.trace_id,
                    command = %descriptor.name(),
                    sender = %message.sender,
                    "Command failed: {}",
                    e
                );
                self.deliver(&message, self.settings.apology.clone(), received_at)
                    .await
            }
        }
    }

    async fn converse(&self, message: InboundMessage, received_at: Instant) -> DispatchOutcome {
        let Some(conversation) = &self.conversation else {
            return DispatchOutcome::Ignored(IgnoreReason::NoPrefix);
        };
        match conversation.respond(&message).await {
            Some(text) => self.deliver(&message, text, received_at).await,
            None => DispatchOutcome::Silent,
        }
    }

    async fn deliver(
        &self,
        message: &InboundMessage,
        text: String,
        received_at: Instant,
    ) -> DispatchOutcome {
        if let Err(e) = self.services.replier.reply(message, &text).await {
            warn!(trace_id = %message.trace_id, "Failed to send reply to {}: {:#}", message.chat_id, e);
        } else {
            info!(
                "Reply to {} - Latency: {:.2}s",
                message.sender,
                received_at.elapsed().as_secs_f64()
            );
        }
        DispatchOutcome::Replied(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ChatType, CommandDescriptor, Tier};
    use crate::testing::TestBed;

    const USER: &str = "15550003333@s.whatsapp.net";
    const GROUP: &str = "1203630001@g.us";

    fn message(body: &str) -> InboundMessage {
        InboundMessage::new("whatsapp", USER, USER, body)
    }

    fn register_basics(bed: &TestBed) {
        bed.services.registry.register(
            CommandDescriptor::builder("ping")
                .aliases(["p"])
                .permissions(Tier::ALL)
                .handler_fn(|ctx| async move { Ok(Some(format!("Pong {}", ctx.args.join(",")))) })
                .build()
                .expect("ping"),
        );
        bed.services.registry.register(
            CommandDescriptor::builder("tagall")
                .chat_type(ChatType::Group)
                .permissions([Tier::Admin, Tier::SuperUser])
                .cooldown_secs(30)
                .handler_fn(|_ctx| async { Ok(Some("tagged".to_string())) })
                .build()
                .expect("tagall"),
        );
        bed.services.registry.register(
            CommandDescriptor::builder("quiet")
                .handler_fn(|_ctx| async { Ok(None) })
                .build()
                .expect("quiet"),
        );
        bed.services.registry.register(
            CommandDescriptor::builder("boom")
                .handler_fn(|_ctx| async { Err(anyhow::anyhow!("kaboom")) })
                .build()
                .expect("boom"),
        );
    }

    #[test]
    fn command_names_lose_marks_and_zero_width() {
        assert_eq!(normalize_command_name("pi\u{200b}ng"), "ping");
        assert_eq!(normalize_command_name("ｐｉｎｇ"), "ping");
        assert_eq!(normalize_command_name("HELP\u{2060}"), "help");
        assert_eq!(normalize_command_name("\u{feff}ping"), "ping");
        assert_eq!(
            parse_command("$ta\u{200b}gall now", "$").map(|p| p.name),
            Some("tagall".to_string())
        );
    }

    #[test]
    fn arguments_pass_through_as_typed() {
        let parsed = parse_command("$tagall 2^3 ~ok `code` Ｗｉｄｅ ca\u{0301}fe\u{200b}", "$")
            .expect("prefixed");
        assert_eq!(parsed.name, "tagall");
        assert_eq!(
            parsed.args,
            vec![
                "2^3".to_string(),
                "~ok".to_string(),
                "`code`".to_string(),
                "Ｗｉｄｅ".to_string(),
                "ca\u{0301}fe\u{200b}".to_string(),
            ]
        );
    }

    #[test]
    fn parse_splits_and_lowercases() {
        let parsed = parse_command("$PING  a   B", "$").expect("prefixed");
        assert_eq!(parsed.name, "ping");
        assert_eq!(parsed.args, vec!["a".to_string(), "B".to_string()]);

        let empty = parse_command("$   ", "$").expect("prefixed");
        assert!(empty.name.is_empty());

        assert!(parse_command("ping", "$").is_none());
        assert!(parse_command(" $ping", "$").is_none());
        assert_eq!(
            parse_command("!!help me", "!!").map(|p| p.name),
            Some("help".to_string())
        );
    }

    #[tokio::test]
    async fn runs_command_and_replies() {
        let bed = TestBed::new();
        register_basics(&bed);
        let outcome = bed.dispatcher().dispatch(message("$P x y")).await;
        assert_eq!(outcome, DispatchOutcome::Replied("Pong x,y".to_string()));
        assert_eq!(bed.replies(), vec!["Pong x,y".to_string()]);
    }

    #[tokio::test]
    async fn empty_command_and_unknown_command() {
        let bed = TestBed::new();
        register_basics(&bed);
        let d = bed.dispatcher();
        assert_eq!(
            d.dispatch(message("$")).await,
            DispatchOutcome::Replied(EMPTY_COMMAND_REPLY.to_string())
        );
        assert_eq!(
            d.dispatch(message("$nope")).await,
            DispatchOutcome::Replied(
                "❓ Command not found. Use $help for available commands.".to_string()
            )
        );
    }

    #[tokio::test]
    async fn gate_errors_are_replied_verbatim() {
        let bed = TestBed::new();
        register_basics(&bed);
        let d = bed.dispatcher();

        let denied = d
            .dispatch(InboundMessage::new("whatsapp", USER, GROUP, "$tagall"))
            .await;
        assert_eq!(
            denied,
            DispatchOutcome::Replied("🚫 Requires: admin or super-user (you are: user)".to_string())
        );

        let wrong_chat = d.dispatch(message("$tagall").from_me(true)).await;
        assert_eq!(
            wrong_chat,
            DispatchOutcome::Replied("⚠️ This command works in groups only".to_string())
        );

        let own_group = || InboundMessage::new("whatsapp", USER, GROUP, "$tagall").from_me(true);
        assert_eq!(
            d.dispatch(own_group()).await,
            DispatchOutcome::Replied("tagged".to_string())
        );
        assert_eq!(
            d.dispatch(own_group()).await,
            DispatchOutcome::Replied("⏳ Wait 30s before using again".to_string())
        );
    }

    #[tokio::test]
    async fn admitted_messages_are_remembered_as_chats() {
        let bed = TestBed::new();
        register_basics(&bed);
        let d = bed.dispatcher();
        d.dispatch(message("$ping")).await;
        d.dispatch(InboundMessage::new("whatsapp", USER, GROUP, "hello all")).await;
        d.dispatch(InboundMessage::new("whatsapp", USER, "status@broadcast", "story")).await;
        d.dispatch(InboundMessage::new("whatsapp", USER, "other@s.whatsapp.net", "  ")).await;

        let chats = &bed.services.chats;
        assert_eq!(chats.len(), 2);
        assert_eq!(chats.group_chats()[0].chat_id, GROUP);
        assert_eq!(chats.private_chats().len(), 1);
    }

    #[tokio::test]
    async fn handler_failure_gets_apology() {
        let bed = TestBed::new();
        register_basics(&bed);
        let outcome = bed.dispatcher().dispatch(message("$boom")).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Replied(bed.settings().apology.clone())
        );
    }

    #[tokio::test]
    async fn none_result_stays_silent() {
        let bed = TestBed::new();
        register_basics(&bed);
        assert_eq!(
            bed.dispatcher().dispatch(message("$quiet")).await,
            DispatchOutcome::Silent
        );
        assert!(bed.replies().is_empty());
    }

    #[tokio::test]
    async fn screening_drops_noise() {
        let bed = TestBed::new();
        register_basics(&bed);
        let d = bed.dispatcher();
        let now = now_unix_secs();

        assert_eq!(
            d.dispatch_at(message("   "), now).await,
            DispatchOutcome::Ignored(IgnoreReason::EmptyBody)
        );
        assert_eq!(
            d.dispatch_at(InboundMessage::new("whatsapp", USER, "status@broadcast", "$ping"), now)
                .await,
            DispatchOutcome::Ignored(IgnoreReason::Broadcast)
        );
        assert_eq!(
            d.dispatch_at(message("$ping").with_timestamp(now - 61), now)
                .await,
            DispatchOutcome::Ignored(IgnoreReason::Stale)
        );
        assert_eq!(
            d.dispatch_at(message("hello there"), now).await,
            DispatchOutcome::Ignored(IgnoreReason::NoPrefix)
        );
        assert!(bed.replies().is_empty());
    }

    #[tokio::test]
    async fn self_messages_respect_listen_to_self() {
        let bed = TestBed::new();
        register_basics(&bed);
        let mut settings = bed.settings();
        settings.listen_to_self = false;
        let d = Dispatcher::new(Arc::clone(&bed.services), settings);
        assert_eq!(
            d.dispatch(message("$ping").from_me(true)).await,
            DispatchOutcome::Ignored(IgnoreReason::SelfMessage)
        );
    }
}
