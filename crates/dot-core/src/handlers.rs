//! Built-in command handlers
//!
//! Each handler is addressable from a command unit by its key (`handler = "ping"`).
//! [`builtin_commands`] carries the same set with default metadata for deployments
//! without a command directory.

use crate::chats::KnownChat;
use crate::command::{ChatType, CommandHandler, CommandMeta, Tier};
use crate::context::CommandContext;
use crate::loader::{HandlerTable, ReloadReport, StaticCommandSource};
use crate::permissions::{normalize_identity, same_identity};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dot_ipc::OutboundMessage;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━";
const MAX_MENTIONS: usize = 20;
const MAX_REPORT_LINES: usize = 10;
const BROADCAST_PREVIEW: usize = 50;
const BROADCAST_REPORT_LINES: usize = 15;
const MSGALL_LIMIT: usize = 100;
const MSGALLGROUPS_LIMIT: usize = 50;
const MSGALL_PAUSE: Duration = Duration::from_millis(800);
const MSGALLGROUPS_PAUSE: Duration = Duration::from_secs(2);

pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!(
        "{}d {}h {}m {}s",
        secs / 86_400,
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60
    )
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

fn chat_label(ctx: &CommandContext) -> &'static str {
    if ctx.is_group() {
        "Group"
    } else {
        "Private"
    }
}

fn tier_names(tiers: &[Tier], sep: &str) -> String {
    tiers
        .iter()
        .map(Tier::as_str)
        .collect::<Vec<_>>()
        .join(sep)
}

pub struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>> {
        let start = Instant::now();
        ctx.reply("🏓 Pinging...").await?;
        Ok(Some(format!(
            "Pong! Latency: {}ms",
            start.elapsed().as_millis()
        )))
    }
}

pub struct HelpHandler;

impl HelpHandler {
    fn describe(meta: &CommandMeta, prefix: &str) -> String {
        let usage = if meta.example.is_empty() {
            format!("{}{}", prefix, meta.name)
        } else {
            meta.example_for(prefix)
        };
        let aliases = if meta.aliases.is_empty() {
            "none".to_string()
        } else {
            meta.aliases.join(", ")
        };
        format!(
            "*{}*\n{}\n\n*Usage:* {}\n*Category:* {}\n*Cooldown:* {}s\n*Aliases:* {}\n*Permissions:* {}\n*Chat Type:* {}",
            meta.name.to_uppercase(),
            meta.description,
            usage,
            meta.category,
            meta.cooldown_secs,
            aliases,
            tier_names(&meta.permissions, ", "),
            meta.chat_type
        )
    }

    fn overview(ctx: &CommandContext) -> String {
        let bot = ctx.bot();
        let grouped = ctx.registry().list_for_user(ctx.tier, ctx.chat_type());
        if grouped.is_empty() {
            return "No commands available for you.".to_string();
        }

        let mut out = format!("*{} Commands*\nPrefix: {}\n\n", bot.name, bot.prefix);
        let mut total = 0;
        for (category, commands) in &grouped {
            let _ = writeln!(out, "*{}*", category.to_uppercase());
            for meta in commands {
                let _ = write!(out, "• {}{} - {}", bot.prefix, meta.name, meta.description);
                if meta.cooldown_secs > 0 {
                    let _ = write!(out, " ⏱️{}s", meta.cooldown_secs);
                }
                if meta.allows_tier(Tier::SuperUser) && !meta.allows_tier(Tier::User) {
                    out.push_str(" 👑");
                }
                out.push('\n');
            }
            out.push('\n');
            total += commands.len();
        }
        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(out, "📊 Total: {} commands", total);
        let _ = writeln!(out, "ℹ️ Use `{}help [command]` for details", bot.prefix);
        out.push_str("🔑 👑 = Super-user only");
        out
    }
}

#[async_trait]
impl CommandHandler for HelpHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>> {
        let Some(query) = ctx.args.first() else {
            return Ok(Some(Self::overview(&ctx)));
        };

        let Some(command) = ctx.registry().get(query) else {
            let grouped = ctx.registry().list_for_user(ctx.tier, ctx.chat_type());
            let mut out = format!("Command \"{}\" not found.\n\nAvailable commands:\n", query);
            for (category, commands) in grouped {
                let names: Vec<String> = commands
                    .iter()
                    .map(|m| format!("`{}{}`", ctx.bot().prefix, m.name))
                    .collect();
                let _ = writeln!(out, "*{}:* {}", category, names.join(", "));
            }
            return Ok(Some(out));
        };

        let meta = command.meta();
        if !meta.allows_tier(ctx.tier) {
            return Ok(Some(format!(
                "🚫 You need {} permissions",
                tier_names(&meta.permissions, " or ")
            )));
        }
        if !meta.chat_type.allows(ctx.chat_type()) {
            return Ok(Some(format!(
                "⚠️ This command works in {} only",
                meta.chat_type
            )));
        }
        Ok(Some(Self::describe(meta, &ctx.bot().prefix)))
    }
}

pub struct ListHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListFilter {
    Category,
    Permission,
    Cooldown,
    Chat,
    Name,
}

impl ListFilter {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "category" | "cat" => Some(Self::Category),
            "permission" | "perm" => Some(Self::Permission),
            "cooldown" => Some(Self::Cooldown),
            "chat" | "chattype" => Some(Self::Chat),
            "name" => Some(Self::Name),
            _ => None,
        }
    }

    fn matches(&self, meta: &CommandMeta, value: Option<&str>) -> bool {
        let Some(value) = value.map(str::to_lowercase) else {
            return true;
        };
        match self {
            Self::Category => meta.category.to_lowercase().contains(&value),
            Self::Permission => meta.permissions.iter().any(|t| t.as_str().contains(&value)),
            Self::Cooldown => match value.as_str() {
                "none" => meta.cooldown_secs == 0,
                "any" => meta.cooldown_secs > 0,
                other => other
                    .parse::<u64>()
                    .map(|min| meta.cooldown_secs >= min)
                    .unwrap_or(false),
            },
            Self::Chat => meta.chat_type.as_str().contains(&value),
            Self::Name => {
                meta.name.contains(&value) || meta.aliases.iter().any(|a| a.contains(&value))
            }
        }
    }
}

impl ListHandler {
    fn render_group(out: &mut String, prefix: &str, category: &str, commands: &[CommandMeta]) {
        let _ = writeln!(out, "**{}** ({})", category.to_uppercase(), commands.len());
        for meta in commands {
            let _ = write!(out, "• {}{} - {}", prefix, meta.name, meta.description);
            if !meta.example.is_empty() {
                let _ = write!(out, "\n  📝 *Example:* {}", meta.example_for(prefix));
            }
            if meta.cooldown_secs > 0 {
                let _ = write!(out, " ⏱️{}s", meta.cooldown_secs);
            }
            if meta.super_user_only() {
                out.push_str(" 👑");
            }
            out.push('\n');
        }
        out.push('\n');
    }

    fn footer(out: &mut String, prefix: &str, total: usize) {
        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(out, "📊 Total: {} command{}\n", total, plural(total));
        out.push_str("🔍 **Filter Options:**\n");
        let _ = writeln!(out, "• `{}list category` - Show all categories", prefix);
        let _ = writeln!(out, "• `{}list category utility` - Show utility commands", prefix);
        let _ = writeln!(out, "• `{}list permission admin` - Commands for admins", prefix);
        let _ = writeln!(out, "• `{}list cooldown 10` - Commands with ≥10s cooldown", prefix);
        let _ = writeln!(out, "• `{}list chat group` - Group-only commands", prefix);
        let _ = writeln!(out, "• `{}list name ping` - Search by name/alias", prefix);
    }
}

#[async_trait]
impl CommandHandler for ListHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>> {
        let prefix = ctx.bot().prefix.clone();
        let grouped = ctx.registry().list_for_user(ctx.tier, ctx.chat_type());
        if grouped.is_empty() {
            return Ok(Some("No commands available for you.".to_string()));
        }

        let mut out = String::new();
        let Some(raw_filter) = ctx.args.first() else {
            let _ = writeln!(out, "📚 **All Available Commands**\n{}\n", RULE);
            let _ = writeln!(out, "👤 You are: {}", ctx.tier);
            let _ = writeln!(out, "💬 Chat: {}", chat_label(&ctx));
            let _ = writeln!(out, "🔤 Prefix: {}\n", prefix);
            let mut total = 0;
            for (category, commands) in &grouped {
                Self::render_group(&mut out, &prefix, category, commands);
                total += commands.len();
            }
            Self::footer(&mut out, &prefix, total);
            return Ok(Some(out));
        };

        let value = ctx.args.get(1).map(String::as_str);
        let Some(filter) = ListFilter::parse(raw_filter) else {
            return Ok(Some(format!(
                "❌ Unknown filter type. Available: category, permission, cooldown, chat, name\nTry: {p}list category | {p}list permission admin | {p}list cooldown 10",
                p = prefix
            )));
        };

        let _ = writeln!(out, "🔍 **Filtered Commands**\n{}\n", RULE);
        let _ = writeln!(out, "👤 User: {}", ctx.tier);
        let _ = writeln!(out, "💬 Chat: {}", chat_label(&ctx));
        match value {
            Some(v) => {
                let _ = writeln!(out, "🎯 Filter: {} = {}\n", raw_filter, v);
            }
            None => {
                let _ = writeln!(out, "🎯 Filter: {}\n", raw_filter);
            }
        }

        if filter == ListFilter::Category && value.is_none() {
            let _ = writeln!(out, "📂 **Available Categories ({})**\n", grouped.len());
            for (category, commands) in &grouped {
                let _ = writeln!(out, "• {} ({} command{})", category, commands.len(), plural(commands.len()));
            }
            let total = grouped.values().map(Vec::len).sum();
            Self::footer(&mut out, &prefix, total);
            return Ok(Some(out));
        }

        let filtered: BTreeMap<&String, Vec<CommandMeta>> = grouped
            .iter()
            .map(|(category, commands)| {
                let kept: Vec<CommandMeta> = commands
                    .iter()
                    .filter(|meta| filter.matches(meta, value))
                    .cloned()
                    .collect();
                (category, kept)
            })
            .filter(|(_, kept)| !kept.is_empty())
            .collect();

        if filtered.is_empty() {
            out.push_str("❌ No commands match your filter.\n");
            let _ = writeln!(
                out,
                "Try: {p}list category | {p}list permission admin | {p}list cooldown 10",
                p = prefix
            );
            return Ok(Some(out));
        }

        let mut total = 0;
        for (category, commands) in &filtered {
            Self::render_group(&mut out, &prefix, category, commands);
            total += commands.len();
        }
        Self::footer(&mut out, &prefix, total);
        Ok(Some(out))
    }
}

pub struct AdminHandler;

impl AdminHandler {
    fn target(ctx: &CommandContext) -> Option<String> {
        ctx.message
            .mentions
            .first()
            .cloned()
            .or_else(|| ctx.args.get(1).map(|raw| raw.trim_start_matches('@').to_string()))
            .map(|id| normalize_identity(&id))
            .filter(|id| !id.is_empty())
    }

    fn usage(prefix: &str) -> String {
        format!(
            "Usage: {p}admin list | {p}admin whoami | (super-user: {p}admin add @user | {p}admin remove @user)",
            p = prefix
        )
    }
}

#[async_trait]
impl CommandHandler for AdminHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>> {
        let prefix = ctx.bot().prefix.clone();
        let action = ctx.args.first().map(|a| a.to_lowercase());
        let permissions = &ctx.services.permissions;

        let reply = match action.as_deref() {
            Some("whoami") => format!(
                "👑 You are: {}\nAvailable to: {}",
                ctx.tier,
                if ctx.tier == Tier::SuperUser {
                    "Manage everything"
                } else {
                    "Moderate groups"
                }
            ),
            Some("list") => {
                let listing = permissions.list_admins();
                let mut out = String::from("👑 **Access List**\n");
                let _ = writeln!(out, "{}", RULE);
                let _ = writeln!(
                    out,
                    "Super-user: {}",
                    if listing.super_user.is_empty() {
                        "not set".to_string()
                    } else {
                        listing.super_user.join(", ")
                    }
                );
                if listing.admins.is_empty() {
                    out.push_str("Admins: none");
                } else {
                    let _ = write!(out, "Admins ({}):", listing.admins.len());
                    for admin in &listing.admins {
                        let _ = write!(out, "\n• {}", admin);
                    }
                }
                out
            }
            Some(action @ ("add" | "promote" | "remove" | "demote")) => {
                if ctx.tier != Tier::SuperUser {
                    return Ok(Some("🚫 Only the super-user can change admins".to_string()));
                }
                let Some(target) = Self::target(&ctx) else {
                    return Ok(Some(format!("Please mention someone to {}", action)));
                };
                if matches!(action, "add" | "promote") {
                    if permissions.add_admin(&target)? {
                        format!("✅ Promoted {} to admin", target)
                    } else {
                        format!("ℹ️ {} is already an admin", target)
                    }
                } else if permissions.remove_admin(&target)? {
                    format!("✅ Removed {} from admins", target)
                } else {
                    format!("ℹ️ {} is not an admin", target)
                }
            }
            _ => Self::usage(&prefix),
        };
        Ok(Some(reply))
    }
}

pub struct ReloadHandler;

impl ReloadHandler {
    fn render_report(out: &mut String, report: &ReloadReport) {
        let _ = writeln!(out, "📊 **Reload Results:**");
        let _ = writeln!(out, "✅ Successfully reloaded: {}", report.loaded.len());
        let _ = writeln!(out, "❌ Failed: {}\n", report.failed.len());

        let lines: Vec<String> = report
            .loaded
            .iter()
            .map(|c| format!("✅ {}", c.name))
            .chain(report.failed.iter().map(|f| format!("❌ {}: {}", f.unit, f.error)))
            .collect();
        out.push_str(
            &lines
                .iter()
                .take(MAX_REPORT_LINES)
                .cloned()
                .collect::<Vec<_>>()
                .join("\n"),
        );
        if lines.len() > MAX_REPORT_LINES {
            let _ = write!(out, "\n... and {} more", lines.len() - MAX_REPORT_LINES);
        }
    }
}

#[async_trait]
impl CommandHandler for ReloadHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>> {
        let source = Arc::clone(&ctx.services.source);
        let registry = ctx.registry().clone();
        let mut out = format!("🔄 **COMMAND RELOAD**\n{}\n\n", RULE);
        let _ = writeln!(out, "📁 Commands source: {}\n", source.describe());

        if ctx.args.first().map(|a| a.eq_ignore_ascii_case("single")) == Some(true) {
            let Some(name) = ctx.args.get(1) else {
                return Ok(Some(format!(
                    "Usage: {}reload single <command>",
                    ctx.bot().prefix
                )));
            };
            return Ok(Some(match source.reload_one(&registry, name) {
                Ok(meta) => {
                    let _ = writeln!(out, "✅ Reloaded command: {}", meta.name);
                    let description = if meta.description.is_empty() {
                        "No description"
                    } else {
                        meta.description.as_str()
                    };
                    let _ = writeln!(out, "📝 Description: {}", description);
                    let _ = write!(out, "📂 Category: {}", meta.category);
                    out
                }
                Err(e) => format!("❌ Error reloading {}: {}", name, e),
            }));
        }

        if ctx.args.first().map(|a| a.eq_ignore_ascii_case("new")) == Some(true) {
            out.push_str("🆕 **Loading new commands only...**\n\n");
            match source.load_new(&registry) {
                Ok(report) if report.loaded.is_empty() && report.is_clean() => {
                    out.push_str("ℹ️ No new commands found.");
                }
                Ok(report) => Self::render_report(&mut out, &report),
                Err(e) => return Ok(Some(format!("❌ Loading new commands failed: {}", e))),
            }
            return Ok(Some(out));
        }

        out.push_str("🔄 **Performing full command reload...**\n\n");
        match source.reload_all(&registry) {
            Ok(report) => Self::render_report(&mut out, &report),
            Err(e) => {
                return Ok(Some(format!(
                    "❌ Reload failed: {}\n\nTry restarting the bot instead.",
                    e
                )))
            }
        }
        let _ = write!(
            out,
            "\n\n{}\nℹ️ **Note:** cooldowns restart for reloaded commands.",
            RULE
        );
        Ok(Some(out))
    }
}

pub struct StatusHandler;

#[async_trait]
impl CommandHandler for StatusHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>> {
        let bot = ctx.bot();
        let stats = ctx.registry().stats();
        let listing = ctx.services.permissions.list_admins();

        let mut out = format!("🤖 **BOT STATUS REPORT**\n{}\n\n", RULE);
        let _ = writeln!(out, "👤 **Logged in as:** {}", listing.super_user.first().map(String::as_str).unwrap_or("Unknown"));
        let _ = writeln!(out, "🏷️ **Version:** {} {}", bot.name, bot.version);
        let _ = writeln!(out, "⏱️ **Bot Uptime:** {}", format_uptime(bot.uptime()));
        let _ = writeln!(out, "📅 **Started:** {}", bot.started_at_wall.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(out, "🕐 **Server Time:** {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));

        let _ = writeln!(out, "🧩 **Commands:** {}", stats.total);
        for (category, count) in &stats.by_category {
            let _ = writeln!(out, "  • {}: {}", category, count);
        }
        let _ = writeln!(out, "🛡️ **Admins:** {}\n", listing.admins.len());

        let _ = writeln!(out, "🖥️ **System Info:**");
        let _ = writeln!(out, "  • Platform: {} {}", std::env::consts::OS, std::env::consts::ARCH);
        let _ = writeln!(
            out,
            "  • CPU Cores: {}",
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        );
        let _ = writeln!(out, "  • PID: {}", std::process::id());
        let _ = write!(out, "\n{}\n👑 **Access Level:** {}", RULE, ctx.tier);
        Ok(Some(out))
    }
}

pub struct AboutHandler;

#[async_trait]
impl CommandHandler for AboutHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>> {
        let bot = ctx.bot();
        Ok(Some(format!(
            "*🤖 {name}*\n{tagline}\n\n*Version:* {version}\n*Prefix:* `{prefix}`\n\nUse `{prefix}help` for commands",
            name = bot.name,
            tagline = bot.tagline,
            version = bot.version,
            prefix = bot.prefix,
        )))
    }
}

pub struct InfoHandler;

#[async_trait]
impl CommandHandler for InfoHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>> {
        let sender = ctx.message.sender.clone();
        let target = ctx
            .message
            .mentions
            .first()
            .cloned()
            .unwrap_or_else(|| sender.clone());
        let is_self = target == sender;

        let mut out = format!("👤 **USER INFORMATION**\n{}\n\n", RULE);
        let _ = writeln!(out, "🆔 **User ID:** {}", target);
        let _ = writeln!(
            out,
            "👑 **Access Level:** {}",
            if is_self { ctx.tier.as_str() } else { "Unknown" }
        );
        let _ = writeln!(out, "💬 **Chat Type:** {}", chat_label(&ctx));
        let _ = writeln!(out, "🕐 **Time:** {}\n", Utc::now().format("%H:%M:%S UTC"));

        if ctx.is_group() {
            let chat_id = &ctx.message.chat_id;
            // Group metadata is best effort here
            if let Ok(participants) = ctx.services.groups.participants(chat_id).await {
                let target_id = normalize_identity(&target);
                if let Some(participant) = participants
                    .iter()
                    .find(|p| normalize_identity(&p.id) == target_id)
                {
                    let subject = ctx
                        .services
                        .groups
                        .subject(chat_id)
                        .await
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| chat_id.clone());
                    let role = if participant.is_admin() { "admin" } else { "member" };
                    let _ = writeln!(out, "👥 **Group Info:**");
                    let _ = writeln!(out, "  • Group: {}", subject);
                    let _ = writeln!(out, "  • Role: {}", role);
                    let _ = writeln!(out, "  • Participants: {}\n", participants.len());
                }
            }
        }

        let _ = write!(
            out,
            "{}\n\nℹ️ *Note: Some information may not be available due to privacy settings.*",
            RULE
        );
        Ok(Some(out))
    }
}

pub struct TagAllHandler;

#[async_trait]
impl CommandHandler for TagAllHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>> {
        if !ctx.is_group() {
            return Ok(Some("❌ This command only works in groups!".to_string()));
        }

        let custom = if ctx.args.is_empty() {
            "Attention everyone! 👋".to_string()
        } else {
            ctx.args.join(" ")
        };

        ctx.reply("🔔 Tagging all members...").await?;
        let participants = ctx.services.groups.participants(&ctx.message.chat_id).await?;
        let total = participants.len();
        let mentions: Vec<String> = participants
            .into_iter()
            .take(MAX_MENTIONS)
            .map(|p| p.id)
            .collect();

        let mut text = format!("{}\n\n👥 **Total Members:** {}\n\n", custom, total);
        if total > MAX_MENTIONS {
            let _ = writeln!(text, "📢 Mentioning {} of {} members:", MAX_MENTIONS, total);
        } else {
            let _ = writeln!(text, "📢 Mentioning all {} members:", total);
        }
        for id in &mentions {
            let _ = write!(text, "@{} ", id.split('@').next().unwrap_or(id));
        }
        ctx.reply_with_mentions(text.trim_end(), mentions.clone()).await?;

        if total > MAX_MENTIONS {
            return Ok(Some(format!(
                "✅ Tagged {} members. {} more members not mentioned due to WhatsApp limits.",
                MAX_MENTIONS,
                total - MAX_MENTIONS
            )));
        }
        Ok(Some(format!("✅ Successfully tagged {} members!", total)))
    }
}

/// Whether a chat id can take a direct broadcast
fn is_personal_chat(chat_id: &str) -> bool {
    let local = chat_id.split('@').next().unwrap_or(chat_id);
    !chat_id.ends_with("@g.us")
        && !chat_id.ends_with("@broadcast")
        && !chat_id.contains("status")
        && !chat_id.contains("@lid")
        && !chat_id.contains("@newsletter")
        // service numbers
        && !(chat_id.ends_with("@s.whatsapp.net") && local.len() < 8)
}

fn preview(text: &str) -> String {
    let mut short: String = text.chars().take(BROADCAST_PREVIEW).collect();
    if text.chars().count() > BROADCAST_PREVIEW {
        short.push_str("...");
    }
    short
}

fn render_broadcast(title: &str, text: &str, sent: usize, failed: usize, lines: &[String]) -> String {
    let mut out = format!("📊 **{}**\n", title);
    let _ = writeln!(out, "✅ Success: {}", sent);
    let _ = writeln!(out, "❌ Failed: {}", failed);
    let _ = writeln!(out, "📝 Message: {}\n", text);
    out.push_str(
        &lines
            .iter()
            .take(BROADCAST_REPORT_LINES)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n"),
    );
    if lines.len() > BROADCAST_REPORT_LINES {
        let _ = write!(out, "\n\n... and {} more", lines.len() - BROADCAST_REPORT_LINES);
    }
    out
}

pub struct MsgHandler;

impl MsgHandler {
    /// Bare numbers become user ids, anything with a domain is kept
    fn target(raw: &str) -> Option<String> {
        if raw.contains('@') {
            return Some(raw.to_string());
        }
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            None
        } else {
            Some(format!("{}@s.whatsapp.net", digits))
        }
    }
}

#[async_trait]
impl CommandHandler for MsgHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>> {
        let prefix = &ctx.bot().prefix;
        let usage = format!(
            "❌ Usage: {p}msg [phone-number] [message]\nExample: {p}msg +2349034138536 Hello there!",
            p = prefix
        );
        if ctx.args.len() < 2 {
            return Ok(Some(usage));
        }
        let Some(jid) = Self::target(&ctx.args[0]) else {
            return Ok(Some(usage));
        };
        let text = ctx.args[1..].join(" ");

        ctx.reply(&format!("📤 Sending message to {}...", jid)).await?;
        let outbound = OutboundMessage::to_chat(&ctx.message.channel, &jid, &text)
            .with_mentions(vec![jid.clone()]);
        if let Err(e) = ctx.send(outbound).await {
            warn!(target_chat = %jid, "direct message failed: {:#}", e);
            return Ok(Some(format!("❌ Error sending message: {}", e)));
        }
        Ok(Some(format!(
            "✅ Message sent successfully to {}\n📝 Content: \"{}\"",
            jid, text
        )))
    }
}

pub struct MsgAllHandler;

#[async_trait]
impl CommandHandler for MsgAllHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>> {
        let prefix = ctx.bot().prefix.clone();
        let text = ctx.args.join(" ").trim().to_string();
        if text.is_empty() {
            return Ok(Some(format!(
                "❌ Please provide a message to send.\nExample: {}msgall Happy New Year! 🎉",
                prefix
            )));
        }

        let host = ctx.services.permissions.host_account();
        let targets: Vec<KnownChat> = ctx
            .services
            .chats
            .private_chats()
            .into_iter()
            .filter(|chat| is_personal_chat(&chat.chat_id))
            .filter(|chat| {
                host.as_deref()
                    .map_or(true, |host| !same_identity(&chat.chat_id, host))
            })
            .take(MSGALL_LIMIT)
            .collect();
        if targets.is_empty() {
            return Ok(Some(format!(
                "❌ No personal chats known yet.\n\n📱 **Alternative:**\n1. Use `{p}msg [number] [message]` to message individuals\n2. Chats become known once people message the bot",
                p = prefix
            )));
        }

        ctx.reply(&format!(
            "📤 Starting broadcast to all contacts...\nMessage: \"{}\"",
            preview(&text)
        ))
        .await?;

        let (mut sent, mut failed) = (0usize, 0usize);
        let mut lines = Vec::with_capacity(targets.len());
        for (i, chat) in targets.iter().enumerate() {
            let name = chat.chat_id.split('@').next().unwrap_or(&chat.chat_id);
            match ctx
                .send(OutboundMessage::to_chat(&chat.channel, &chat.chat_id, &text))
                .await
            {
                Ok(()) => {
                    sent += 1;
                    lines.push(format!("✅ {}: Sent", name));
                    if sent % 5 == 0 && i + 1 < targets.len() {
                        tokio::time::sleep(MSGALL_PAUSE).await;
                    }
                }
                Err(e) => {
                    failed += 1;
                    lines.push(format!("❌ {}: {}", name, e));
                }
            }
        }

        let mut out = render_broadcast("Broadcast Results", &text, sent, failed, &lines);
        if sent == 0 {
            out.push_str("\n\n⚠️ **Tip:** no message went out. Check the transport connection.");
        }
        Ok(Some(out))
    }
}

pub struct MsgAllGroupsHandler;

impl MsgAllGroupsHandler {
    /// Directory groups first, then groups only seen in traffic
    async fn targets(ctx: &CommandContext) -> Vec<(String, String)> {
        let ids = match ctx.services.groups.groups().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("group directory unavailable, using seen chats: {:#}", e);
                Vec::new()
            }
        };
        let channel = ctx.message.channel.clone();
        let mut targets: Vec<(String, String)> =
            ids.into_iter().map(|id| (channel.clone(), id)).collect();
        for chat in ctx.services.chats.group_chats() {
            if !targets.iter().any(|(_, id)| *id == chat.chat_id) {
                targets.push((chat.channel, chat.chat_id));
            }
        }
        targets
    }
}

#[async_trait]
impl CommandHandler for MsgAllGroupsHandler {
    async fn run(&self, ctx: CommandContext) -> Result<Option<String>> {
        let text = ctx.args.join(" ").trim().to_string();
        if text.is_empty() {
            return Ok(Some(format!(
                "❌ Please provide a message to send.\nExample: {}msgallgroups Hello everyone! 👋",
                ctx.bot().prefix
            )));
        }

        let targets = Self::targets(&ctx).await;
        if targets.is_empty() {
            return Ok(Some("❌ No groups found.".to_string()));
        }
        ctx.reply(&format!(
            "📤 Broadcasting to all groups...\nMessage: \"{}\"",
            preview(&text)
        ))
        .await?;

        let total = targets.len();
        let batch = &targets[..total.min(MSGALLGROUPS_LIMIT)];
        let (mut sent, mut failed) = (0usize, 0usize);
        let mut lines = Vec::with_capacity(batch.len());
        for (i, (channel, group_id)) in batch.iter().enumerate() {
            let name = ctx
                .services
                .groups
                .subject(group_id)
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| group_id.split('@').next().unwrap_or(group_id).to_string());
            match ctx
                .send(OutboundMessage::to_chat(channel, group_id, &text))
                .await
            {
                Ok(()) => {
                    sent += 1;
                    lines.push(format!("✅ {}: Sent", name));
                    if sent % 2 == 0 && i + 1 < batch.len() {
                        tokio::time::sleep(MSGALLGROUPS_PAUSE).await;
                    }
                }
                Err(e) => {
                    failed += 1;
                    lines.push(format!("❌ {}: {}", name, e));
                }
            }
        }

        let mut out = render_broadcast("Group Broadcast Results", &text, sent, failed, &lines);
        if total > batch.len() {
            let _ = write!(
                out,
                "\n\nℹ️ Limited to {} of {} groups to avoid rate limits",
                batch.len(),
                total
            );
        }
        out.push_str("\n⚠️ Note: Some groups may not allow bots to send messages.");
        Ok(Some(out))
    }
}

/// Handler keys available to command units
pub fn builtin_handlers() -> HandlerTable {
    HandlerTable::new()
        .with("ping", Arc::new(PingHandler))
        .with("help", Arc::new(HelpHandler))
        .with("list", Arc::new(ListHandler))
        .with("admin", Arc::new(AdminHandler))
        .with("reload", Arc::new(ReloadHandler))
        .with("status", Arc::new(StatusHandler))
        .with("about", Arc::new(AboutHandler))
        .with("info", Arc::new(InfoHandler))
        .with("tagall", Arc::new(TagAllHandler))
        .with("msg", Arc::new(MsgHandler))
        .with("msgall", Arc::new(MsgAllHandler))
        .with("msgallgroups", Arc::new(MsgAllGroupsHandler))
}

#[allow(clippy::too_many_arguments)]
fn meta(
    name: &str,
    aliases: &[&str],
    description: &str,
    category: &str,
    chat_type: ChatType,
    permissions: &[Tier],
    cooldown_secs: u64,
    example: &str,
) -> CommandMeta {
    CommandMeta {
        name: name.to_string(),
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
        description: description.to_string(),
        category: category.to_string(),
        chat_type,
        permissions: permissions.to_vec(),
        cooldown_secs,
        example: example.to_string(),
    }
}

/// The built-in command set as a compiled source
pub fn builtin_commands() -> StaticCommandSource {
    let everyone = &Tier::ALL;
    let staff = &[Tier::Admin, Tier::SuperUser];
    let owner = &[Tier::SuperUser];
    let handlers = builtin_handlers();

    let metas = [
        meta("ping", &["p", "latency"], "Check bot response time", "utility", ChatType::Both, everyone, 0, "{prefix}ping"),
        meta("help", &["h", "commands"], "Show help for commands", "general", ChatType::Both, everyone, 0, "{prefix}help | {prefix}help ping"),
        meta("list", &["ls", "cmds", "show"], "List all available commands with filters", "general", ChatType::Both, everyone, 0, "{prefix}list | {prefix}list category utility | {prefix}list permission super-user"),
        meta("admin", &[], "Admin management commands", "administration", ChatType::Both, staff, 5, "{prefix}admin list"),
        meta("reload", &["refresh", "restartcmds", "rc"], "Reload commands dynamically (for development)", "administration", ChatType::Private, owner, 30, "{prefix}reload | {prefix}reload new | {prefix}reload single ping"),
        meta("status", &["stats", "botinfo", "health"], "Show bot status and system information", "utility", ChatType::Both, owner, 10, "{prefix}status"),
        meta("about", &["bot"], "Show bot information", "general", ChatType::Both, everyone, 0, "{prefix}about"),
        meta("info", &["whois", "userinfo", "profile"], "Show user information", "utility", ChatType::Both, everyone, 5, "{prefix}info | {prefix}info @mention"),
        meta("tagall", &["everyone", "mentionall", "alert"], "Mention all members in a group", "group", ChatType::Group, staff, 30, "{prefix}tagall Meeting starts in 5 minutes!"),
        meta("msg", &["message", "send"], "Send message to specific contact", "administration", ChatType::Private, owner, 10, "{prefix}msg +2349034138536 Hello! How are you?"),
        meta("msgall", &["broadcast", "bc"], "Send message to all personal contacts", "administration", ChatType::Private, owner, 300, "{prefix}msgall Happy New Year! 🎉"),
        meta("msgallgroups", &["broadcastgroups", "bcg"], "Send message to all groups", "administration", ChatType::Private, owner, 600, "{prefix}msgallgroups Important announcement!"),
    ];

    metas
        .into_iter()
        .filter_map(|meta| handlers.get(&meta.name).map(|handler| (meta, handler)))
        .fold(StaticCommandSource::new(), |source, (meta, handler)| {
            source.with(meta, handler)
        })
}
