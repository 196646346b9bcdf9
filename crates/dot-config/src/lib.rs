//! Dot Configuration
//!
//! TOML configuration loading with defaults for every section

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_bot_name")]
    pub name: String,
    #[serde(default = "default_bot_version")]
    pub version: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_tagline")]
    pub tagline: String,
    /// Process commands typed from the bot's own account
    #[serde(default = "default_true")]
    pub listen_to_self: bool,
    /// Messages older than this are dropped on arrival (0 disables the check)
    #[serde(default = "default_max_message_age_secs")]
    pub max_message_age_secs: u64,
    #[serde(default = "default_apology")]
    pub apology: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: default_bot_name(),
            version: default_bot_version(),
            prefix: default_prefix(),
            tagline: default_tagline(),
            listen_to_self: true,
            max_message_age_secs: default_max_message_age_secs(),
            apology: default_apology(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_commands_dir")]
    pub dir: String,
    #[serde(default = "default_true")]
    pub hot_reload: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            dir: default_commands_dir(),
            hot_reload: true,
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    pub host_account: Option<String>,
    pub admins_file: Option<String>,
    #[serde(default = "default_group_admin_cache_secs")]
    pub group_admin_cache_secs: u64,
    /// Static group directory, keyed by group chat id
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            host_account: None,
            admins_file: None,
            group_admin_cache_secs: default_group_admin_cache_secs(),
            groups: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroupConfig {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DispatchConfig {
    /// Global cap on in-flight dispatches; unbounded when absent
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default)]
    pub enabled: bool,
    pub provider: Option<String>,
    pub system_prompt: Option<String>,
    #[serde(default = "default_reply_cooldown_secs")]
    pub reply_cooldown_secs: u64,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: None,
            system_prompt: None,
            reply_cooldown_secs: default_reply_cooldown_secs(),
            history_size: default_history_size(),
            min_length: default_min_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub default_provider: String,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_bot_name() -> String {
    "Dot".to_string()
}

fn default_bot_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_prefix() -> String {
    "$".to_string()
}

fn default_tagline() -> String {
    "Your Intelligent WhatsApp Assistant".to_string()
}

fn default_max_message_age_secs() -> u64 {
    60
}

fn default_apology() -> String {
    "😅 Sorry, something went wrong while running that command.".to_string()
}

fn default_commands_dir() -> String {
    "commands".to_string()
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_group_admin_cache_secs() -> u64 {
    300
}

fn default_reply_cooldown_secs() -> u64 {
    3
}

fn default_history_size() -> usize {
    10
}

fn default_min_length() -> usize {
    2
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dot").join("config.toml"))
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.core
            .data_dir
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| dirs::data_dir().map(|dir| dir.join("dot")))
            .unwrap_or_else(|| PathBuf::from(".dot"))
    }

    pub fn log_level(&self) -> &str {
        self.core.log_level.as_deref().unwrap_or("info")
    }

    pub fn admins_file(&self) -> PathBuf {
        match self
            .permissions
            .admins_file
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            Some(path) => PathBuf::from(path),
            None => self.data_dir().join("admins.json"),
        }
    }

    pub fn commands_dir(&self) -> PathBuf {
        PathBuf::from(&self.commands.dir)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.providers.iter().find(|p| p.name == name)
    }

    /// Provider used by the conversation fallback: explicit choice first, then the default
    pub fn conversation_provider(&self) -> Option<&ProviderConfig> {
        let name = self
            .conversation
            .provider
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(self.providers.default_provider.as_str());
        self.provider(name)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bot.prefix.trim().is_empty() {
            anyhow::bail!("bot.prefix cannot be empty");
        }
        if self.bot.prefix.chars().any(char::is_whitespace) {
            anyhow::bail!("bot.prefix cannot contain whitespace");
        }
        if self.bot.name.trim().is_empty() {
            anyhow::bail!("bot.name cannot be empty");
        }
        if self.commands.dir.trim().is_empty() {
            anyhow::bail!("commands.dir cannot be empty");
        }
        if self.commands.debounce_ms == 0 {
            anyhow::bail!("commands.debounce_ms must be > 0");
        }
        if self.permissions.group_admin_cache_secs == 0 {
            anyhow::bail!("permissions.group_admin_cache_secs must be > 0");
        }
        if self.dispatch.max_concurrency == Some(0) {
            anyhow::bail!("dispatch.max_concurrency must be > 0 when set");
        }

        for (group_id, group) in &self.permissions.groups {
            if group_id.trim().is_empty() {
                anyhow::bail!("permissions.groups contains an empty group id");
            }
            if group
                .admins
                .iter()
                .chain(group.members.iter())
                .any(|member| member.trim().is_empty())
            {
                anyhow::bail!("permissions.groups.'{}' contains an empty member", group_id);
            }
        }

        let mut provider_names = HashSet::new();
        for provider in &self.providers.providers {
            let name = provider.name.trim();
            if name.is_empty() {
                anyhow::bail!("Provider name cannot be empty");
            }
            if !provider_names.insert(name.to_string()) {
                anyhow::bail!("Duplicate provider name '{}'", name);
            }
        }

        if !self.providers.default_provider.is_empty()
            && !provider_names.contains(&self.providers.default_provider)
        {
            anyhow::bail!(
                "default_provider '{}' is not defined in providers.providers",
                self.providers.default_provider
            );
        }

        if self.conversation.enabled {
            if self.conversation_provider().is_none() {
                anyhow::bail!(
                    "conversation.enabled=true requires conversation.provider or providers.default_provider"
                );
            }
            if self.conversation.history_size > 100 {
                anyhow::bail!("conversation.history_size must be in range 0..=100");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    fn parse_config(input: &str) -> Config {
        let cfg: Config = toml::from_str(input).expect("valid TOML");
        cfg
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = parse_config("");
        assert_eq!(cfg.bot.prefix, "$");
        assert_eq!(cfg.bot.name, "Dot");
        assert!(cfg.bot.listen_to_self);
        assert_eq!(cfg.bot.max_message_age_secs, 60);
        assert_eq!(cfg.commands.dir, "commands");
        assert!(cfg.commands.hot_reload);
        assert_eq!(cfg.permissions.group_admin_cache_secs, 300);
        assert!(cfg.dispatch.max_concurrency.is_none());
        assert!(!cfg.conversation.enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_blank_prefix() {
        let cfg = parse_config(
            r#"
[bot]
prefix = "  "
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let cfg = parse_config(
            r#"
[dispatch]
max_concurrency = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_default_provider() {
        let cfg = parse_config(
            r#"
[providers]
default_provider = "missing"

[[providers.providers]]
name = "openai"
api_key = "k"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_conversation_without_provider() {
        let cfg = parse_config(
            r#"
[conversation]
enabled = true
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn conversation_provider_falls_back_to_default() {
        let cfg = parse_config(
            r#"
[conversation]
enabled = true

[providers]
default_provider = "openai"

[[providers.providers]]
name = "openai"
api_key = "k"
"#,
        );
        assert!(cfg.validate().is_ok());
        assert_eq!(
            cfg.conversation_provider().map(|p| p.name.as_str()),
            Some("openai")
        );
    }

    #[test]
    fn static_groups_are_parsed() {
        let cfg = parse_config(
            r#"
[permissions]
host_account = "15550001111@s.whatsapp.net"

[permissions.groups."1203630@g.us"]
admins = ["15550002222@s.whatsapp.net"]
members = ["15550003333@s.whatsapp.net"]
"#,
        );
        let group = cfg.permissions.groups.get("1203630@g.us").expect("group");
        assert_eq!(group.admins.len(), 1);
        assert_eq!(group.members.len(), 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn admins_file_defaults_under_data_dir() {
        let cfg = parse_config(
            r#"
[core]
data_dir = "/tmp/dot-test"
"#,
        );
        assert_eq!(
            cfg.admins_file(),
            std::path::PathBuf::from("/tmp/dot-test/admins.json")
        );
    }
}
