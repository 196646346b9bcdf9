//! Command units on disk and the sources that feed the registry
//!
//! A unit is a TOML file describing one command. It points either at a compiled-in
//! handler (`handler = "ping"`) or carries a reply template (`response = "..."`).

use crate::command::{
    ChatType, CommandDescriptor, CommandHandler, CommandMeta, Tier,
};
use crate::error::ReloadError;
use crate::registry::CommandRegistry;
use crate::CommandContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const UNIT_EXTENSION: &str = "toml";

/// Dotfiles, `_`-prefixed drafts and anything without the unit extension are skipped
pub fn is_command_unit(path: &Path) -> bool {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if file_name.starts_with('.') || file_name.starts_with('_') {
        return false;
    }
    path.extension().and_then(|e| e.to_str()) == Some(UNIT_EXTENSION)
}

/// Command name implied by a unit's file name
pub fn derived_name(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

/// Maps one unit to a descriptor
pub trait CommandLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<CommandDescriptor, ReloadError>;
}

/// Compiled-in handlers addressable from command units
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: BTreeMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(key.trim().to_lowercase(), handler);
    }

    pub fn with(mut self, key: &str, handler: Arc<dyn CommandHandler>) -> Self {
        self.insert(key, handler);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&key.trim().to_lowercase()).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandUnit {
    name: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    chat_type: ChatType,
    #[serde(default)]
    permissions: Option<Vec<Tier>>,
    #[serde(default)]
    cooldown: u64,
    #[serde(default)]
    example: String,
    handler: Option<String>,
    response: Option<String>,
}

/// Reply template with `{sender}`, `{chat}`, `{args}`, `{tier}`, `{prefix}` and `{bot}`
pub struct TemplateHandler {
    template: String,
}

impl TemplateHandler {
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
        }
    }

    pub fn render(&self, ctx: &CommandContext) -> String {
        self.template
            .replace("{sender}", &ctx.message.sender)
            .replace("{chat}", &ctx.message.chat_id)
            .replace("{args}", &ctx.args.join(" "))
            .replace("{tier}", ctx.tier.as_str())
            .replace("{prefix}", &ctx.services.bot.prefix)
            .replace("{bot}", &ctx.services.bot.name)
    }
}

#[async_trait]
impl CommandHandler for TemplateHandler {
    async fn run(&self, ctx: CommandContext) -> anyhow::Result<Option<String>> {
        Ok(Some(self.render(&ctx)))
    }
}

pub struct TomlCommandLoader {
    handlers: HandlerTable,
}

impl TomlCommandLoader {
    pub fn new(handlers: HandlerTable) -> Self {
        Self { handlers }
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn parse(&self, path: &Path, content: &str) -> Result<CommandDescriptor, ReloadError> {
        let unit: CommandUnit = toml::from_str(content).map_err(|e| ReloadError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let name = unit
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ReloadError::Invalid {
                path: path.to_path_buf(),
                reason: "missing 'name'".to_string(),
            })?
            .to_string();

        let handler: Arc<dyn CommandHandler> = match (unit.handler.as_deref(), unit.response) {
            (Some(_), Some(_)) => {
                return Err(ReloadError::Invalid {
                    path: path.to_path_buf(),
                    reason: "'handler' and 'response' are mutually exclusive".to_string(),
                })
            }
            (Some(key), None) => {
                self.handlers
                    .get(key)
                    .ok_or_else(|| ReloadError::UnknownHandler {
                        path: path.to_path_buf(),
                        handler: key.to_string(),
                    })?
            }
            (None, Some(template)) => Arc::new(TemplateHandler::new(&template)),
            (None, None) => {
                return Err(ReloadError::Invalid {
                    path: path.to_path_buf(),
                    reason: "needs either 'handler' or 'response'".to_string(),
                })
            }
        };

        let mut builder = CommandDescriptor::builder(&name)
            .aliases(unit.aliases.iter().map(String::as_str))
            .description(&unit.description)
            .chat_type(unit.chat_type)
            .cooldown_secs(unit.cooldown)
            .example(&unit.example)
            .handler(handler);
        if let Some(category) = unit.category.as_deref() {
            builder = builder.category(category);
        }
        if let Some(permissions) = unit.permissions {
            builder = builder.permissions(permissions);
        }

        builder.build().map_err(|source| ReloadError::Definition {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl CommandLoader for TomlCommandLoader {
    fn load(&self, path: &Path) -> Result<CommandDescriptor, ReloadError> {
        let content = std::fs::read_to_string(path).map_err(|source| ReloadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse(path, &content)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadedCommand {
    pub name: String,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedUnit {
    pub unit: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadReport {
    pub loaded: Vec<LoadedCommand>,
    pub failed: Vec<FailedUnit>,
}

impl ReloadReport {
    pub fn loaded_names(&self) -> Vec<&str> {
        self.loaded.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Descriptors built from a source before any of them reach the registry
#[derive(Default)]
pub struct ScannedUnits {
    pub commands: Vec<(CommandDescriptor, Option<PathBuf>)>,
    pub failed: Vec<FailedUnit>,
}

impl ScannedUnits {
    fn into_parts(self) -> (Vec<CommandDescriptor>, ReloadReport) {
        let mut report = ReloadReport {
            failed: self.failed,
            ..ReloadReport::default()
        };
        let descriptors = self
            .commands
            .into_iter()
            .map(|(descriptor, path)| {
                report.loaded.push(LoadedCommand {
                    name: descriptor.name().to_string(),
                    path,
                });
                descriptor
            })
            .collect();
        (descriptors, report)
    }
}

/// Where the registry's commands come from
pub trait CommandSource: Send + Sync {
    fn describe(&self) -> String;

    /// Builds every valid unit without touching the registry. One bad unit never stops
    /// the rest; an unreadable source fails as a whole.
    fn scan(&self) -> Result<ScannedUnits, ReloadError>;

    /// Registers every valid unit on top of what the registry already holds
    fn load_all(&self, registry: &CommandRegistry) -> Result<ReloadReport, ReloadError> {
        let (descriptors, report) = self.scan()?.into_parts();
        for descriptor in descriptors {
            registry.register(descriptor);
        }
        Ok(report)
    }

    /// Replaces the registry contents with a fresh scan. A failed scan leaves the
    /// registry as it was.
    fn reload_all(&self, registry: &CommandRegistry) -> Result<ReloadReport, ReloadError> {
        let (descriptors, report) = self.scan()?.into_parts();
        let previous = registry.replace_all(descriptors);
        debug!("Replaced {} commands with {}", previous, report.loaded.len());
        Ok(report)
    }

    /// Registers only units whose command name is not registered yet
    fn load_new(&self, registry: &CommandRegistry) -> Result<ReloadReport, ReloadError> {
        let mut scanned = self.scan()?;
        let known = registry.names();
        scanned
            .commands
            .retain(|(descriptor, _)| !known.iter().any(|name| name == descriptor.name()));
        let (descriptors, report) = scanned.into_parts();
        for descriptor in descriptors {
            registry.register(descriptor);
        }
        Ok(report)
    }

    /// Reloads one command by name or alias, returning the fresh metadata
    fn reload_one(&self, registry: &CommandRegistry, name: &str) -> Result<CommandMeta, ReloadError>;

    /// Directory and loader to watch, when the source supports hot reload
    fn watch_target(&self) -> Option<(PathBuf, Arc<dyn CommandLoader>)> {
        None
    }
}

pub struct DirectoryCommandSource {
    dir: PathBuf,
    loader: Arc<dyn CommandLoader>,
}

impl DirectoryCommandSource {
    pub fn new(dir: impl Into<PathBuf>, loader: Arc<dyn CommandLoader>) -> Self {
        Self {
            dir: dir.into(),
            loader,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn loader(&self) -> Arc<dyn CommandLoader> {
        Arc::clone(&self.loader)
    }

    /// Unit files in name order
    pub fn unit_files(&self) -> Result<Vec<PathBuf>, ReloadError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| ReloadError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_command_unit(path))
            .collect();
        files.sort();
        Ok(files)
    }

    fn unit_path_for(&self, registry: &CommandRegistry, name: &str) -> Option<PathBuf> {
        let key = name.trim().to_lowercase();
        let direct = self.dir.join(format!("{}.{}", key, UNIT_EXTENSION));
        if direct.is_file() {
            return Some(direct);
        }
        let canonical = registry.get(&key)?;
        let by_name = self
            .dir
            .join(format!("{}.{}", canonical.name(), UNIT_EXTENSION));
        by_name.is_file().then_some(by_name)
    }
}

impl CommandSource for DirectoryCommandSource {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    fn scan(&self) -> Result<ScannedUnits, ReloadError> {
        let mut scanned = ScannedUnits::default();
        for path in self.unit_files()? {
            match self.loader.load(&path) {
                Ok(descriptor) => {
                    debug!("Parsed command {} from {}", descriptor.name(), path.display());
                    scanned.commands.push((descriptor, Some(path)));
                }
                Err(e) => {
                    warn!("Skipping command unit: {}", e);
                    scanned.failed.push(FailedUnit {
                        unit: path
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_else(|| path.display().to_string()),
                        error: e.to_string(),
                    });
                }
            }
        }
        info!(
            "Command source {} scanned: {} valid, {} failed",
            self.describe(),
            scanned.commands.len(),
            scanned.failed.len()
        );
        Ok(scanned)
    }

    fn reload_one(&self, registry: &CommandRegistry, name: &str) -> Result<CommandMeta, ReloadError> {
        let path = self
            .unit_path_for(registry, name)
            .ok_or_else(|| ReloadError::NotFound(name.to_string()))?;
        let descriptor = self.loader.load(&path)?;

        let previous = registry
            .get(name)
            .map(|current| current.name().to_string())
            .or_else(|| derived_name(&path));
        let meta = descriptor.summary();
        registry.replace(previous.as_deref(), descriptor);
        info!("Reloaded command: {}", meta.name);
        Ok(meta)
    }

    fn watch_target(&self) -> Option<(PathBuf, Arc<dyn CommandLoader>)> {
        Some((self.dir.clone(), Arc::clone(&self.loader)))
    }
}

/// Compiled command set for deployments without a command directory
#[derive(Clone, Default)]
pub struct StaticCommandSource {
    commands: Vec<(CommandMeta, Arc<dyn CommandHandler>)>,
}

impl StaticCommandSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, meta: CommandMeta, handler: Arc<dyn CommandHandler>) -> Self {
        self.commands.push((meta, handler));
        self
    }

    fn build(
        meta: &CommandMeta,
        handler: &Arc<dyn CommandHandler>,
    ) -> Result<CommandDescriptor, ReloadError> {
        CommandDescriptor::from_parts(meta.clone(), Arc::clone(handler)).map_err(|source| {
            ReloadError::Definition {
                path: PathBuf::from(format!("<static:{}>", meta.name)),
                source,
            }
        })
    }
}

impl CommandSource for StaticCommandSource {
    fn describe(&self) -> String {
        format!("static ({} commands)", self.commands.len())
    }

    fn scan(&self) -> Result<ScannedUnits, ReloadError> {
        let mut scanned = ScannedUnits::default();
        for (meta, handler) in &self.commands {
            match Self::build(meta, handler) {
                Ok(descriptor) => scanned.commands.push((descriptor, None)),
                Err(e) => {
                    warn!("Skipping static command: {}", e);
                    scanned.failed.push(FailedUnit {
                        unit: meta.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(scanned)
    }

    fn reload_one(&self, registry: &CommandRegistry, name: &str) -> Result<CommandMeta, ReloadError> {
        let key = name.trim().to_lowercase();
        let (meta, handler) = self
            .commands
            .iter()
            .find(|(meta, _)| meta.name == key || meta.aliases.contains(&key))
            .ok_or_else(|| ReloadError::NotFound(name.to_string()))?;
        let descriptor = Self::build(meta, handler)?;
        let fresh = descriptor.summary();
        registry.replace(Some(&meta.name), descriptor);
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::handler_fn;
    use crate::testing::{context_for, TestBed};

    fn table() -> HandlerTable {
        HandlerTable::new().with(
            "ping",
            handler_fn(|_ctx| async { Ok(Some("pong".to_string())) }),
        )
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "dot-loader-{}-{}-{}",
            tag,
            std::process::id(),
            dot_ipc::generate_trace_id()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    const PING_UNIT: &str = r#"
name = "ping"
description = "Check bot response time"
aliases = ["p", "latency"]
category = "utility"
chat_type = "both"
example = "$ping"
permissions = ["user", "admin", "super-user"]
handler = "ping"
"#;

    #[test]
    fn unit_file_filter() {
        assert!(is_command_unit(Path::new("commands/ping.toml")));
        assert!(!is_command_unit(Path::new("commands/.ping.toml")));
        assert!(!is_command_unit(Path::new("commands/_draft.toml")));
        assert!(!is_command_unit(Path::new("commands/ping.js")));
        assert!(!is_command_unit(Path::new("commands/ping.toml.swp")));
        assert_eq!(derived_name(Path::new("commands/Ping.toml")).as_deref(), Some("ping"));
    }

    #[test]
    fn parses_unit_with_handler_key() {
        let loader = TomlCommandLoader::new(table());
        let cmd = loader
            .parse(Path::new("ping.toml"), PING_UNIT)
            .expect("valid unit");
        assert_eq!(cmd.name(), "ping");
        assert_eq!(cmd.aliases(), &["p".to_string(), "latency".to_string()]);
        assert_eq!(cmd.category(), "utility");
        assert_eq!(cmd.permissions(), &Tier::ALL);
        assert_eq!(cmd.meta().example, "$ping");
    }

    #[test]
    fn unit_defaults_match_descriptor_defaults() {
        let loader = TomlCommandLoader::new(table());
        let cmd = loader
            .parse(Path::new("x.toml"), "name = \"x\"\nresponse = \"hi\"")
            .expect("valid unit");
        assert_eq!(cmd.category(), "general");
        assert_eq!(cmd.permissions(), &[Tier::User]);
        assert_eq!(cmd.chat_type(), ChatType::Both);
        assert_eq!(cmd.meta().cooldown_secs, 0);
    }

    #[test]
    fn rejects_invalid_units() {
        let loader = TomlCommandLoader::new(table());
        let path = Path::new("bad.toml");
        assert!(matches!(
            loader.parse(path, "description = \"no name\"\nresponse = \"x\""),
            Err(ReloadError::Invalid { .. })
        ));
        assert!(matches!(
            loader.parse(path, "name = \"x\""),
            Err(ReloadError::Invalid { .. })
        ));
        assert!(matches!(
            loader.parse(path, "name = \"x\"\nhandler = \"nope\""),
            Err(ReloadError::UnknownHandler { .. })
        ));
        assert!(matches!(
            loader.parse(path, "name = \"x\"\nhandler = \"ping\"\nresponse = \"y\""),
            Err(ReloadError::Invalid { .. })
        ));
        assert!(matches!(
            loader.parse(path, "name = \"x\"\nresponse = \"y\"\npermissions = []"),
            Err(ReloadError::Definition { .. })
        ));
        assert!(matches!(
            loader.parse(path, "name = \"x\"\nresponse = \"y\"\ncolour = \"red\""),
            Err(ReloadError::Invalid { .. })
        ));
        assert!(matches!(
            loader.parse(path, "name = \"x\"\nresponse = \"y\"\npermissions = [\"root\"]"),
            Err(ReloadError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn template_handler_renders_placeholders() {
        let bed = TestBed::new();
        let loader = TomlCommandLoader::new(table());
        let cmd = loader
            .parse(
                Path::new("echo.toml"),
                "name = \"echo\"\nresponse = \"{bot}: {sender} said {args} ({tier}, {prefix})\"",
            )
            .expect("valid unit");
        let mut ctx = context_for(&bed, "u1@s.whatsapp.net", "u1@s.whatsapp.net", Tier::User);
        ctx.args = vec!["hello".to_string(), "there".to_string()];
        let reply = cmd.execute(ctx).await.expect("runs");
        assert_eq!(
            reply.as_deref(),
            Some("Dot: u1@s.whatsapp.net said hello there (user, $)")
        );
    }

    #[test]
    fn directory_source_isolates_bad_units() {
        let dir = temp_dir("scan");
        std::fs::write(dir.join("ping.toml"), PING_UNIT).expect("write");
        std::fs::write(dir.join("broken.toml"), "name = ").expect("write");
        std::fs::write(dir.join("_draft.toml"), PING_UNIT.replace("ping", "draft")).expect("write");
        std::fs::write(dir.join(".hidden.toml"), PING_UNIT).expect("write");
        std::fs::write(dir.join("notes.txt"), "ignored").expect("write");

        let registry = CommandRegistry::new();
        let source = DirectoryCommandSource::new(&dir, Arc::new(TomlCommandLoader::new(table())));
        let report = source.load_all(&registry).expect("scan");

        assert_eq!(report.loaded_names(), vec!["ping"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].unit, "broken.toml");
        assert_eq!(registry.names(), vec!["ping".to_string()]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let registry = CommandRegistry::new();
        let source = DirectoryCommandSource::new(
            std::env::temp_dir().join("dot-loader-does-not-exist"),
            Arc::new(TomlCommandLoader::new(table())),
        );
        assert!(matches!(source.load_all(&registry), Err(ReloadError::Io { .. })));
    }

    #[test]
    fn reload_one_picks_up_changes_by_name_or_alias() {
        let dir = temp_dir("single");
        std::fs::write(dir.join("ping.toml"), PING_UNIT).expect("write");
        let registry = CommandRegistry::new();
        let source = DirectoryCommandSource::new(&dir, Arc::new(TomlCommandLoader::new(table())));
        source.load_all(&registry).expect("scan");

        std::fs::write(
            dir.join("ping.toml"),
            PING_UNIT.replace("[\"p\", \"latency\"]", "[\"pp\"]"),
        )
        .expect("rewrite");
        let meta = source.reload_one(&registry, "latency").expect("reload");
        assert_eq!(meta.aliases, vec!["pp".to_string()]);
        assert!(registry.get("latency").is_none());
        assert!(registry.get("pp").is_some());

        assert!(matches!(
            source.reload_one(&registry, "missing"),
            Err(ReloadError::NotFound(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reload_all_clears_stale_commands() {
        let dir = temp_dir("full");
        std::fs::write(dir.join("ping.toml"), PING_UNIT).expect("write");
        let registry = CommandRegistry::new();
        registry.register(
            CommandDescriptor::builder("stale")
                .handler_fn(|_ctx| async { Ok(None) })
                .build()
                .expect("descriptor"),
        );
        let source = DirectoryCommandSource::new(&dir, Arc::new(TomlCommandLoader::new(table())));
        let report = source.reload_all(&registry).expect("reload");
        assert!(report.is_clean());
        assert!(registry.get("stale").is_none());
        assert!(registry.get("ping").is_some());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn failed_full_reload_keeps_the_registry() {
        let dir = temp_dir("vanished");
        std::fs::write(dir.join("greet.toml"), "name = \"greet\"\nresponse = \"hi\"")
            .expect("write");
        let registry = CommandRegistry::new();
        let source = DirectoryCommandSource::new(&dir, Arc::new(TomlCommandLoader::new(table())));
        source.load_all(&registry).expect("scan");
        assert_eq!(registry.len(), 1);

        std::fs::remove_dir_all(&dir).expect("remove dir");
        assert!(matches!(source.reload_all(&registry), Err(ReloadError::Io { .. })));
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("greet"));
    }

    #[test]
    fn broken_unit_keeps_previous_command_on_single_reload() {
        let dir = temp_dir("broken-single");
        std::fs::write(dir.join("ping.toml"), PING_UNIT).expect("write");
        let registry = CommandRegistry::new();
        let source = DirectoryCommandSource::new(&dir, Arc::new(TomlCommandLoader::new(table())));
        source.load_all(&registry).expect("scan");

        std::fs::write(dir.join("ping.toml"), "name = ").expect("break");
        assert!(matches!(
            source.reload_one(&registry, "ping"),
            Err(ReloadError::Invalid { .. })
        ));
        assert!(registry.contains("latency"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reload_one_follows_a_renamed_command() {
        let dir = temp_dir("rename-single");
        std::fs::write(dir.join("ping.toml"), PING_UNIT).expect("write");
        let registry = CommandRegistry::new();
        let source = DirectoryCommandSource::new(&dir, Arc::new(TomlCommandLoader::new(table())));
        source.load_all(&registry).expect("scan");

        std::fs::write(dir.join("ping.toml"), PING_UNIT.replace("name = \"ping\"", "name = \"pong\""))
            .expect("rewrite");
        let meta = source.reload_one(&registry, "ping").expect("reload");
        assert_eq!(meta.name, "pong");
        assert_eq!(registry.names(), vec!["pong".to_string()]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_new_only_adds_unknown_commands() {
        let dir = temp_dir("new-only");
        std::fs::write(dir.join("ping.toml"), PING_UNIT).expect("write");
        let registry = CommandRegistry::new();
        let source = DirectoryCommandSource::new(&dir, Arc::new(TomlCommandLoader::new(table())));
        source.load_all(&registry).expect("scan");
        let original = registry.get("ping").expect("ping");

        std::fs::write(dir.join("greet.toml"), "name = \"greet\"\nresponse = \"hi\"")
            .expect("write");
        let report = source.load_new(&registry).expect("load new");
        assert_eq!(report.loaded_names(), vec!["greet"]);
        assert!(registry.contains("greet"));
        let untouched = registry.get("ping").expect("ping");
        assert!(Arc::ptr_eq(&original, &untouched));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn static_source_builds_fresh_descriptors() {
        let meta = CommandMeta {
            name: "ping".to_string(),
            aliases: vec!["p".to_string()],
            description: "pong".to_string(),
            category: "utility".to_string(),
            chat_type: ChatType::Both,
            permissions: Tier::ALL.to_vec(),
            cooldown_secs: 0,
            example: String::new(),
        };
        let source = StaticCommandSource::new().with(
            meta,
            handler_fn(|_ctx| async { Ok(Some("pong".to_string())) }),
        );
        let registry = CommandRegistry::new();
        let report = source.load_all(&registry).expect("load");
        assert_eq!(report.loaded_names(), vec!["ping"]);
        assert!(source.watch_target().is_none());

        let first = registry.get("p").expect("registered");
        source.reload_one(&registry, "p").expect("reload");
        let second = registry.get("ping").expect("still registered");
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
