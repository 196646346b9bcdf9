//! Dot CLI
//!
//! Command-line interface for the Dot chat-bot command engine

mod console;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::{ConsoleAdapter, DEFAULT_IDENTITY};
use dot_config::Config;
use dot_core::{
    builtin_handlers, AdminStore, CommandRegistry, CommandSource, DirectoryCommandSource,
    DotRuntime, StaticGroupDirectory, TomlCommandLoader,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dot")]
#[command(about = "Chat-bot command engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot on the console transport
    Start {
        /// Identity used for plain console lines (defaults to the host account)
        #[arg(long)]
        identity: Option<String>,
    },

    /// Inspect the command directory
    Commands {
        #[command(subcommand)]
        action: CommandsCommands,
    },

    /// Manage the admin allow-list
    Admin {
        #[command(subcommand)]
        action: AdminCommands,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Log management commands
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },
}

#[derive(Subcommand)]
enum CommandsCommands {
    /// List loaded commands by category
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load every unit and report the ones that fail
    Check,
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Show the super-user and admins
    List,
    /// Add an identity to the allow-list
    Add { identity: String },
    /// Remove an identity from the allow-list
    Remove { identity: String },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show current configuration with secrets redacted
    Show,
    /// Validate configuration
    Validate,
}

#[derive(Subcommand)]
enum LogCommands {
    /// List log files
    List,
    /// Remove logs older than the retention window
    Clean {
        #[arg(short, long, default_value_t = logging::LOG_RETENTION_DAYS)]
        days: u64,
    },
    /// Print the last lines of today's log
    Tail {
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { identity } => {
            let config = load_config(cli.config.clone())?;
            let log_dir = config.data_dir().join("logs");
            let _logging_guard = logging::init_logging(&log_dir, &cli.log_level)?;

            let identity = identity
                .or_else(|| config.permissions.host_account.clone())
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_IDENTITY.to_string());
            let groups = Arc::new(StaticGroupDirectory::from_config(&config.permissions.groups));
            let runtime = DotRuntime::new(config, groups)?;

            info!("Starting Dot on the console as {}", identity);
            runtime.run(Arc::new(ConsoleAdapter::new(identity))).await?;
        }

        Commands::Commands { action } => {
            logging::init_console_logging(&cli.log_level);
            let config = load_config(cli.config)?;
            let (source, registry) = command_source(&config);
            let report = source
                .load_all(&registry)
                .with_context(|| format!("failed to load commands from {}", source.describe()))?;

            match action {
                CommandsCommands::List { json } => {
                    let stats = registry.stats();
                    if json {
                        println!("{}", serde_json::to_string_pretty(&stats)?);
                        return Ok(());
                    }
                    println!("{} commands in {}\n", stats.total, source.describe());
                    for (category, count) in &stats.by_category {
                        println!("{} ({})", category.to_uppercase(), count);
                        for meta in stats.commands.iter().filter(|m| &m.category == category) {
                            let aliases = if meta.aliases.is_empty() {
                                String::new()
                            } else {
                                format!(" [{}]", meta.aliases.join(", "))
                            };
                            println!(
                                "  {}{}{} - {} ({}; {}; {}s)",
                                config.bot.prefix,
                                meta.name,
                                aliases,
                                meta.description,
                                meta.permissions
                                    .iter()
                                    .map(|t| t.as_str())
                                    .collect::<Vec<_>>()
                                    .join("/"),
                                meta.chat_type,
                                meta.cooldown_secs
                            );
                        }
                    }
                }
                CommandsCommands::Check => {
                    for loaded in &report.loaded {
                        println!("ok      {}", loaded.name);
                    }
                    for failed in &report.failed {
                        println!("failed  {}: {}", failed.unit, failed.error);
                    }
                    if !report.is_clean() {
                        anyhow::bail!("{} command unit(s) failed to load", report.failed.len());
                    }
                    println!("\nAll {} command units are valid.", report.loaded.len());
                }
            }
        }

        Commands::Admin { action } => {
            logging::init_console_logging(&cli.log_level);
            let config = load_config(cli.config)?;
            let store = AdminStore::load(config.admins_file());
            match action {
                AdminCommands::List => {
                    match config.permissions.host_account.as_deref() {
                        Some(host) => println!("Super-user: {}", host),
                        None => println!("Super-user: not configured"),
                    }
                    let admins = store.list();
                    if admins.is_empty() {
                        println!("No admins configured.");
                    }
                    for admin in admins {
                        println!("  • {}", admin);
                    }
                }
                AdminCommands::Add { identity } => {
                    if store.add(&identity)? {
                        println!("Added admin: {}", identity);
                    } else {
                        println!("{} is already an admin", identity);
                    }
                }
                AdminCommands::Remove { identity } => {
                    if store.remove(&identity)? {
                        println!("Removed admin: {}", identity);
                    } else {
                        println!("{} is not an admin", identity);
                    }
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigCommands::Init { force } => {
                let path = config_path(cli.config)?;
                if path.exists() && !force {
                    anyhow::bail!(
                        "Config already exists at {} (use --force to overwrite)",
                        path.display()
                    );
                }
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, Config::default().to_toml()?)?;
                println!("Config written to {}", path.display());
            }
            ConfigCommands::Show => {
                let mut config = load_config(cli.config)?;
                for provider in &mut config.providers.providers {
                    provider.api_key = redact(&provider.api_key);
                }
                println!("{}", config.to_toml()?);
            }
            ConfigCommands::Validate => match load_config(cli.config) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => anyhow::bail!("Configuration is invalid: {:#}", e),
            },
        },

        Commands::Logs { action } => {
            let config = load_config(cli.config)?;
            let manager = logging::LogManager::new(config.data_dir().join("logs"));
            match action {
                LogCommands::List => {
                    let files = manager.log_files()?;
                    println!(
                        "Log files ({} total):\n",
                        logging::LogManager::format_size(manager.total_size()?)
                    );
                    for file in files {
                        let metadata = fs::metadata(&file)?;
                        let modified: chrono::DateTime<chrono::Local> = metadata.modified()?.into();
                        println!(
                            "  {} ({}, modified {})",
                            file.file_name()
                                .map(|n| n.to_string_lossy().to_string())
                                .unwrap_or_default(),
                            logging::LogManager::format_size(metadata.len()),
                            modified.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                LogCommands::Clean { days } => {
                    let deleted = manager.cleanup_old_logs(days)?;
                    println!("Cleaned {} old log file(s)", deleted);
                }
                LogCommands::Tail { lines } => {
                    let current = manager.current_log_path();
                    if !current.exists() {
                        println!("No log file found at {}", current.display());
                        return Ok(());
                    }
                    let content = fs::read_to_string(&current)?;
                    let all: Vec<&str> = content.lines().collect();
                    for line in &all[all.len().saturating_sub(lines)..] {
                        println!("{}", line);
                    }
                }
            }
        }
    }

    Ok(())
}

fn config_path(config_path: Option<String>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path().context("No config directory available on this platform"),
    }
}

/// An explicit path must exist; a missing default file falls back to built-in defaults
fn load_config(config_path: Option<String>) -> Result<Config> {
    if let Some(path) = config_path {
        return Config::load(&path);
    }
    match Config::default_path() {
        Some(path) if path.exists() => Config::load(&path),
        Some(path) => {
            warn!("No config at {}, using defaults", path.display());
            Ok(Config::default())
        }
        None => Ok(Config::default()),
    }
}

fn command_source(config: &Config) -> (DirectoryCommandSource, CommandRegistry) {
    let loader = Arc::new(TomlCommandLoader::new(builtin_handlers()));
    (
        DirectoryCommandSource::new(config.commands_dir(), loader),
        CommandRegistry::new(),
    )
}

fn redact(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let visible: String = secret.chars().take(4).collect();
    format!("{}***", visible)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_redacted() {
        assert_eq!(redact(""), "");
        assert_eq!(redact("sk-abcdef"), "sk-a***");
    }

    #[test]
    fn cli_parses_nested_commands() {
        let cli = Cli::try_parse_from(["dot", "--config", "x.toml", "admin", "add", "123@s.whatsapp.net"])
            .expect("parse");
        assert_eq!(cli.config.as_deref(), Some("x.toml"));
        assert!(matches!(
            cli.command,
            Commands::Admin {
                action: AdminCommands::Add { .. }
            }
        ));
        assert!(Cli::try_parse_from(["dot", "commands", "list", "--json"]).is_ok());
    }

    #[test]
    fn shipped_command_units_are_valid() {
        let dir = PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/../../commands"));
        let source = DirectoryCommandSource::new(
            dir,
            Arc::new(TomlCommandLoader::new(builtin_handlers())),
        );
        let registry = CommandRegistry::new();
        let report = source.load_all(&registry).expect("commands directory");
        assert!(report.is_clean(), "failed units: {:?}", report.failed);
        assert_eq!(registry.len(), 12);
        assert_eq!(registry.get("everyone").map(|d| d.name().to_string()).as_deref(), Some("tagall"));
    }
}
