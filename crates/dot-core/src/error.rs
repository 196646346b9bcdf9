use crate::command::{ChatType, Tier};
use std::path::PathBuf;
use thiserror::Error;

fn tier_list(tiers: &[Tier]) -> String {
    tiers
        .iter()
        .map(Tier::as_str)
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Outcome of a gated command invocation that did not produce a reply.
///
/// The three gate variants render as the exact text sent back to the caller.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("🚫 Requires: {} (you are: {actual})", tier_list(.required))]
    PermissionDenied { required: Vec<Tier>, actual: Tier },

    #[error("⚠️ This command works in {} only", .allowed.scope_label())]
    WrongChatType { allowed: ChatType },

    #[error("⏳ Wait {remaining_secs}s before using again")]
    CooldownActive { remaining_secs: u64 },

    #[error("❓ Command not found. Use {prefix}help for available commands.")]
    CommandNotFound { name: String, prefix: String },

    #[error("command handler failed: {0:#}")]
    HandlerFailure(anyhow::Error),
}

impl CommandError {
    /// Gate failures are expected and their text goes back to the caller verbatim
    pub fn is_gate(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::WrongChatType { .. } | Self::CooldownActive { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("command name cannot be empty")]
    EmptyName,

    #[error("command name '{0}' cannot contain whitespace")]
    InvalidName(String),

    #[error("command '{name}' has an invalid alias '{alias}'")]
    InvalidAlias { name: String, alias: String },

    #[error("command '{0}' must allow at least one tier")]
    NoPermissions(String),

    #[error("command '{0}' has no handler")]
    MissingHandler(String),
}

/// Failure to turn one command unit into a descriptor. Always scoped to a single unit.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid command unit {}: {reason}", .path.display())]
    Invalid { path: PathBuf, reason: String },

    #[error("unknown handler '{handler}' in {}", .path.display())]
    UnknownHandler { path: PathBuf, handler: String },

    #[error("command unit {} is not valid: {source}", .path.display())]
    Definition {
        path: PathBuf,
        #[source]
        source: DefinitionError,
    },

    #[error("no command unit for '{0}'")]
    NotFound(String),
}
