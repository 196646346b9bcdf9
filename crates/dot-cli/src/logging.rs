//! Log files under the data directory
//!
//! One file per day, plus a stderr layer. Files older than the retention window are
//! removed when logging starts or on `dot logs clean`.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_RETENTION_DAYS: u64 = 7;
const LOG_PREFIX: &str = "dot";

pub struct LogManager {
    log_dir: PathBuf,
}

impl LogManager {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn current_log_path(&self) -> PathBuf {
        let today = chrono::Local::now().format("%Y-%m-%d");
        self.log_dir.join(format!("{}.{}.log", LOG_PREFIX, today))
    }

    fn is_log_file(path: &Path) -> bool {
        path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(LOG_PREFIX) && name.ends_with(".log"))
    }

    /// Returns how many files were deleted
    pub fn cleanup_old_logs(&self, retention_days: u64) -> Result<usize> {
        let retention = Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60));
        // Retention longer than the clock's range keeps everything
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut deleted = 0;
        for path in self.log_files()? {
            let modified = fs::metadata(&path)?.modified()?;
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) => eprintln!("Failed to delete old log {}: {}", path.display(), e),
            }
        }
        if deleted > 0 {
            tracing::info!("Cleaned up {} old log file(s)", deleted);
        }
        Ok(deleted)
    }

    /// Newest first
    pub fn log_files(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.log_dir)
            .with_context(|| format!("failed to read {}", self.log_dir.display()))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| Self::is_log_file(path))
            .collect();
        files.sort();
        files.reverse();
        Ok(files)
    }

    pub fn total_size(&self) -> Result<u64> {
        Ok(self
            .log_files()?
            .iter()
            .filter_map(|file| fs::metadata(file).ok())
            .map(|metadata| metadata.len())
            .sum())
    }

    pub fn format_size(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        if bytes >= MB {
            format!("{:.2} MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2} KB", bytes as f64 / KB as f64)
        } else {
            format!("{} B", bytes)
        }
    }
}

/// Keep alive for as long as logs should be flushed
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

pub fn init_logging(log_dir: &Path, log_level: &str) -> Result<LoggingGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    let manager = LogManager::new(log_dir.to_path_buf());
    manager.cleanup_old_logs(LOG_RETENTION_DAYS)?;

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(manager.current_log_path())?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .with_filter(filter(log_level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false)
        .with_filter(filter(log_level));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;

    Ok(LoggingGuard { _guard: guard })
}

/// Stderr only, for one-shot subcommands
pub fn init_console_logging(log_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(filter(log_level))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(LogManager::format_size(512), "512 B");
        assert_eq!(LogManager::format_size(2048), "2.00 KB");
        assert_eq!(LogManager::format_size(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn only_dot_logs_are_listed() {
        let dir = std::env::temp_dir().join(format!("dot-logs-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("create");
        fs::write(dir.join("dot.2026-01-01.log"), "a").expect("write");
        fs::write(dir.join("dot.2026-01-02.log"), "bb").expect("write");
        fs::write(dir.join("other.log"), "c").expect("write");

        let manager = LogManager::new(dir.clone());
        let files = manager.log_files().expect("list");
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("dot.2026-01-02.log"));
        assert_eq!(manager.total_size().expect("size"), 3);
        assert_eq!(manager.cleanup_old_logs(1).expect("clean"), 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn huge_retention_keeps_every_log() {
        let dir = std::env::temp_dir().join(format!("dot-logs-forever-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("create");
        fs::write(dir.join("dot.2026-01-01.log"), "a").expect("write");

        let manager = LogManager::new(dir.clone());
        assert_eq!(manager.cleanup_old_logs(u64::MAX).expect("clean"), 0);
        assert_eq!(manager.cleanup_old_logs(u64::MAX / 86_400 + 1).expect("clean"), 0);
        assert_eq!(manager.log_files().expect("list").len(), 1);

        let _ = fs::remove_dir_all(&dir);
    }
}
