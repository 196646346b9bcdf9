//! Hot reload of the command directory
//!
//! Filesystem events are collected per unit file and applied once the file has
//! been quiet for the debounce window. A unit that fails to load is logged and
//! leaves the rest of the registry untouched.

use crate::loader::{derived_name, is_command_unit, CommandLoader, ReloadReport};
use crate::registry::CommandRegistry;
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    Loaded(String),
    Removed(String),
    Failed,
    Skipped,
}

/// Tracks which command each unit file registered and which file owns each name
pub(crate) struct ReloadState {
    loader: Arc<dyn CommandLoader>,
    registry: CommandRegistry,
    names: HashMap<PathBuf, String>,
    owners: HashMap<String, PathBuf>,
}

impl ReloadState {
    pub(crate) fn new(
        loader: Arc<dyn CommandLoader>,
        registry: CommandRegistry,
        seed: &ReloadReport,
    ) -> Self {
        let mut state = Self {
            loader,
            registry,
            names: HashMap::new(),
            owners: HashMap::new(),
        };
        // Later registrations won, so later entries own the name
        for loaded in &seed.loaded {
            if let Some(path) = &loaded.path {
                state.names.insert(path.clone(), loaded.name.clone());
                state.owners.insert(loaded.name.clone(), path.clone());
            }
        }
        state
    }

    fn owns(&self, name: &str, path: &Path) -> bool {
        self.owners.get(name).map_or(true, |owner| owner == path)
    }

    pub(crate) fn apply(&mut self, path: &Path) -> WatchAction {
        if !is_command_unit(path) {
            return WatchAction::Skipped;
        }
        if path.is_file() {
            self.load(path)
        } else {
            self.remove(path)
        }
    }

    fn load(&mut self, path: &Path) -> WatchAction {
        let descriptor = match self.loader.load(path) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Hot reload skipped: {}", e);
                return WatchAction::Failed;
            }
        };

        let name = descriptor.name().to_string();
        let previous = self
            .names
            .get(path)
            .filter(|old| **old != name && self.owns(old, path))
            .cloned();
        self.registry.replace(previous.as_deref(), descriptor);
        if let Some(old) = &previous {
            self.owners.remove(old);
        }
        self.names.insert(path.to_path_buf(), name.clone());
        self.owners.insert(name.clone(), path.to_path_buf());
        info!("Hot reloaded command {} from {}", name, path.display());
        WatchAction::Loaded(name)
    }

    fn remove(&mut self, path: &Path) -> WatchAction {
        let Some(name) = self.names.remove(path).or_else(|| derived_name(path)) else {
            return WatchAction::Skipped;
        };
        if !self.owns(&name, path) {
            debug!("{} no longer owns command {}", path.display(), name);
            return WatchAction::Skipped;
        }
        self.owners.remove(&name);

        // Another unit declaring the same name takes over instead of leaving a gap
        let fallback = self
            .names
            .iter()
            .find(|(other, other_name)| **other_name == name && other.is_file())
            .map(|(other, _)| other.clone());
        if let Some(other) = fallback {
            if let WatchAction::Loaded(restored) = self.load(&other) {
                info!("Command {} now served by {}", restored, other.display());
                return WatchAction::Loaded(restored);
            }
        }

        if self.registry.unregister(&name) {
            info!("Command {} removed with {}", name, path.display());
            WatchAction::Removed(name)
        } else {
            WatchAction::Skipped
        }
    }
}

/// Stops watching when dropped
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
    dir: PathBuf,
}

impl WatcherHandle {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
        debug!("Command watcher for {} stopped", self.dir.display());
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Must be called from inside a tokio runtime
pub fn spawn_watcher(
    dir: impl Into<PathBuf>,
    loader: Arc<dyn CommandLoader>,
    registry: CommandRegistry,
    debounce: Duration,
    seed: &ReloadReport,
) -> Result<WatcherHandle> {
    let dir = dir.into();
    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if is_relevant(&event.kind) => {
            for path in event.paths.into_iter().filter(|p| is_command_unit(p)) {
                let _ = tx.send(path);
            }
        }
        Ok(_) => {}
        Err(e) => error!("Command watcher error: {}", e),
    })
    .context("failed to create command watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;

    let mut state = ReloadState::new(loader, registry, seed);
    let task = tokio::spawn(async move {
        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
        loop {
            let next = pending.values().min().copied();
            tokio::select! {
                received = rx.recv() => match received {
                    Some(path) => {
                        pending.insert(path, Instant::now() + debounce);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                    let now = Instant::now();
                    let due: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, at)| **at <= now)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in due {
                        pending.remove(&path);
                        let action = state.apply(&path);
                        debug!(?action, "Applied change to {}", path.display());
                    }
                }
            }
        }
        info!("Command watcher task terminated");
    });

    info!(
        "Watching {} for command changes (debounce {}ms)",
        dir.display(),
        debounce.as_millis()
    );
    Ok(WatcherHandle {
        _watcher: watcher,
        task,
        dir,
    })
}
