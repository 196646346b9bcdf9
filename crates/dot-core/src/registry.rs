//! Command registry
//!
//! Readers clone an `Arc` to the current snapshot and never see a half-applied mutation.
//! Writers rebuild the alias and category indexes from the descriptor store and swap the
//! snapshot under the write lock.

use crate::command::{ChatType, CommandDescriptor, CommandMeta, Tier};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
struct Entry {
    seq: u64,
    descriptor: Arc<CommandDescriptor>,
}

#[derive(Default)]
struct Snapshot {
    next_seq: u64,
    commands: HashMap<String, Entry>,
    /// alias -> canonical name, derived from `commands`
    aliases: HashMap<String, String>,
    /// category -> names, derived from `commands`
    categories: BTreeMap<String, BTreeSet<String>>,
}

impl Snapshot {
    fn rebuild(commands: HashMap<String, Entry>, next_seq: u64) -> Self {
        let mut ordered: Vec<&Entry> = commands.values().collect();
        ordered.sort_by_key(|entry| entry.seq);

        let mut aliases = HashMap::new();
        let mut categories: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for entry in ordered {
            let meta = entry.descriptor.meta();
            for alias in &meta.aliases {
                aliases.insert(alias.clone(), meta.name.clone());
            }
            categories
                .entry(meta.category.clone())
                .or_default()
                .insert(meta.name.clone());
        }

        Self {
            next_seq,
            commands,
            aliases,
            categories,
        }
    }

    fn resolve(&self, key: &str) -> Option<&Arc<CommandDescriptor>> {
        let name = self.aliases.get(key).map(String::as_str).unwrap_or(key);
        self.commands.get(name).map(|entry| &entry.descriptor)
    }

    fn sorted(&self) -> Vec<&Arc<CommandDescriptor>> {
        let mut all: Vec<&Arc<CommandDescriptor>> =
            self.commands.values().map(|entry| &entry.descriptor).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }
}

fn warn_collisions(current: &Snapshot, descriptor: &CommandDescriptor) {
    let name = descriptor.name();
    for alias in descriptor.aliases() {
        if let Some(owner) = current.aliases.get(alias) {
            if owner != name {
                warn!(
                    alias = %alias,
                    previous = %owner,
                    command = %name,
                    "alias collision, newest registration wins"
                );
            }
        }
        if alias != name && current.commands.contains_key(alias) {
            warn!(alias = %alias, command = %name, "alias shadows another command's name");
        }
    }
    if let Some(owner) = current.aliases.get(name) {
        if owner != name {
            warn!(command = %name, alias_of = %owner, "command name is shadowed by an alias");
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_category: BTreeMap<String, usize>,
    pub commands: Vec<CommandMeta>,
}

/// Shared handle to the live command set. Clones point at the same registry.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.read())
    }

    /// Inserts or replaces a command. Alias collisions resolve to the newest registration.
    /// Returns the descriptor previously stored under the same name.
    pub fn register(&self, descriptor: CommandDescriptor) -> Option<Arc<CommandDescriptor>> {
        self.replace(None, descriptor)
    }

    /// Swaps `previous` for `descriptor` in one step, so lookups never observe the gap
    /// between the two. Returns whatever was stored under the new name.
    pub fn replace(
        &self,
        previous: Option<&str>,
        descriptor: CommandDescriptor,
    ) -> Option<Arc<CommandDescriptor>> {
        let descriptor = Arc::new(descriptor);
        let name = descriptor.name().to_string();

        let mut guard = self.inner.write();
        let current = Arc::clone(&guard);
        let mut commands = current.commands.clone();
        let dropped = previous
            .map(|old| old.trim().to_lowercase())
            .filter(|old| *old != name)
            .and_then(|old| commands.remove(&old).map(|_| old));

        let partial = Snapshot::rebuild(commands, current.next_seq);
        warn_collisions(&partial, &descriptor);

        let mut commands = partial.commands;
        let replaced = commands.insert(
            name.clone(),
            Entry {
                seq: current.next_seq,
                descriptor,
            },
        );
        *guard = Arc::new(Snapshot::rebuild(commands, current.next_seq + 1));

        debug!(
            command = %name,
            replaced = replaced.is_some(),
            dropped = ?dropped,
            "command registered"
        );
        replaced.map(|entry| entry.descriptor)
    }

    /// Installs a whole new command set under one write lock. Returns how many commands
    /// the previous set held.
    pub fn replace_all(&self, descriptors: Vec<CommandDescriptor>) -> usize {
        let mut guard = self.inner.write();
        let previous = guard.commands.len();
        let mut next = Snapshot {
            next_seq: guard.next_seq,
            ..Snapshot::default()
        };
        for descriptor in descriptors {
            warn_collisions(&next, &descriptor);
            let mut commands = std::mem::take(&mut next.commands);
            commands.insert(
                descriptor.name().to_string(),
                Entry {
                    seq: next.next_seq,
                    descriptor: Arc::new(descriptor),
                },
            );
            next = Snapshot::rebuild(commands, next.next_seq + 1);
        }
        debug!(previous, current = next.commands.len(), "command set replaced");
        *guard = Arc::new(next);
        previous
    }

    /// Removes a command with every alias pointing at it
    pub fn unregister(&self, name: &str) -> bool {
        let key = name.trim().to_lowercase();
        let mut guard = self.inner.write();
        if !guard.commands.contains_key(&key) {
            return false;
        }

        let mut commands = guard.commands.clone();
        commands.remove(&key);
        let next_seq = guard.next_seq;
        *guard = Arc::new(Snapshot::rebuild(commands, next_seq));
        debug!(command = %key, "command unregistered");
        true
    }

    /// Drops every command, returning how many there were
    pub fn clear(&self) -> usize {
        let mut guard = self.inner.write();
        let count = guard.commands.len();
        let next_seq = guard.next_seq;
        *guard = Arc::new(Snapshot {
            next_seq,
            ..Snapshot::default()
        });
        count
    }

    /// Looks up by alias first, then by canonical name
    pub fn get(&self, name_or_alias: &str) -> Option<Arc<CommandDescriptor>> {
        let key = name_or_alias.trim().to_lowercase();
        self.snapshot().resolve(&key).cloned()
    }

    pub fn contains(&self, name_or_alias: &str) -> bool {
        self.get(name_or_alias).is_some()
    }

    pub fn len(&self) -> usize {
        self.snapshot().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .sorted()
            .into_iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    pub fn categories(&self) -> Vec<String> {
        self.snapshot().categories.keys().cloned().collect()
    }

    pub fn by_category(&self, category: &str) -> Vec<CommandMeta> {
        let snapshot = self.snapshot();
        snapshot
            .categories
            .get(category)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| snapshot.commands.get(name))
                    .map(|entry| entry.descriptor.summary())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Commands the tier may run in the given kind of chat, grouped by category
    pub fn list_for_user(&self, tier: Tier, chat: ChatType) -> BTreeMap<String, Vec<CommandMeta>> {
        let mut grouped: BTreeMap<String, Vec<CommandMeta>> = BTreeMap::new();
        for descriptor in self.snapshot().sorted() {
            let meta = descriptor.meta();
            if meta.allows_tier(tier) && meta.chat_type.allows(chat) {
                grouped
                    .entry(meta.category.clone())
                    .or_default()
                    .push(meta.clone());
            }
        }
        grouped
    }

    pub fn stats(&self) -> RegistryStats {
        let snapshot = self.snapshot();
        RegistryStats {
            total: snapshot.commands.len(),
            by_category: snapshot
                .categories
                .iter()
                .map(|(category, names)| (category.clone(), names.len()))
                .collect(),
            commands: snapshot.sorted().into_iter().map(|d| d.summary()).collect(),
        }
    }
}
