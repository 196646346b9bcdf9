//! Caller tier resolution, admin allow-list and group directory

use crate::command::Tier;
use anyhow::{Context, Result};
use async_trait::async_trait;
use dot_config::{Config, GroupConfig};
use dot_ipc::InboundMessage;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Drops the `:device` segment of an identity, keeping the `@server` part.
///
/// `123:4@s.whatsapp.net` becomes `123@s.whatsapp.net`.
pub fn normalize_identity(identity: &str) -> String {
    let identity = identity.trim();
    let (user, server) = match identity.split_once('@') {
        Some((user, server)) => (user, Some(server)),
        None => (identity, None),
    };
    let user = user.split(':').next().unwrap_or(user);
    match server {
        Some(server) => format!("{}@{}", user, server),
        None => user.to_string(),
    }
}

/// The bare account part of an identity: no device, no server
pub fn bare_identity(identity: &str) -> &str {
    let identity = identity.trim();
    let user = identity.split('@').next().unwrap_or(identity);
    user.split(':').next().unwrap_or(user)
}

/// Same account, tolerating device suffixes and a missing server part on either side
pub fn same_identity(a: &str, b: &str) -> bool {
    if a.trim().is_empty() || b.trim().is_empty() {
        return false;
    }
    let (na, nb) = (normalize_identity(a), normalize_identity(b));
    if na == nb {
        return true;
    }
    (!na.contains('@') || !nb.contains('@')) && bare_identity(&na) == bare_identity(&nb)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Member,
    Admin,
    SuperAdmin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub id: String,
    pub role: ParticipantRole,
}

impl GroupParticipant {
    pub fn is_admin(&self) -> bool {
        matches!(self.role, ParticipantRole::Admin | ParticipantRole::SuperAdmin)
    }
}

/// Live group metadata supplied by the transport
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn participants(&self, group_id: &str) -> Result<Vec<GroupParticipant>>;

    async fn subject(&self, _group_id: &str) -> Result<Option<String>> {
        Ok(None)
    }

    /// Group ids the bot participates in
    async fn groups(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn is_group_admin(&self, group_id: &str, user_id: &str) -> Result<bool> {
        let participants = self.participants(group_id).await?;
        Ok(participants
            .iter()
            .any(|p| p.is_admin() && same_identity(&p.id, user_id)))
    }
}

/// Group directory backed by the `[permissions.groups]` config table
#[derive(Debug, Clone, Default)]
pub struct StaticGroupDirectory {
    groups: HashMap<String, (Option<String>, Vec<GroupParticipant>)>,
}

impl StaticGroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(groups: &BTreeMap<String, GroupConfig>) -> Self {
        let mut directory = Self::new();
        for (group_id, group) in groups {
            let mut participants: Vec<GroupParticipant> = group
                .admins
                .iter()
                .map(|id| GroupParticipant {
                    id: normalize_identity(id),
                    role: ParticipantRole::Admin,
                })
                .collect();
            for member in &group.members {
                let id = normalize_identity(member);
                if !participants.iter().any(|p| p.id == id) {
                    participants.push(GroupParticipant {
                        id,
                        role: ParticipantRole::Member,
                    });
                }
            }
            directory.insert(group_id, group.subject.clone(), participants);
        }
        directory
    }

    pub fn insert(
        &mut self,
        group_id: &str,
        subject: Option<String>,
        participants: Vec<GroupParticipant>,
    ) {
        self.groups
            .insert(group_id.trim().to_string(), (subject, participants));
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[async_trait]
impl GroupDirectory for StaticGroupDirectory {
    async fn participants(&self, group_id: &str) -> Result<Vec<GroupParticipant>> {
        self.groups
            .get(group_id)
            .map(|(_, participants)| participants.clone())
            .with_context(|| format!("no metadata for group {}", group_id))
    }

    async fn subject(&self, group_id: &str) -> Result<Option<String>> {
        Ok(self
            .groups
            .get(group_id)
            .and_then(|(subject, _)| subject.clone()))
    }

    async fn groups(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.groups.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Admin allow-list persisted as a pretty JSON array, rewritten on every change
pub struct AdminStore {
    path: Option<PathBuf>,
    admins: Mutex<Vec<String>>,
}

impl AdminStore {
    pub fn in_memory(admins: Vec<String>) -> Self {
        Self {
            path: None,
            admins: Mutex::new(admins),
        }
    }

    /// Missing or unreadable files start an empty list
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let admins = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<String>>(&content) {
                Ok(list) => list,
                Err(e) => {
                    warn!("Admin list {} is not a JSON array ({}), starting fresh", path.display(), e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No saved admin list at {}, starting fresh", path.display());
                Vec::new()
            }
            Err(e) => {
                warn!("Failed to read admin list {}: {}", path.display(), e);
                Vec::new()
            }
        };

        Self {
            path: Some(path),
            admins: Mutex::new(admins),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn list(&self) -> Vec<String> {
        self.admins.lock().clone()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.admins
            .lock()
            .iter()
            .any(|admin| same_identity(admin, identity))
    }

    /// Returns false when the identity was already listed
    pub fn add(&self, identity: &str) -> Result<bool> {
        let identity = normalize_identity(identity);
        if identity.is_empty() {
            anyhow::bail!("admin identity cannot be empty");
        }

        let mut admins = self.admins.lock();
        if admins.iter().any(|admin| same_identity(admin, &identity)) {
            return Ok(false);
        }
        admins.push(identity.clone());
        if let Err(e) = self.persist(&admins) {
            admins.pop();
            return Err(e);
        }
        info!("Added admin: {}", identity);
        Ok(true)
    }

    /// Returns false when the identity was not listed
    pub fn remove(&self, identity: &str) -> Result<bool> {
        let mut admins = self.admins.lock();
        let before = admins.clone();
        admins.retain(|admin| !same_identity(admin, identity));
        if admins.len() == before.len() {
            return Ok(false);
        }
        if let Err(e) = self.persist(&admins) {
            *admins = before;
            return Err(e);
        }
        info!("Removed admin: {}", identity);
        Ok(true)
    }

    fn persist(&self, admins: &[String]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(admins)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write admin list {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminListing {
    #[serde(rename = "super-user")]
    pub super_user: Vec<String>,
    pub admins: Vec<String>,
}

pub struct PermissionResolver {
    host: RwLock<Option<String>>,
    admins: AdminStore,
    groups: Arc<dyn GroupDirectory>,
    group_cache: Mutex<HashMap<(String, String), (bool, Instant)>>,
    cache_ttl: Duration,
}

impl PermissionResolver {
    pub fn new(admins: AdminStore, groups: Arc<dyn GroupDirectory>, cache_ttl: Duration) -> Self {
        Self {
            host: RwLock::new(None),
            admins,
            groups,
            group_cache: Mutex::new(HashMap::new()),
            cache_ttl,
        }
    }

    pub fn from_config(config: &Config, groups: Arc<dyn GroupDirectory>) -> Self {
        let resolver = Self::new(
            AdminStore::load(config.admins_file()),
            groups,
            Duration::from_secs(config.permissions.group_admin_cache_secs),
        );
        if let Some(host) = config
            .permissions
            .host_account
            .as_deref()
            .filter(|host| !host.trim().is_empty())
        {
            resolver.set_host_account(host);
        }
        resolver
    }

    pub fn set_host_account(&self, identity: &str) {
        let host = normalize_identity(identity);
        info!("Bot running as: {}", host);
        *self.host.write() = Some(host);
    }

    pub fn host_account(&self) -> Option<String> {
        self.host.read().clone()
    }

    pub fn admins(&self) -> &AdminStore {
        &self.admins
    }

    pub fn groups(&self) -> Arc<dyn GroupDirectory> {
        Arc::clone(&self.groups)
    }

    pub async fn resolve(&self, message: &InboundMessage) -> Tier {
        self.resolve_at(message, Instant::now()).await
    }

    pub async fn resolve_at(&self, message: &InboundMessage, now: Instant) -> Tier {
        if message.from_me {
            return Tier::SuperUser;
        }

        let sender = message.sender.trim();
        if let Some(host) = self.host_account() {
            if same_identity(sender, &host) {
                return Tier::SuperUser;
            }
        }

        if self.admins.contains(sender) {
            return Tier::Admin;
        }

        if message.is_group() && self.is_group_admin_at(&message.chat_id, sender, now).await {
            return Tier::Admin;
        }

        Tier::User
    }

    /// Group admin lookup through the directory, cached per `(group, user)`.
    /// Lookup failures count as "not admin" and are not cached.
    pub async fn is_group_admin_at(&self, group_id: &str, user_id: &str, now: Instant) -> bool {
        let key = (group_id.to_string(), normalize_identity(user_id));
        {
            let mut cache = self.group_cache.lock();
            match cache.get(&key) {
                Some((is_admin, at)) if now.saturating_duration_since(*at) < self.cache_ttl => {
                    return *is_admin;
                }
                Some(_) => {
                    cache.remove(&key);
                }
                None => {}
            }
        }

        match self.groups.is_group_admin(group_id, user_id).await {
            Ok(is_admin) => {
                let ttl = self.cache_ttl;
                let mut cache = self.group_cache.lock();
                cache.retain(|_, (_, at)| now.saturating_duration_since(*at) < ttl);
                cache.insert(key, (is_admin, now));
                is_admin
            }
            Err(e) => {
                warn!("Error checking group admin for {} in {}: {:#}", user_id, group_id, e);
                false
            }
        }
    }

    pub fn add_admin(&self, identity: &str) -> Result<bool> {
        self.admins.add(identity)
    }

    pub fn remove_admin(&self, identity: &str) -> Result<bool> {
        self.admins.remove(identity)
    }

    pub fn list_admins(&self) -> AdminListing {
        AdminListing {
            super_user: self.host_account().into_iter().collect(),
            admins: self.admins.list(),
        }
    }

    pub fn cached_group_entries(&self) -> usize {
        self.group_cache.lock().len()
    }

    pub fn clear_group_cache(&self) {
        self.group_cache.lock().clear();
    }
}
