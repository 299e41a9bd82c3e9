//! JSON-backed user store.
//!
//! One `<data_dir>/users/<uuid>.json` document per user, mirrored in memory.
//! Without a directory the store lives in memory only.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use crossport_api::{CorrelationToken, Database, Position, StoreError, TeleportDescriptor, User};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything stored for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub uuid: Uuid,
    pub username: String,
    #[serde(default)]
    pub ignoring_teleports: bool,
    #[serde(default)]
    pub homes: Vec<String>,
    #[serde(default)]
    pub pending_teleport: Option<TeleportDescriptor>,
    #[serde(default)]
    pub respawn_position: Option<Position>,
    #[serde(default)]
    pub offline_position: Option<Position>,
    #[serde(default)]
    pub last_position: Option<Position>,
}

impl UserRecord {
    fn new(user: &User) -> Self {
        Self {
            uuid: user.uuid,
            username: user.username.clone(),
            ignoring_teleports: false,
            homes: Vec::new(),
            pending_teleport: None,
            respawn_position: None,
            offline_position: None,
            last_position: None,
        }
    }
}

pub struct JsonStore {
    dir: Option<PathBuf>,
    records: RwLock<HashMap<Uuid, UserRecord>>,
    writes: AtomicU64,
}

impl JsonStore {
    /// A store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            records: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Open (or create) a store under `data_dir`, loading existing records.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let dir = data_dir.join("users");
        fs::create_dir_all(&dir)?;

        let mut records = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(StoreError::from)
                .and_then(|s| serde_json::from_str::<UserRecord>(&s).map_err(StoreError::from))
            {
                Ok(record) => {
                    records.insert(record.uuid, record);
                }
                Err(e) => warn!("Failed to load {}: {e}", path.display()),
            }
        }
        info!("Loaded {} user records from {}", records.len(), dir.display());

        Ok(Self {
            dir: Some(dir),
            records: RwLock::new(records),
            writes: AtomicU64::new(0),
        })
    }

    /// Number of mutations applied since the store was opened.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Homes are written by a separate subsystem; tests seed them here.
    #[cfg(test)]
    pub fn add_home(&self, uuid: Uuid, name: &str) -> Result<(), StoreError> {
        self.update(uuid, |r| r.homes.push(name.to_string()))
    }

    fn read<T>(&self, uuid: Uuid, f: impl FnOnce(&UserRecord) -> T) -> Option<T> {
        self.records.read().get(&uuid).map(f)
    }

    fn update(&self, uuid: Uuid, f: impl FnOnce(&mut UserRecord)) -> Result<(), StoreError> {
        self.update_if(uuid, |r| {
            f(r);
            true
        })
        .map(|_| ())
    }

    /// Apply `f` and save the record if it reports a change.
    ///
    /// The file is written under the same lock as the mutation, so files on
    /// disk always hold the latest state of each record.
    fn update_if(
        &self,
        uuid: Uuid,
        f: impl FnOnce(&mut UserRecord) -> bool,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&uuid)
            .ok_or(StoreError::UnknownUser(uuid))?;
        if !f(record) {
            return Ok(false);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.persist(record)?;
        Ok(true)
    }

    fn persist(&self, record: &UserRecord) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.json", record.uuid));
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json)?;
        debug!("Saved {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl Database for JsonStore {
    async fn ensure_user(&self, user: &User) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let record = match records.entry(user.uuid) {
            Entry::Occupied(e) if e.get().username == user.username => return Ok(()),
            Entry::Occupied(e) => {
                // Name changed since last login.
                let record = e.into_mut();
                record.username = user.username.clone();
                record
            }
            Entry::Vacant(e) => e.insert(UserRecord::new(user)),
        };
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.persist(record)
    }

    async fn ignore_flag(&self, uuid: Uuid) -> Result<Option<bool>, StoreError> {
        Ok(self.read(uuid, |r| r.ignoring_teleports))
    }

    async fn set_ignore_flag(&self, uuid: Uuid, ignoring: bool) -> Result<(), StoreError> {
        self.update(uuid, |r| r.ignoring_teleports = ignoring)
    }

    async fn home_names(&self, uuid: Uuid) -> Result<Vec<String>, StoreError> {
        Ok(self.read(uuid, |r| r.homes.clone()).unwrap_or_default())
    }

    async fn pending_teleport(&self, uuid: Uuid) -> Result<Option<TeleportDescriptor>, StoreError> {
        Ok(self.read(uuid, |r| r.pending_teleport.clone()).flatten())
    }

    async fn set_pending_teleport(
        &self,
        uuid: Uuid,
        descriptor: Option<TeleportDescriptor>,
    ) -> Result<(), StoreError> {
        self.update(uuid, |r| r.pending_teleport = descriptor)
    }

    async fn clear_pending_teleport_if(
        &self,
        uuid: Uuid,
        token: CorrelationToken,
    ) -> Result<bool, StoreError> {
        let cleared = self.update_if(uuid, |r| {
            let matches = r.pending_teleport.as_ref().is_some_and(|d| d.token == token);
            if matches {
                r.pending_teleport = None;
            }
            matches
        });
        match cleared {
            Err(StoreError::UnknownUser(_)) => Ok(false),
            other => other,
        }
    }

    async fn respawn_position(&self, uuid: Uuid) -> Result<Option<Position>, StoreError> {
        Ok(self.read(uuid, |r| r.respawn_position.clone()).flatten())
    }

    async fn set_respawn_position(
        &self,
        uuid: Uuid,
        position: Option<Position>,
    ) -> Result<(), StoreError> {
        self.update(uuid, |r| r.respawn_position = position)
    }

    async fn offline_position(&self, uuid: Uuid) -> Result<Option<Position>, StoreError> {
        Ok(self.read(uuid, |r| r.offline_position.clone()).flatten())
    }

    async fn set_offline_position(&self, uuid: Uuid, position: Position) -> Result<(), StoreError> {
        self.update(uuid, |r| r.offline_position = Some(position))
    }

    async fn last_position(&self, uuid: Uuid) -> Result<Option<Position>, StoreError> {
        Ok(self.read(uuid, |r| r.last_position.clone()).flatten())
    }

    async fn set_last_position(&self, uuid: Uuid, position: Position) -> Result<(), StoreError> {
        self.update(uuid, |r| r.last_position = Some(position))
    }
}
