//! The WAL-backed durable store.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockWriteGuard};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::entity::{Entity, EntityId, SiteId};
use crate::error::CommitResult;
use crate::storage::traits::{DurableStore, StorageError};

use super::store_lock::StoreLock;
use super::snapshot::{self, SnapshotData};
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "commit.wal";
const SNAPSHOT_FILE: &str = "entities.snap";

type EntityIndex = BTreeMap<EntityId, Entity>;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn io_err(context: &'static str, err: &io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {err}"))
}

fn site_range(site: SiteId) -> std::ops::RangeInclusive<EntityId> {
    EntityId::new(site, 0)..=EntityId::new(site, u64::MAX)
}

fn site_ids(index: &EntityIndex, site: SiteId) -> Vec<EntityId> {
    index.range(site_range(site)).map(|(id, _)| *id).collect()
}

/// Applies one logged operation. Replay tolerates operations that already
/// took effect, since the log may overlap the snapshot after a crash.
fn apply(index: &mut EntityIndex, kind: WalEntryKind) {
    match kind {
        WalEntryKind::Commit(entity) => {
            index.insert(entity.id, entity);
        }
        WalEntryKind::Delete { id } => {
            index.remove(&id);
        }
        WalEntryKind::DeleteSite { site } => {
            for id in site_ids(index, site) {
                index.remove(&id);
            }
        }
        WalEntryKind::Checkpoint { .. } => {}
    }
}

/// Result of a compaction.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Number of entities written to the snapshot.
    pub entities: usize,
    /// Log entries folded into the snapshot.
    pub entries_compacted: u64,
    /// Log size in bytes before compaction.
    pub wal_size_before: u64,
    /// Log size in bytes afterwards.
    pub wal_size_after: u64,
}

/// Durable store backed by a write-ahead log and a compacted snapshot.
///
/// All reads are served from an in-memory index rebuilt on open.
pub struct PersistentDurableStore {
    dir: PathBuf,
    _lock: StoreLock,
    wal: WriteAheadLog,
    index: RwLock<EntityIndex>,
    config: PersistentConfig,
}

impl std::fmt::Debug for PersistentDurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentDurableStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentDurableStore {
    /// Opens or creates a store in `dir`: locks it, loads the snapshot and
    /// replays the log on top.
    pub fn open(dir: &Path, config: PersistentConfig) -> CommitResult<Self> {
        fs::create_dir_all(dir).map_err(|e| io_err("failed to create store directory", &e))?;
        let lock = StoreLock::acquire(dir).map_err(|e| io_err("failed to lock store", &e))?;

        let mut index = EntityIndex::new();
        if let Some(data) = snapshot::read(&dir.join(SNAPSHOT_FILE))
            .map_err(|e| io_err("failed to read snapshot", &e))?
        {
            index.extend(data.entities.into_iter().map(|e| (e.id, e)));
        }

        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| io_err("failed to open WAL", &e))?;
        let mut replayed = 0u64;
        for entry in wal.iter().map_err(|e| io_err("failed to iterate WAL", &e))? {
            let entry = entry.map_err(|e| io_err("corrupted WAL entry", &e))?;
            apply(&mut index, entry.kind);
            replayed += 1;
        }

        info!(
            dir = %dir.display(),
            entities = index.len(),
            replayed,
            "storage.persistent.opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            wal,
            index: RwLock::new(index),
            config,
        })
    }

    /// The store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every stored entity, ascending by ID. Used to warm an entity cache.
    pub fn load_all(&self) -> Result<Vec<Entity>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("persistent.load_all"))?;
        Ok(index.values().cloned().collect())
    }

    /// Current log size in bytes, 0 if it cannot be read.
    pub fn wal_size(&self) -> u64 {
        self.wal.size_bytes().unwrap_or(0)
    }

    /// Writes the current state to the snapshot and empties the log.
    ///
    /// Safe to call at any time: if it fails partway, the log still holds
    /// everything and is replayed on the next open.
    pub fn compact(&self) -> Result<CompactionResult, StorageError> {
        let index = self.index.write().map_err(|_| lock_err("persistent.compact"))?;
        self.compact_locked(&index)
    }

    fn compact_locked(&self, index: &EntityIndex) -> Result<CompactionResult, StorageError> {
        let current_seq = self
            .wal
            .current_sequence()
            .map_err(|e| io_err("failed to read WAL sequence", &e))?;
        let wal_size_before = self.wal_size();
        if current_seq == 0 {
            return Ok(CompactionResult {
                entities: index.len(),
                entries_compacted: 0,
                wal_size_before,
                wal_size_after: wal_size_before,
            });
        }

        let data = SnapshotData {
            up_to_sequence: current_seq,
            created_at: Utc::now(),
            entities: index.values().cloned().collect(),
        };
        snapshot::write(&self.dir.join(SNAPSHOT_FILE), &data)
            .map_err(|e| io_err("failed to write snapshot", &e))?;
        self.wal
            .append(WalEntryKind::Checkpoint {
                up_to_sequence: current_seq,
            })
            .map_err(|e| io_err("failed to write checkpoint", &e))?;
        self.wal
            .truncate()
            .map_err(|e| io_err("failed to truncate WAL", &e))?;

        let result = CompactionResult {
            entities: data.entities.len(),
            entries_compacted: current_seq,
            wal_size_before,
            wal_size_after: self.wal_size(),
        };
        debug!(
            entities = result.entities,
            entries = result.entries_compacted,
            "storage.persistent.compacted"
        );
        Ok(result)
    }

    /// Logs `kind`, then applies it to the index and compacts if the log has
    /// grown past its limit. The index lock is held throughout so the log
    /// order matches the index.
    fn write(
        &self,
        mut index: RwLockWriteGuard<'_, EntityIndex>,
        kind: WalEntryKind,
    ) -> Result<(), StorageError> {
        self.wal
            .append(kind.clone())
            .map_err(|e| io_err("failed to append to WAL", &e))?;
        apply(&mut index, kind);

        if self.wal_size() >= self.config.max_wal_size {
            // The write is already durable in the log.
            if let Err(err) = self.compact_locked(&index) {
                warn!(error = %err, "storage.persistent.compaction_failed");
            }
        }
        Ok(())
    }
}

impl DurableStore for PersistentDurableStore {
    fn commit_entity(&self, entity: &Entity) -> Result<(), StorageError> {
        let index = self.index.write().map_err(|_| lock_err("persistent.commit"))?;
        if let Some(prev) = index.get(&entity.id) {
            if entity.version < prev.version {
                return Err(StorageError::BackendError(format!(
                    "stale commit: id={} stored={} new={}",
                    entity.id, prev.version, entity.version
                )));
            }
        }
        self.write(index, WalEntryKind::Commit(entity.clone()))
    }

    fn delete_entity(&self, id: EntityId) -> Result<(), StorageError> {
        let index = self.index.write().map_err(|_| lock_err("persistent.delete"))?;
        if !index.contains_key(&id) {
            return Err(StorageError::EntityNotFound(id));
        }
        self.write(index, WalEntryKind::Delete { id })
    }

    fn delete_site(&self, site: SiteId) -> Result<(), StorageError> {
        let index = self.index.write().map_err(|_| lock_err("persistent.delete_site"))?;
        if index.range(site_range(site)).next().is_none() {
            return Err(StorageError::SiteNotFound(site));
        }
        self.write(index, WalEntryKind::DeleteSite { site })
    }

    fn get(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("persistent.get"))?;
        Ok(index.get(&id).cloned())
    }

    fn list_site(&self, site: SiteId) -> Result<Vec<EntityId>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("persistent.list_site"))?;
        Ok(site_ids(&index, site))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id(site: u32, local: u64) -> EntityId {
        EntityId::new(SiteId::new(site), local)
    }

    fn config() -> PersistentConfig {
        PersistentConfig {
            sync_on_write: false,
            ..PersistentConfig::default()
        }
    }

    #[test]
    fn test_replay_restores_commits_and_deletes() {
        let dir = tempdir().unwrap();
        {
            let store = PersistentDurableStore::open(dir.path(), config()).unwrap();
            store.commit_entity(&Entity::new(id(1, 1))).unwrap();
            store.commit_entity(&Entity::new(id(1, 2))).unwrap();
            store.commit_entity(&Entity::new(id(2, 1))).unwrap();
            store.delete_entity(id(1, 2)).unwrap();
            store.delete_site(SiteId::new(2)).unwrap();
        }

        let store = PersistentDurableStore::open(dir.path(), config()).unwrap();
        let ids: Vec<EntityId> = store.load_all().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![id(1, 1)]);
    }

    #[test]
    fn test_missing_targets_are_reported() {
        let dir = tempdir().unwrap();
        let store = PersistentDurableStore::open(dir.path(), config()).unwrap();
        assert!(matches!(store.delete_entity(id(1, 1)), Err(StorageError::EntityNotFound(_))));
        assert!(matches!(store.delete_site(SiteId::new(4)), Err(StorageError::SiteNotFound(_))));
    }

    #[test]
    fn test_compaction_empties_log_and_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = PersistentDurableStore::open(dir.path(), config()).unwrap();
            for local in 0..10 {
                store.commit_entity(&Entity::new(id(1, local))).unwrap();
            }
            let result = store.compact().unwrap();
            assert_eq!(result.entities, 10);
            assert_eq!(result.entries_compacted, 10);
            assert!(result.wal_size_after < result.wal_size_before);

            store.delete_entity(id(1, 0)).unwrap();
        }

        let store = PersistentDurableStore::open(dir.path(), config()).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 9);
        assert!(store.get(id(1, 0)).unwrap().is_none());
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let _store = PersistentDurableStore::open(dir.path(), config()).unwrap();
        let err = PersistentDurableStore::open(dir.path(), config()).unwrap_err();
        assert!(err.to_string().contains(&format!("pid {}", std::process::id())));
    }
}
