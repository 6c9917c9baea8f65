//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;

use kyrocommit::{
    ChangeListener, CommitConfig, DurableStore, Entity, EntityCache, EntityId, EntityResolver,
    InMemoryDurableStore, PendingChanges, SiteId, StorageError, UpdateManager,
};

/// One call observed by [`ScriptedStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Commit(EntityId),
    Delete(EntityId),
    DeleteSite(SiteId),
}

/// Failures a [`ScriptedStore`] injects before delegating.
#[derive(Debug, Clone)]
pub enum Failure {
    /// `n` failures with a transient error, then success.
    Transient(u32),
    /// Transient failures forever.
    Always,
    /// One non-retryable failure.
    Permanent,
}

/// In-memory store that records every successful call and can fail or
/// stall on demand.
#[derive(Default)]
pub struct ScriptedStore {
    inner: InMemoryDurableStore,
    log: Mutex<Vec<StoreOp>>,
    commit_failures: Mutex<HashMap<EntityId, Failure>>,
    delete_failures: Mutex<HashMap<EntityId, Failure>>,
    site_failures: Mutex<HashMap<SiteId, Failure>>,
    stall: Mutex<Option<(Duration, Sender<EntityId>)>>,
    pub calls: AtomicU64,
}

fn take_failure<K: std::hash::Hash + Eq>(map: &Mutex<HashMap<K, Failure>>, key: &K) -> Option<StorageError> {
    let transient = || StorageError::Unavailable("injected".to_string());
    let mut map = map.lock().unwrap();
    let (err, exhausted) = match map.get_mut(key)? {
        Failure::Transient(0) => (None, true),
        Failure::Transient(n) => {
            *n -= 1;
            (Some(transient()), false)
        }
        Failure::Always => (Some(transient()), false),
        Failure::Permanent => (Some(StorageError::SerializationError("injected".to_string())), true),
    };
    if exhausted {
        map.remove(key);
    }
    err
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_commit(&self, id: EntityId, failure: Failure) {
        self.commit_failures.lock().unwrap().insert(id, failure);
    }

    pub fn fail_delete(&self, id: EntityId, failure: Failure) {
        self.delete_failures.lock().unwrap().insert(id, failure);
    }

    pub fn fail_site(&self, site: SiteId, failure: Failure) {
        self.site_failures.lock().unwrap().insert(site, failure);
    }

    pub fn heal(&self) {
        self.commit_failures.lock().unwrap().clear();
        self.delete_failures.lock().unwrap().clear();
        self.site_failures.lock().unwrap().clear();
    }

    /// Makes every commit sleep for `delay`, announcing the entity on
    /// `entered` first.
    pub fn stall_commits(&self, delay: Duration, entered: Sender<EntityId>) {
        *self.stall.lock().unwrap() = Some((delay, entered));
    }

    pub fn log(&self) -> Vec<StoreOp> {
        self.log.lock().unwrap().clone()
    }

    pub fn position(&self, op: StoreOp) -> Option<usize> {
        self.log().iter().position(|o| *o == op)
    }

    pub fn stored(&self, id: EntityId) -> Option<Entity> {
        self.inner.get(id).unwrap()
    }

    fn record(&self, op: StoreOp) {
        self.log.lock().unwrap().push(op);
    }
}

impl DurableStore for ScriptedStore {
    fn commit_entity(&self, entity: &Entity) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let stall = self.stall.lock().unwrap().clone();
        if let Some((delay, entered)) = stall {
            let _ = entered.try_send(entity.id);
            std::thread::sleep(delay);
        }
        if let Some(err) = take_failure(&self.commit_failures, &entity.id) {
            return Err(err);
        }
        self.inner.commit_entity(entity)?;
        self.record(StoreOp::Commit(entity.id));
        Ok(())
    }

    fn delete_entity(&self, id: EntityId) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = take_failure(&self.delete_failures, &id) {
            return Err(err);
        }
        self.inner.delete_entity(id)?;
        self.record(StoreOp::Delete(id));
        Ok(())
    }

    fn delete_site(&self, site: SiteId) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = take_failure(&self.site_failures, &site) {
            return Err(err);
        }
        match self.inner.delete_site(site) {
            Ok(()) | Err(StorageError::SiteNotFound(_)) => {
                self.record(StoreOp::DeleteSite(site));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn get(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        self.inner.get(id)
    }

    fn list_site(&self, site: SiteId) -> Result<Vec<EntityId>, StorageError> {
        self.inner.list_site(site)
    }
}

/// A cache, a store and a manager wired together.
pub struct World {
    pub pending: Arc<PendingChanges>,
    pub cache: Arc<EntityCache>,
    pub store: Arc<ScriptedStore>,
    pub manager: UpdateManager,
}

impl World {
    pub fn new(config: CommitConfig) -> Self {
        let pending = Arc::new(PendingChanges::new());
        let cache = Arc::new(EntityCache::new(Arc::clone(&pending) as Arc<dyn ChangeListener>));
        let store = Arc::new(ScriptedStore::new());
        let manager = UpdateManager::new(
            Arc::clone(&pending),
            Arc::clone(&cache) as Arc<dyn EntityResolver>,
            Arc::clone(&store) as Arc<dyn DurableStore>,
            config,
        )
        .unwrap();
        Self {
            pending,
            cache,
            store,
            manager,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CommitConfig {
            commit_interval: Duration::from_millis(5),
            ..CommitConfig::default()
        })
    }

    /// Snapshots of every live cached entity.
    pub fn live(&self) -> Vec<Entity> {
        self.cache
            .ids()
            .into_iter()
            .filter_map(|id| self.cache.resolve(id))
            .filter_map(|handle| handle.snapshot().ok())
            .collect()
    }
}

pub fn id(site: u32, local: u64) -> EntityId {
    EntityId::new(SiteId::new(site), local)
}
