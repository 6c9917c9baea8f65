//! In-memory durable storage backend.
//!
//! Thread-safe reference implementation of [`DurableStore`], intended for
//! embedded usage and tests.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::entity::{Entity, EntityId, SiteId};
use crate::storage::traits::{DurableStore, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn site_range(site: SiteId) -> std::ops::RangeInclusive<EntityId> {
    EntityId::new(site, 0)..=EntityId::new(site, u64::MAX)
}

/// Thread-safe in-memory durable store.
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    entities: RwLock<BTreeMap<EntityId, Entity>>,
}

impl InMemoryDurableStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.read().map_or(0, |entities| entities.len())
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of everything stored, ascending by ID.
    pub fn all(&self) -> Result<Vec<Entity>, StorageError> {
        let entities = self.entities.read().map_err(|_| lock_err("durable.all"))?;
        Ok(entities.values().cloned().collect())
    }
}

impl DurableStore for InMemoryDurableStore {
    fn commit_entity(&self, entity: &Entity) -> Result<(), StorageError> {
        let mut entities = self.entities.write().map_err(|_| lock_err("durable.commit"))?;
        if let Some(prev) = entities.get(&entity.id) {
            if entity.version < prev.version {
                return Err(StorageError::BackendError(format!(
                    "stale commit: id={} stored={} new={}",
                    entity.id, prev.version, entity.version
                )));
            }
        }
        entities.insert(entity.id, entity.clone());
        Ok(())
    }

    fn delete_entity(&self, id: EntityId) -> Result<(), StorageError> {
        let mut entities = self.entities.write().map_err(|_| lock_err("durable.delete"))?;
        entities
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::EntityNotFound(id))
    }

    fn delete_site(&self, site: SiteId) -> Result<(), StorageError> {
        let mut entities = self.entities.write().map_err(|_| lock_err("durable.delete_site"))?;
        let doomed: Vec<EntityId> = entities.range(site_range(site)).map(|(id, _)| *id).collect();
        if doomed.is_empty() {
            return Err(StorageError::SiteNotFound(site));
        }
        for id in doomed {
            entities.remove(&id);
        }
        Ok(())
    }

    fn get(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        let entities = self.entities.read().map_err(|_| lock_err("durable.get"))?;
        Ok(entities.get(&id).cloned())
    }

    fn list_site(&self, site: SiteId) -> Result<Vec<EntityId>, StorageError> {
        let entities = self.entities.read().map_err(|_| lock_err("durable.list_site"))?;
        Ok(entities.range(site_range(site)).map(|(id, _)| *id).collect())
    }
}
