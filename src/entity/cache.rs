//! The live entity cache and the resolver contract the commit worker uses.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::change::{ChangeListener, FieldSet, FlagChanges, IdChanges};
use crate::error::{CommitError, CommitResult, ContractViolation};

use super::handle::EntityRef;
use super::id::{EntityId, Field};
use super::record::Entity;

/// Entity lookup used by the commit worker.
pub trait EntityResolver: Send + Sync {
    /// Handle to a live entity: `None` if missing, deleted or pending delete.
    fn resolve(&self, id: EntityId) -> Option<EntityRef>;

    /// Handle regardless of deletion state, `None` only if not cached.
    /// Used by the deletion cascade to reach entities mid-deletion.
    fn resolve_any(&self, id: EntityId) -> Option<EntityRef>;

    /// Drops an entity from the cache after its durable delete.
    fn evict(&self, id: EntityId);
}

/// In-memory cache of live entities.
///
/// The cache never re-materializes an entity that is pending delete: both
/// [`EntityCache::load`] and [`EntityResolver::resolve`] check the listener
/// first.
pub struct EntityCache {
    entries: RwLock<HashMap<EntityId, EntityRef>>,
    listener: Arc<dyn ChangeListener>,
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache").field("len", &self.len()).finish()
    }
}

impl EntityCache {
    /// Empty cache reporting changes and delete checks to `listener`.
    pub fn new(listener: Arc<dyn ChangeListener>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            listener,
        }
    }

    /// Creates a new, empty entity and reports it so that it gets committed.
    ///
    /// # Errors
    /// - `Contract(DuplicateEntity)` if the ID is already cached
    /// - `EntityUnavailable` if the ID is pending delete
    pub fn create(&self, id: EntityId) -> CommitResult<EntityRef> {
        let handle = self.insert(Entity::new(id))?;
        self.listener
            .entity_changed(id, &FieldSet::new(), &FlagChanges::new(), &IdChanges::new());
        Ok(handle)
    }

    /// Brings a stored entity back into the cache.
    ///
    /// # Errors
    /// - `EntityUnavailable` if the entity is deleted or pending delete
    /// - `Contract(DuplicateEntity)` if the ID is already cached
    pub fn load(&self, entity: Entity) -> CommitResult<EntityRef> {
        if entity.deleted {
            return Err(CommitError::EntityUnavailable { id: entity.id });
        }
        self.insert(entity)
    }

    fn insert(&self, entity: Entity) -> CommitResult<EntityRef> {
        let id = entity.id;
        if self.listener.is_delete_pending(id) {
            debug!(entity = %id, "entity.cache.refused_pending_delete");
            return Err(CommitError::EntityUnavailable { id });
        }
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CommitError::poisoned("entity cache"))?;
        if entries.contains_key(&id) {
            return Err(ContractViolation::DuplicateEntity { id }.into());
        }
        let handle = EntityRef::new(entity, Arc::clone(&self.listener));
        entries.insert(id, handle.clone());
        Ok(handle)
    }

    /// Number of cached entities, including ones mid-deletion.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |entries| entries.len())
    }

    /// True if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// IDs of every cached entity, including ones mid-deletion.
    #[must_use]
    pub fn ids(&self) -> BTreeSet<EntityId> {
        self.entries
            .read()
            .map(|entries| entries.keys().copied().collect())
            .unwrap_or_default()
    }

    /// `root` plus everything transitively contained in it, where an entity
    /// is contained in another when its `containment` field references it.
    ///
    /// Reads forward references, so the result does not depend on whether
    /// the commit worker has caught up with recent moves.
    #[must_use]
    pub fn collect_contained(&self, root: EntityId, containment: &Field) -> BTreeSet<EntityId> {
        let handles: Vec<EntityRef> = self
            .entries
            .read()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();

        let mut children: HashMap<EntityId, Vec<EntityId>> = HashMap::new();
        for handle in &handles {
            let Ok(snapshot) = handle.snapshot_unchecked() else {
                continue;
            };
            if let Some(value) = snapshot.references.get(containment) {
                for parent in value.ids() {
                    children.entry(parent).or_default().push(snapshot.id);
                }
            }
        }

        let mut out = BTreeSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(next) = queue.pop_front() {
            for child in children.get(&next).into_iter().flatten() {
                if out.insert(*child) {
                    queue.push_back(*child);
                }
            }
        }
        out
    }

    /// Marks `root` and everything it contains deleted and returns the full
    /// set, ready for `enqueue_delete`.
    pub fn mark_deleted_tree(&self, root: EntityId, containment: &Field) -> CommitResult<BTreeSet<EntityId>> {
        let ids = self.collect_contained(root, containment);
        for id in &ids {
            if let Some(handle) = self.resolve_any(*id) {
                handle.mark_deleted()?;
            }
        }
        Ok(ids)
    }
}

impl EntityResolver for EntityCache {
    fn resolve(&self, id: EntityId) -> Option<EntityRef> {
        if self.listener.is_delete_pending(id) {
            return None;
        }
        self.resolve_any(id).filter(EntityRef::is_valid)
    }

    fn resolve_any(&self, id: EntityId) -> Option<EntityRef> {
        self.entries.read().ok()?.get(&id).cloned()
    }

    fn evict(&self, id: EntityId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&id);
        }
    }
}
