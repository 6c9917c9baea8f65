//! Validity-checked entity handles.
//!
//! Producers mutate entities through [`EntityRef`]. Every mutation updates the
//! record under its own lock and then reports the change to the entity's
//! [`ChangeListener`] synchronously, after the record lock is released.
//!
//! A handle to an entity that is deleted or pending delete refuses both reads
//! and writes, so stale state is never handed out and never re-enters the
//! commit pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::change::{ChangeListener, FieldSet, FlagChange, FlagChanges, IdChanges, IdDelta};
use crate::error::{CommitError, CommitResult, ContractViolation};

use super::id::{EntityId, Field, Flag};
use super::record::Entity;
use super::value::{IdValue, Value};

struct EntityCell {
    id: EntityId,
    entity: RwLock<Entity>,
    listener: Arc<dyn ChangeListener>,
}

/// Shared handle to a cached entity.
#[derive(Clone)]
pub struct EntityRef {
    cell: Arc<EntityCell>,
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef").field("id", &self.cell.id).finish()
    }
}

/// Change report produced by one mutation.
#[derive(Default)]
struct Change {
    fields: FieldSet,
    flags: FlagChanges,
    ids: IdChanges,
}

impl Change {
    fn field(field: &Field) -> Self {
        Self {
            fields: FieldSet::from([field.clone()]),
            ..Self::default()
        }
    }

    fn flag(flag: &Flag, change: FlagChange) -> Self {
        Self {
            flags: FlagChanges::from([(flag.clone(), change)]),
            ..Self::default()
        }
    }

    fn ids(field: &Field, delta: IdDelta) -> Self {
        Self {
            fields: FieldSet::from([field.clone()]),
            ids: IdChanges::from([(field.clone(), delta)]),
            ..Self::default()
        }
    }
}

impl EntityRef {
    pub(crate) fn new(entity: Entity, listener: Arc<dyn ChangeListener>) -> Self {
        Self {
            cell: Arc::new(EntityCell {
                id: entity.id,
                entity: RwLock::new(entity),
                listener,
            }),
        }
    }

    /// ID of the entity, valid or not.
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.cell.id
    }

    /// True if the entity is neither deleted nor pending delete.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.cell.listener.is_delete_pending(self.cell.id) {
            return false;
        }
        self.read_guard().is_ok_and(|entity| !entity.deleted)
    }

    /// Reads the entity if it is still valid.
    ///
    /// # Errors
    /// `EntityUnavailable` if the entity is deleted or pending delete.
    pub fn read<R>(&self, f: impl FnOnce(&Entity) -> R) -> CommitResult<R> {
        if self.cell.listener.is_delete_pending(self.cell.id) {
            return Err(CommitError::EntityUnavailable { id: self.cell.id });
        }
        let entity = self.read_guard()?;
        if entity.deleted {
            return Err(CommitError::EntityUnavailable { id: self.cell.id });
        }
        Ok(f(&entity))
    }

    /// Clone of the current record, if still valid.
    pub fn snapshot(&self) -> CommitResult<Entity> {
        self.read(Clone::clone)
    }

    /// Current value of `field`.
    ///
    /// # Errors
    /// `EntityUnavailable` if the entity is deleted or pending delete.
    pub fn field(&self, field: &Field) -> CommitResult<Option<Value>> {
        self.read(|e| e.fields.get(field).cloned())
    }

    /// Current contents of the reference field `field`.
    pub fn reference(&self, field: &Field) -> CommitResult<Option<IdValue>> {
        self.read(|e| e.references.get(field).cloned())
    }

    /// Whether `flag` is set.
    pub fn has_flag(&self, flag: &Flag) -> CommitResult<bool> {
        self.read(|e| e.flags.contains(flag))
    }

    /// Sets a value field and reports the change. Returns `Ok(false)` if the
    /// value was already there.
    ///
    /// # Errors
    /// `Contract(MutateDeletedEntity)` if the entity is pending delete.
    pub fn set_field(&self, field: &Field, value: impl Into<Value>) -> CommitResult<bool> {
        let value = value.into();
        self.mutate(|entity| {
            if entity.fields.get(field) == Some(&value) {
                return None;
            }
            entity.fields.insert(field.clone(), value);
            Some(Change::field(field))
        })
    }

    /// Removes a value field. `Ok(false)` if it was not set.
    pub fn clear_field(&self, field: &Field) -> CommitResult<bool> {
        self.mutate(|entity| entity.fields.remove(field).map(|_| Change::field(field)))
    }

    /// Sets a flag. `Ok(false)` if it was already set.
    pub fn set_flag(&self, flag: &Flag) -> CommitResult<bool> {
        self.mutate(|entity| {
            entity
                .flags
                .insert(flag.clone())
                .then(|| Change::flag(flag, FlagChange::Added))
        })
    }

    /// Clears a flag. `Ok(false)` if it was not set.
    pub fn clear_flag(&self, flag: &Flag) -> CommitResult<bool> {
        self.mutate(|entity| {
            entity
                .flags
                .remove(flag)
                .then(|| Change::flag(flag, FlagChange::Removed))
        })
    }

    /// Points a single-ID field at `target`, or clears it with `None`.
    pub fn set_reference(&self, field: &Field, target: Option<EntityId>) -> CommitResult<bool> {
        self.mutate(|entity| {
            let previous = entity.references.get(field).map(IdValue::ids).unwrap_or_default();
            let next: BTreeSet<EntityId> = target.into_iter().collect();
            if previous == next && matches!(entity.references.get(field), Some(IdValue::Single(_)) | None) {
                return None;
            }
            match target {
                Some(id) => entity.references.insert(field.clone(), IdValue::Single(id)),
                None => entity.references.remove(field),
            };
            Some(Change::ids(field, delta_between(&previous, &next)))
        })
    }

    /// Adds `target` to an unordered ID-set field.
    pub fn add_to_set(&self, field: &Field, target: EntityId) -> CommitResult<bool> {
        self.mutate(|entity| {
            let previous = entity.references.get(field).map(IdValue::ids).unwrap_or_default();
            let mut next = previous.clone();
            if !next.insert(target) {
                return None;
            }
            entity.references.insert(field.clone(), IdValue::Set(next));
            Some(Change::ids(field, IdDelta::added([target])))
        })
    }

    /// Appends `target` to an ordered ID-list field.
    pub fn push_to_list(&self, field: &Field, target: EntityId) -> CommitResult<bool> {
        self.mutate(|entity| {
            let already = entity.references.get(field).is_some_and(|v| v.contains(target));
            let mut list = match entity.references.remove(field) {
                Some(IdValue::List(ids)) => ids,
                Some(other) => other.ids().into_iter().collect(),
                None => Vec::new(),
            };
            list.push(target);
            entity.references.insert(field.clone(), IdValue::List(list));
            if already {
                Some(Change::field(field))
            } else {
                Some(Change::ids(field, IdDelta::added([target])))
            }
        })
    }

    /// Removes every occurrence of `target` from a reference field.
    pub fn remove_reference(&self, field: &Field, target: EntityId) -> CommitResult<bool> {
        self.mutate(|entity| {
            entity
                .remove_reference(field, target)
                .then(|| Change::ids(field, IdDelta::removed([target])))
        })
    }

    /// Marks the entity deleted. It must then be handed to
    /// `enqueue_delete` together with everything it contains.
    pub fn mark_deleted(&self) -> CommitResult<bool> {
        let mut entity = self.write_guard()?;
        if entity.deleted {
            return Ok(false);
        }
        entity.deleted = true;
        entity.touch();
        Ok(true)
    }

    /// Whether the record carries the deleted mark. Reads through pending
    /// deletes, unlike [`EntityRef::is_valid`].
    #[must_use]
    pub fn is_marked_deleted(&self) -> bool {
        self.read_guard().map_or(true, |entity| entity.deleted)
    }

    fn mutate(&self, apply: impl FnOnce(&mut Entity) -> Option<Change>) -> CommitResult<bool> {
        let id = self.cell.id;
        if self.cell.listener.is_delete_pending(id) {
            return Err(ContractViolation::MutateDeletedEntity { id }.into());
        }
        let change = {
            let mut entity = self.write_guard()?;
            if entity.deleted {
                return Err(ContractViolation::MutateDeletedEntity { id }.into());
            }
            let Some(change) = apply(&mut entity) else {
                return Ok(false);
            };
            entity.touch();
            change
        };
        self.cell
            .listener
            .entity_changed(id, &change.fields, &change.flags, &change.ids);
        Ok(true)
    }

    fn read_guard(&self) -> CommitResult<RwLockReadGuard<'_, Entity>> {
        self.cell
            .entity
            .read()
            .map_err(|_| CommitError::poisoned("entity record"))
    }

    fn write_guard(&self) -> CommitResult<RwLockWriteGuard<'_, Entity>> {
        self.cell
            .entity
            .write()
            .map_err(|_| CommitError::poisoned("entity record"))
    }

    // Worker-side access. These bypass validity checks and do not notify:
    // back-reference records are derived state, and scrubs are committed
    // directly by the worker.

    pub(crate) fn snapshot_unchecked(&self) -> CommitResult<Entity> {
        Ok(self.read_guard()?.clone())
    }

    pub(crate) fn insert_back_reference(&self, source: EntityId, field: &Field) -> CommitResult<bool> {
        let mut entity = self.write_guard()?;
        let inserted = entity.insert_back_reference(source, field);
        if inserted {
            entity.touch();
        }
        Ok(inserted)
    }

    pub(crate) fn delete_back_reference(&self, source: EntityId, field: &Field) -> CommitResult<bool> {
        let mut entity = self.write_guard()?;
        let removed = entity.delete_back_reference(source, field);
        if removed {
            entity.touch();
        }
        Ok(removed)
    }

    pub(crate) fn scrub_reference(&self, field: &Field, target: EntityId) -> CommitResult<bool> {
        let mut entity = self.write_guard()?;
        let removed = entity.remove_reference(field, target);
        if removed {
            entity.touch();
        }
        Ok(removed)
    }

    pub(crate) fn take_back_references(&self) -> CommitResult<Vec<(EntityId, Field)>> {
        let mut entity = self.write_guard()?;
        let taken = std::mem::take(&mut entity.back_references);
        if !taken.is_empty() {
            entity.touch();
        }
        Ok(taken
            .into_iter()
            .flat_map(|(source, fields)| fields.into_iter().map(move |f| (source, f)))
            .collect())
    }

    pub(crate) fn forward_references_unchecked(&self) -> CommitResult<Vec<(Field, EntityId)>> {
        Ok(self.read_guard()?.forward_references())
    }
}

fn delta_between(previous: &BTreeSet<EntityId>, next: &BTreeSet<EntityId>) -> IdDelta {
    IdDelta::added(next.difference(previous).copied())
        .and_removed(previous.difference(next).copied())
}
