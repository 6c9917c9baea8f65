//! Accumulated per-entity change diffs.
//!
//! Every mutation notification is folded into the [`EntityDiff`] of its
//! entity. Folding follows presence semantics for reference IDs:
//!
//! - added then removed: absent from both sets
//! - removed then added: present only in `added`
//! - removed, added, removed again: present only in `removed`
//!
//! The last case is why [`IdDelta`] remembers which entries of `added` were
//! originally present. With that, merging two diffs is the composition of
//! their effects, so a retained diff can be merged with a newer one and give
//! the same result as folding every notification in arrival order.

use std::collections::{BTreeMap, BTreeSet};

use crate::entity::{EntityId, Field, Flag};

/// Set of fields touched since the last commit.
pub type FieldSet = BTreeSet<Field>;

/// Net change of one flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagChange {
    /// The flag was set.
    Added,
    /// The flag was cleared.
    Removed,
}

/// Per-flag net changes.
pub type FlagChanges = BTreeMap<Flag, FlagChange>;

/// Per-field reference deltas.
pub type IdChanges = BTreeMap<Field, IdDelta>;

/// IDs added to and removed from one reference field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdDelta {
    /// IDs the field gained.
    pub added: BTreeSet<EntityId>,
    /// IDs the field lost.
    pub removed: BTreeSet<EntityId>,
    /// Members of `added` that were removed earlier in the same diff.
    restored: BTreeSet<EntityId>,
}

impl IdDelta {
    /// Delta adding the given IDs.
    #[must_use]
    pub fn added(ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            added: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Delta removing the given IDs.
    #[must_use]
    pub fn removed(ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            removed: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Builder-style: also remove the given IDs.
    #[must_use]
    pub fn and_removed(mut self, ids: impl IntoIterator<Item = EntityId>) -> Self {
        self.removed.extend(ids);
        self
    }

    /// True if the delta changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Records that `id` was added after everything already in the delta.
    pub fn record_added(&mut self, id: EntityId) {
        if self.removed.remove(&id) {
            self.restored.insert(id);
        }
        self.added.insert(id);
    }

    /// Records that `id` was removed after everything already in the delta.
    pub fn record_removed(&mut self, id: EntityId) {
        if self.added.remove(&id) {
            if self.restored.remove(&id) {
                self.removed.insert(id);
            }
        } else {
            self.removed.insert(id);
        }
    }

    fn record_restored(&mut self, id: EntityId) {
        if self.added.contains(&id) {
            return;
        }
        self.removed.remove(&id);
        self.added.insert(id);
        self.restored.insert(id);
    }

    /// Folds a later delta into this one.
    ///
    /// Within `later`, removals are applied before additions.
    pub fn merge(&mut self, later: &IdDelta) {
        for id in &later.removed {
            self.record_removed(*id);
        }
        for id in &later.added {
            if later.restored.contains(id) {
                self.record_restored(*id);
            } else {
                self.record_added(*id);
            }
        }
    }
}

/// The accumulated, merged changes of one entity awaiting commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDiff {
    entity_id: EntityId,
    /// Value fields touched.
    pub fields_changed: FieldSet,
    /// Net flag changes.
    pub flags_changed: FlagChanges,
    /// Net reference deltas, per field.
    pub ids_changed: IdChanges,
    attempts: u32,
}

impl EntityDiff {
    /// Empty diff for `entity_id`.
    #[must_use]
    pub fn new(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            fields_changed: FieldSet::new(),
            flags_changed: FlagChanges::new(),
            ids_changed: IdChanges::new(),
            attempts: 0,
        }
    }

    /// The entity this diff belongs to.
    #[must_use]
    pub const fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    /// Number of failed commit attempts so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// True if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields_changed.is_empty() && self.flags_changed.is_empty() && self.ids_changed.is_empty()
    }

    /// Whether any reference field changed.
    #[must_use]
    pub fn has_id_changes(&self) -> bool {
        !self.ids_changed.is_empty()
    }

    /// Merges one change notification into this diff.
    pub fn merge_update(&mut self, fields: &FieldSet, flags: &FlagChanges, ids: &IdChanges) {
        self.fields_changed.extend(fields.iter().cloned());

        for (flag, change) in flags {
            match (self.flags_changed.get(flag).copied(), change) {
                (Some(FlagChange::Added), FlagChange::Removed) => {
                    self.flags_changed.remove(flag);
                }
                _ => {
                    self.flags_changed.insert(flag.clone(), *change);
                }
            }
        }

        for (field, delta) in ids {
            let entry = self.ids_changed.entry(field.clone()).or_default();
            entry.merge(delta);
            if entry.is_empty() {
                self.ids_changed.remove(field);
            }
        }
    }

    /// Merges a newer diff of the same entity into this (older) one.
    ///
    /// The failure count of the older diff is kept.
    pub fn merge_diff(&mut self, later: &EntityDiff) {
        debug_assert_eq!(self.entity_id, later.entity_id);
        self.merge_update(&later.fields_changed, &later.flags_changed, &later.ids_changed);
    }

    pub(crate) fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }
}
