//! Back-reference maintenance.
//!
//! A forward reference `A.field -> B` is mirrored by a back-reference record
//! `(A, field)` on `B`. Producers only ever change forward references; the
//! commit worker replays their ID deltas through [`ReferenceIntegrity`] to
//! keep the mirror in step, and scrubs every reference to an entity before
//! that entity is durably deleted.
//!
//! All edits here are idempotent, so a diff whose commit failed can be
//! re-applied on the next cycle.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::change::IdChanges;
use crate::entity::{Entity, EntityId, EntityResolver, Field};
use crate::error::CommitResult;

/// Entities edited while scrubbing a deleted entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrubOutcome {
    /// Entities that had the deleted entity removed from a reference field.
    pub sources: BTreeSet<EntityId>,
    /// Entities that lost a back-reference record left by the deleted entity.
    pub released: BTreeSet<EntityId>,
}

impl ScrubOutcome {
    /// Every entity that needs a commit after the scrub.
    #[must_use]
    pub fn touched(&self) -> BTreeSet<EntityId> {
        self.sources.union(&self.released).copied().collect()
    }
}

/// Reference-graph editor used by the commit worker.
pub struct ReferenceIntegrity<'a> {
    resolver: &'a dyn EntityResolver,
}

impl<'a> ReferenceIntegrity<'a> {
    /// Editor over the entities `resolver` can reach.
    #[must_use]
    pub fn new(resolver: &'a dyn EntityResolver) -> Self {
        Self { resolver }
    }

    /// Records that `source.field` references `target`.
    ///
    /// Idempotent. Entities mid-deletion still receive the record so the
    /// deletion cascade finds and scrubs `source`. Returns `Ok(false)` if
    /// nothing changed or the target no longer exists.
    pub fn add_back_reference(
        &self,
        source: EntityId,
        target: EntityId,
        field: &Field,
    ) -> CommitResult<bool> {
        match self.resolver.resolve_any(target) {
            Some(handle) => handle.insert_back_reference(source, field),
            None => Ok(false),
        }
    }

    /// Drops the record `(source, field)` from `target`.
    ///
    /// No-op if the record is absent or `target` is not a live entity.
    pub fn remove_back_reference(
        &self,
        source: EntityId,
        target: EntityId,
        field: &Field,
    ) -> CommitResult<bool> {
        match self.resolver.resolve(target) {
            Some(handle) => handle.delete_back_reference(source, field),
            None => Ok(false),
        }
    }

    /// Replays the ID deltas of one diff. Adds are applied before removes,
    /// so an ID present in both ends up absent.
    ///
    /// A reference to an entity that no longer exists at all is dangling; it
    /// is removed from `source` directly.
    ///
    /// Returns every entity whose stored state changed.
    pub fn apply_id_changes(
        &self,
        source: EntityId,
        ids_changed: &IdChanges,
    ) -> CommitResult<BTreeSet<EntityId>> {
        let mut touched = BTreeSet::new();
        let mut dangling: Vec<(&Field, EntityId)> = Vec::new();

        for (field, delta) in ids_changed {
            for target in &delta.added {
                if self.resolver.resolve_any(*target).is_none() {
                    dangling.push((field, *target));
                } else if self.add_back_reference(source, *target, field)? {
                    touched.insert(*target);
                }
            }
        }
        for (field, delta) in ids_changed {
            for target in &delta.removed {
                if self.remove_back_reference(source, *target, field)? {
                    touched.insert(*target);
                }
            }
        }

        if !dangling.is_empty() {
            if let Some(handle) = self.resolver.resolve_any(source) {
                for (field, target) in dangling {
                    if handle.scrub_reference(field, target)? {
                        debug!(source = %source, target = %target, field = %field, "integrity.dangling.scrubbed");
                        touched.insert(source);
                    }
                }
            }
        }
        Ok(touched)
    }

    /// Drops the records `source` left through references it has since
    /// removed, for removals that never went through
    /// [`ReferenceIntegrity::apply_id_changes`].
    ///
    /// Targets mid-deletion are released too, so their own cascade does not
    /// scrub `source`. Returns the targets that changed.
    pub fn release_references(
        &self,
        source: EntityId,
        references: &[(Field, EntityId)],
    ) -> CommitResult<BTreeSet<EntityId>> {
        let mut released = BTreeSet::new();
        for (field, target) in references {
            if *target == source {
                continue;
            }
            if let Some(handle) = self.resolver.resolve_any(*target) {
                if handle.delete_back_reference(source, field)? {
                    released.insert(*target);
                }
            }
        }
        Ok(released)
    }

    /// Removes every reference to `target` ahead of its durable delete.
    ///
    /// For each back-reference record `(source, field)` on `target`, the
    /// target is removed from `source.field` (a single-ID field is cleared,
    /// a list or set loses the ID) and the record is dropped. Missing sources
    /// are skipped. The back-references `target` itself left on other
    /// entities are released as well.
    pub fn scrub_all_references(&self, target: EntityId) -> CommitResult<ScrubOutcome> {
        let mut outcome = ScrubOutcome::default();
        let Some(handle) = self.resolver.resolve_any(target) else {
            return Ok(outcome);
        };

        for (source, field) in handle.take_back_references()? {
            if source == target {
                continue;
            }
            let Some(source_handle) = self.resolver.resolve_any(source) else {
                continue;
            };
            if source_handle.scrub_reference(&field, target)? {
                outcome.sources.insert(source);
            }
        }

        for (field, other) in handle.forward_references_unchecked()? {
            if other == target {
                continue;
            }
            if let Some(other_handle) = self.resolver.resolve_any(other) {
                if other_handle.delete_back_reference(target, &field)? {
                    outcome.released.insert(other);
                }
            }
        }
        Ok(outcome)
    }
}

/// A break in the forward/back-reference mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    /// `source.field` references `target`, which has no matching record.
    MissingBackReference {
        /// Entity holding the reference field.
        source: EntityId,
        /// The reference field.
        field: Field,
        /// Referenced entity.
        target: EntityId,
    },
    /// `target` records `(source, field)` but `source.field` does not
    /// reference it.
    OrphanBackReference {
        /// Referenced entity.
        target: EntityId,
        /// Entity holding the reference field.
        source: EntityId,
        /// The reference field.
        field: Field,
    },
    /// `source.field` references an entity outside the audited set.
    DanglingReference {
        /// Entity holding the reference field.
        source: EntityId,
        /// The reference field.
        field: Field,
        /// Referenced entity.
        target: EntityId,
    },
}

/// Checks the mirror over a closed set of entities.
///
/// Empty once the commit worker has caught up with every change.
#[must_use]
pub fn audit<'e>(entities: impl IntoIterator<Item = &'e Entity>) -> Vec<IntegrityIssue> {
    let by_id: BTreeMap<EntityId, &Entity> = entities.into_iter().map(|e| (e.id, e)).collect();
    let mut issues = Vec::new();

    for entity in by_id.values() {
        for (field, target) in entity.forward_references() {
            match by_id.get(&target) {
                Some(t) if t.has_back_reference(entity.id, &field) => {}
                Some(_) => issues.push(IntegrityIssue::MissingBackReference {
                    source: entity.id,
                    field,
                    target,
                }),
                None => issues.push(IntegrityIssue::DanglingReference {
                    source: entity.id,
                    field,
                    target,
                }),
            }
        }

        for (source, fields) in &entity.back_references {
            for field in fields {
                let mirrored = by_id
                    .get(source)
                    .and_then(|s| s.references.get(field))
                    .is_some_and(|value| value.contains(entity.id));
                if !mirrored {
                    issues.push(IntegrityIssue::OrphanBackReference {
                        target: entity.id,
                        source: *source,
                        field: field.clone(),
                    });
                }
            }
        }
    }
    issues
}
