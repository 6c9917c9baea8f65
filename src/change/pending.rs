//! The pending change store.
//!
//! Producers merge notifications and enqueue deletions here under a single
//! mutex. The commit worker periodically swaps the accumulated containers
//! out ([`PendingChanges::drain`]) and works on them without holding the lock,
//! so producers never wait on storage I/O.
//!
//! Entity deletions are visible to [`PendingChanges::is_delete_pending`] from
//! the moment they are enqueued until the worker reports the durable delete
//! complete, including the window where the worker owns the drained batch.
//! A delete the worker gives up on stays visible as abandoned, so the stored
//! copy of the entity is never loaded back.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{error, warn};

use crate::entity::{EntityId, Field, SiteId};
use crate::error::{CommitError, CommitResult, ContractViolation};

use super::diff::{EntityDiff, FieldSet, FlagChanges, IdChanges};
use super::listener::ChangeListener;

#[derive(Debug, Default)]
struct PendingState {
    updates: BTreeMap<EntityId, EntityDiff>,
    deletes: BTreeSet<EntityId>,
    site_deletes: Vec<SiteId>,
    /// Drained deletes the worker has not finished yet.
    deleting: BTreeSet<EntityId>,
    /// Deletes given up after the retry bound; only a new enqueue clears them.
    abandoned: BTreeSet<EntityId>,
    /// Reference removals carried by diffs a delete superseded.
    stale_references: BTreeMap<EntityId, Vec<(Field, EntityId)>>,
}

impl PendingState {
    fn is_delete_pending(&self, id: EntityId) -> bool {
        self.deletes.contains(&id) || self.deleting.contains(&id) || self.abandoned.contains(&id)
    }

    fn supersede_update(&mut self, id: EntityId) {
        let Some(diff) = self.updates.remove(&id) else {
            return;
        };
        let removed: Vec<(Field, EntityId)> = diff
            .ids_changed
            .iter()
            .flat_map(|(field, delta)| delta.removed.iter().map(move |target| (field.clone(), *target)))
            .collect();
        if !removed.is_empty() {
            self.stale_references.entry(id).or_default().extend(removed);
        }
    }

    fn site_has_deletes(&self, site: SiteId) -> bool {
        let range = EntityId::new(site, 0)..=EntityId::new(site, u64::MAX);
        self.deletes.range(range.clone()).next().is_some()
            || self.deleting.range(range).next().is_some()
    }
}

/// Work taken out of the store by one drain.
#[derive(Debug, Default)]
pub struct DrainedBatch {
    /// Merged diffs of live entities.
    pub updates: BTreeMap<EntityId, EntityDiff>,
    /// Entities to scrub and delete, now in flight.
    pub deletes: BTreeSet<EntityId>,
    /// Sites to delete, oldest request first.
    pub site_deletes: Vec<SiteId>,
    /// Per deleted entity, `(field, target)` references it dropped in a diff
    /// that never reached the worker. Their back-references still need
    /// releasing.
    pub stale_references: BTreeMap<EntityId, Vec<(Field, EntityId)>>,
}

impl DrainedBatch {
    /// True if the drain found no work.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.deletes.is_empty() && self.site_deletes.is_empty()
    }
}

/// Point-in-time sizes of the pending containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Entities with a pending diff.
    pub updates: usize,
    /// Deletes queued for the next cycle.
    pub deletes: usize,
    /// Deletes drained by a cycle that has not finished them.
    pub in_flight_deletes: usize,
    /// Queued site deletes.
    pub site_deletes: usize,
    /// Deletes the worker gave up on. These never make the store busy.
    pub abandoned_deletes: usize,
}

impl PendingCounts {
    /// True when nothing is queued and nothing is in flight. Abandoned
    /// deletes do not count.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.updates == 0 && self.deletes == 0 && self.in_flight_deletes == 0 && self.site_deletes == 0
    }
}

/// Pending updates, deletes and site deletes awaiting the commit worker.
#[derive(Debug, Default)]
pub struct PendingChanges {
    state: Mutex<PendingState>,
    violations: AtomicU64,
}

impl PendingChanges {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> CommitResult<MutexGuard<'_, PendingState>> {
        self.state.lock().map_err(|_| {
            error!("commit.pending.lock_poisoned");
            CommitError::poisoned("pending changes")
        })
    }

    /// Merges a change notification, reporting contract violations.
    ///
    /// # Errors
    /// - `Contract(NotifyWhileDeletePending)` if `id` is pending delete; the
    ///   notification is dropped.
    /// - `LockPoisoned` if the store is unusable.
    pub fn try_notify(
        &self,
        id: EntityId,
        fields_changed: &FieldSet,
        flags_changed: &FlagChanges,
        ids_changed: &IdChanges,
    ) -> CommitResult<()> {
        let mut state = self.lock()?;
        if state.is_delete_pending(id) {
            drop(state);
            self.record_violation();
            return Err(ContractViolation::NotifyWhileDeletePending { id }.into());
        }
        state
            .updates
            .entry(id)
            .or_insert_with(|| EntityDiff::new(id))
            .merge_update(fields_changed, flags_changed, ids_changed);
        Ok(())
    }

    /// Merges a change notification. Violations are logged and counted.
    pub fn notify(
        &self,
        id: EntityId,
        fields_changed: &FieldSet,
        flags_changed: &FlagChanges,
        ids_changed: &IdChanges,
    ) {
        if let Err(err) = self.try_notify(id, fields_changed, flags_changed, ids_changed) {
            warn!(entity = %id, error = %err, "commit.notify.rejected");
        }
    }

    /// Queues entities for deletion.
    ///
    /// The caller must already have marked every entity deleted and expanded
    /// the set to include everything they contain. Pending updates of these
    /// entities are discarded, except for the references they removed, which
    /// the worker still releases. Re-enqueueing an abandoned delete retries
    /// it.
    pub fn enqueue_delete(&self, ids: impl IntoIterator<Item = EntityId>) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        for id in ids {
            state.supersede_update(id);
            state.abandoned.remove(&id);
            state.deletes.insert(id);
        }
    }

    /// Queues a whole site for deletion. The site must already be marked
    /// delete pending and its entities enqueued individually.
    pub fn enqueue_site_delete(&self, site: SiteId) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        if !state.site_deletes.contains(&site) {
            state.site_deletes.push(site);
        }
    }

    /// Whether `id` is queued, in flight or abandoned for deletion.
    ///
    /// Only true at the instant queried; callers must re-check before acting
    /// on the entity later. Answers `true` if the store is unusable so that
    /// nothing is resurrected.
    #[must_use]
    pub fn is_delete_pending(&self, id: EntityId) -> bool {
        self.lock().map_or(true, |state| state.is_delete_pending(id))
    }

    /// Whether any entity of `site` is queued or in flight for deletion.
    #[must_use]
    pub fn site_has_pending_deletes(&self, site: SiteId) -> bool {
        self.lock().map_or(true, |state| state.site_has_deletes(site))
    }

    /// Current container sizes; all zero if the store is unusable.
    #[must_use]
    pub fn counts(&self) -> PendingCounts {
        self.lock()
            .map(|state| PendingCounts {
                updates: state.updates.len(),
                deletes: state.deletes.len(),
                in_flight_deletes: state.deleting.len(),
                site_deletes: state.site_deletes.len(),
                abandoned_deletes: state.abandoned.len(),
            })
            .unwrap_or_default()
    }

    /// Number of contract violations detected so far.
    #[must_use]
    pub fn contract_violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    pub(crate) fn record_violation(&self) {
        self.violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Swaps out everything queued so far. Drained deletes stay visible as
    /// in flight until completed or requeued.
    pub(crate) fn drain(&self) -> CommitResult<DrainedBatch> {
        let mut state = self.lock()?;
        let batch = DrainedBatch {
            updates: mem::take(&mut state.updates),
            deletes: mem::take(&mut state.deletes),
            site_deletes: mem::take(&mut state.site_deletes),
            stale_references: mem::take(&mut state.stale_references),
        };
        state.deleting.extend(batch.deletes.iter().copied());
        Ok(batch)
    }

    /// Puts a failed diff back, ahead of anything that arrived since the
    /// drain. Returns false if the entity was deleted in the meantime.
    pub(crate) fn requeue_update(&self, diff: EntityDiff) -> CommitResult<bool> {
        let mut state = self.lock()?;
        let id = diff.entity_id();
        if state.is_delete_pending(id) {
            return Ok(false);
        }
        let merged = match state.updates.remove(&id) {
            Some(newer) => {
                let mut older = diff;
                older.merge_diff(&newer);
                older
            }
            None => diff,
        };
        state.updates.insert(id, merged);
        Ok(true)
    }

    /// Moves an in-flight delete back to the queue for the next cycle.
    pub(crate) fn requeue_delete(&self, id: EntityId) -> CommitResult<()> {
        let mut state = self.lock()?;
        state.deleting.remove(&id);
        state.deletes.insert(id);
        Ok(())
    }

    /// Marks an in-flight delete as durably done.
    pub(crate) fn complete_delete(&self, id: EntityId) -> CommitResult<()> {
        self.lock()?.deleting.remove(&id);
        Ok(())
    }

    /// Gives up on an in-flight delete. The entity stays delete pending
    /// until it is enqueued again.
    pub(crate) fn abandon_delete(&self, id: EntityId) -> CommitResult<()> {
        let mut state = self.lock()?;
        state.deleting.remove(&id);
        state.abandoned.insert(id);
        Ok(())
    }

    /// Puts deferred site deletes back ahead of newer ones, keeping order.
    pub(crate) fn requeue_site_deletes(&self, sites: &[SiteId]) -> CommitResult<()> {
        if sites.is_empty() {
            return Ok(());
        }
        let mut state = self.lock()?;
        let newer = mem::take(&mut state.site_deletes);
        let mut merged: Vec<SiteId> = sites.to_vec();
        for site in newer {
            if !merged.contains(&site) {
                merged.push(site);
            }
        }
        state.site_deletes = merged;
        Ok(())
    }
}

impl ChangeListener for PendingChanges {
    fn entity_changed(
        &self,
        id: EntityId,
        fields_changed: &FieldSet,
        flags_changed: &FlagChanges,
        ids_changed: &IdChanges,
    ) {
        self.notify(id, fields_changed, flags_changed, ids_changed);
    }

    fn is_delete_pending(&self, id: EntityId) -> bool {
        PendingChanges::is_delete_pending(self, id)
    }
}
