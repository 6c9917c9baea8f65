//! The commit worker.
//!
//! One cycle drains the pending change store and then, in order: replays ID
//! deltas into back-references, commits updated entities, runs the deletion
//! cascade and deletes sites. Cycles are serialized by a lock, so at most one
//! integrity/commit pass is ever in flight.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use crossbeam_channel::{select, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::change::{EntityDiff, PendingChanges};
use crate::entity::{EntityId, EntityResolver, Field, SiteId};
use crate::error::{CommitError, CommitResult};
use crate::integrity::ReferenceIntegrity;
use crate::storage::{DurableStore, StorageError};

use super::config::CommitConfig;
use super::stats::CommitStats;

/// Where the commit worker currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    /// Waiting for the next interval or a flush.
    Idle = 0,
    /// Swapping the pending containers out.
    Draining = 1,
    /// Replaying ID deltas into back-references.
    Integrating = 2,
    /// Writing updated entities.
    Committing = 3,
    /// Scrubbing and deleting entities.
    DeletingCascade = 4,
    /// Deleting whole sites.
    DeletingSites = 5,
    /// Running the final flush cycles.
    ShuttingDown = 6,
    /// No worker thread is running.
    Stopped = 7,
}

impl WorkerState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Draining,
            2 => Self::Integrating,
            3 => Self::Committing,
            4 => Self::DeletingCascade,
            5 => Self::DeletingSites,
            6 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

/// Shared stop flag, checked by the worker between cycles.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Token that is not cancelled yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the worker to stop after its current cycle.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether [`CancellationToken::cancel`] was called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Summary of one commit cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// When the cycle began.
    pub started_at: DateTime<Utc>,
    /// Diffs drained from the store.
    pub updates: usize,
    /// Entities durably committed, including back-reference and scrub edits.
    pub committed: usize,
    /// Entity commits the store rejected.
    pub commit_failures: usize,
    /// Entities durably deleted.
    pub deleted: usize,
    /// Entity deletes that failed or were postponed.
    pub delete_failures: usize,
    /// Sites durably deleted.
    pub sites_deleted: usize,
    /// Site deletes put back for a later cycle.
    pub sites_deferred: usize,
    /// Work given up for good.
    pub dropped: usize,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            updates: 0,
            committed: 0,
            commit_failures: 0,
            deleted: 0,
            delete_failures: 0,
            sites_deleted: 0,
            sites_deferred: 0,
            dropped: 0,
        }
    }

    /// True if the cycle found nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates == 0
            && self.committed == 0
            && self.deleted == 0
            && self.delete_failures == 0
            && self.sites_deleted == 0
            && self.sites_deferred == 0
            && self.dropped == 0
    }

    /// True if anything failed or was dropped.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.commit_failures > 0 || self.delete_failures > 0 || self.dropped > 0
    }
}

/// State carried from one cycle to the next. Only touched under the cycle
/// lock.
#[derive(Debug, Default)]
struct CycleMemory {
    delete_attempts: HashMap<EntityId, u32>,
    site_attempts: HashMap<SiteId, u32>,
    /// Scrubbed sources whose commit failed, per deleted entity. The delete
    /// waits until they are durable.
    unsettled_sources: HashMap<EntityId, BTreeSet<EntityId>>,
}

pub(crate) enum ControlMsg {
    Flush {
        reply: Sender<CommitResult<CycleReport>>,
    },
    Shutdown,
}

/// Everything a commit cycle needs, shared by the manager and its worker.
pub(crate) struct CommitContext {
    pub pending: Arc<PendingChanges>,
    pub resolver: Arc<dyn EntityResolver>,
    pub storage: Arc<dyn DurableStore>,
    pub config: CommitConfig,
    pub stats: CommitStats,
    state: AtomicU8,
    cycle: Mutex<CycleMemory>,
}

impl CommitContext {
    pub fn new(
        pending: Arc<PendingChanges>,
        resolver: Arc<dyn EntityResolver>,
        storage: Arc<dyn DurableStore>,
        config: CommitConfig,
    ) -> Self {
        Self {
            pending,
            resolver,
            storage,
            config,
            stats: CommitStats::default(),
            state: AtomicU8::new(WorkerState::Stopped as u8),
            cycle: Mutex::new(CycleMemory::default()),
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Runs one full cycle; the state returns to `rest` afterwards.
    ///
    /// # Errors
    /// Only fatal conditions (poisoned locks). Storage failures are handled
    /// per entity and reported in the [`CycleReport`].
    pub fn run_cycle(&self, rest: WorkerState) -> CommitResult<CycleReport> {
        let mut memory = self
            .cycle
            .lock()
            .map_err(|_| CommitError::poisoned("commit cycle"))?;
        let result = self.cycle_locked(&mut memory);
        self.set_state(rest);
        result
    }

    fn cycle_locked(&self, memory: &mut CycleMemory) -> CommitResult<CycleReport> {
        let mut report = CycleReport::new();

        self.set_state(WorkerState::Draining);
        let mut batch = self.pending.drain()?;
        if batch.is_empty() {
            debug!("commit.cycle.idle");
            return Ok(report);
        }
        report.updates = batch.updates.len();

        let integrity = ReferenceIntegrity::new(self.resolver.as_ref());

        self.set_state(WorkerState::Integrating);
        let mut to_commit: BTreeSet<EntityId> = batch.updates.keys().copied().collect();
        for (id, diff) in &batch.updates {
            if diff.has_id_changes() {
                to_commit.extend(integrity.apply_id_changes(*id, &diff.ids_changed)?);
            }
        }

        self.set_state(WorkerState::Committing);
        for id in to_commit {
            let diff = batch.updates.remove(&id);
            if !self.commit_entity(id, diff, &mut report)? {
                report.commit_failures += 1;
            }
        }

        self.set_state(WorkerState::DeletingCascade);
        for id in std::mem::take(&mut batch.deletes) {
            let stale = batch.stale_references.remove(&id).unwrap_or_default();
            self.delete_entity(&integrity, id, &stale, memory, &mut report)?;
        }

        self.set_state(WorkerState::DeletingSites);
        let mut retry_sites = Vec::new();
        for site in std::mem::take(&mut batch.site_deletes) {
            if self.pending.site_has_pending_deletes(site) {
                debug!(site = %site, "commit.site.deferred");
                CommitStats::bump(&self.stats.site_deletes_deferred);
                report.sites_deferred += 1;
                retry_sites.push(site);
                continue;
            }
            if self.delete_site(site, memory, &mut report) {
                retry_sites.push(site);
            }
        }
        self.pending.requeue_site_deletes(&retry_sites)?;

        CommitStats::bump(&self.stats.cycles);
        if report.has_failures() {
            warn!(
                updates = report.updates,
                committed = report.committed,
                commit_failures = report.commit_failures,
                deleted = report.deleted,
                delete_failures = report.delete_failures,
                dropped = report.dropped,
                "commit.cycle.completed_with_failures"
            );
        } else {
            info!(
                updates = report.updates,
                committed = report.committed,
                deleted = report.deleted,
                sites_deleted = report.sites_deleted,
                sites_deferred = report.sites_deferred,
                "commit.cycle.completed"
            );
        }
        Ok(report)
    }

    /// Commits the current state of a live entity.
    ///
    /// Entities that are deleted or pending delete are skipped. On failure
    /// the diff (or an empty one, for worker-only edits) goes back to the
    /// store for the next cycle unless the retry bound is exhausted.
    ///
    /// Returns `Ok(false)` if the storage rejected the commit.
    fn commit_entity(
        &self,
        id: EntityId,
        diff: Option<EntityDiff>,
        report: &mut CycleReport,
    ) -> CommitResult<bool> {
        let Some(handle) = self.resolver.resolve(id) else {
            return Ok(true);
        };
        let snapshot = match handle.snapshot() {
            Ok(snapshot) => snapshot,
            Err(CommitError::EntityUnavailable { .. }) => return Ok(true),
            Err(err) => return Err(err),
        };

        let Err(err) = self.storage.commit_entity(&snapshot) else {
            CommitStats::bump(&self.stats.entities_committed);
            report.committed += 1;
            return Ok(true);
        };

        CommitStats::bump(&self.stats.commit_failures);
        let mut diff = diff.unwrap_or_else(|| EntityDiff::new(id));
        let attempts = diff.record_failure();
        if err.is_transient() && self.config.allows_retry(attempts) {
            warn!(entity = %id, attempts, error = %err, "commit.entity.failed");
            self.pending.requeue_update(diff)?;
        } else {
            error!(entity = %id, attempts, error = %err, "commit.entity.dropped");
            CommitStats::bump(&self.stats.dropped_after_retries);
            report.dropped += 1;
        }
        Ok(false)
    }

    /// Scrubs, then durably deletes, then evicts one entity.
    ///
    /// `stale` holds references the entity dropped in a diff its delete
    /// superseded; their targets are released alongside the scrub.
    fn delete_entity(
        &self,
        integrity: &ReferenceIntegrity<'_>,
        id: EntityId,
        stale: &[(Field, EntityId)],
        memory: &mut CycleMemory,
        report: &mut CycleReport,
    ) -> CommitResult<()> {
        let mut sources = integrity.scrub_all_references(id)?.touched();
        sources.extend(integrity.release_references(id, stale)?);
        if let Some(carried) = memory.unsettled_sources.remove(&id) {
            sources.extend(carried);
        }

        let mut unsettled = BTreeSet::new();
        for source in sources {
            if !self.commit_entity(source, None, report)? {
                report.commit_failures += 1;
                unsettled.insert(source);
            }
        }

        let outcome = if unsettled.is_empty() {
            match self.storage.delete_entity(id) {
                Ok(()) => Ok(()),
                Err(err) if err.is_not_found() => Ok(()),
                Err(err) => Err(err),
            }
        } else {
            memory.unsettled_sources.insert(id, unsettled);
            Err(StorageError::Unavailable(
                "scrubbed references not yet committed".to_string(),
            ))
        };

        match outcome {
            Ok(()) => {
                self.resolver.evict(id);
                self.pending.complete_delete(id)?;
                memory.delete_attempts.remove(&id);
                CommitStats::bump(&self.stats.entities_deleted);
                report.deleted += 1;
                debug!(entity = %id, "commit.delete.completed");
            }
            Err(err) => {
                CommitStats::bump(&self.stats.delete_failures);
                report.delete_failures += 1;
                let attempts = memory.delete_attempts.entry(id).or_insert(0);
                *attempts = attempts.saturating_add(1);
                let attempts = *attempts;
                if err.is_transient() && self.config.allows_retry(attempts) {
                    warn!(entity = %id, attempts, error = %err, "commit.delete.failed");
                    self.pending.requeue_delete(id)?;
                } else {
                    // Stays delete pending so the stored copy is never loaded.
                    error!(entity = %id, attempts, error = %err, "commit.delete.abandoned");
                    memory.delete_attempts.remove(&id);
                    memory.unsettled_sources.remove(&id);
                    self.resolver.evict(id);
                    self.pending.abandon_delete(id)?;
                    CommitStats::bump(&self.stats.dropped_after_retries);
                    report.dropped += 1;
                }
            }
        }
        Ok(())
    }

    /// Deletes one site. Returns true if it should be retried next cycle.
    fn delete_site(&self, site: SiteId, memory: &mut CycleMemory, report: &mut CycleReport) -> bool {
        let err = match self.storage.delete_site(site) {
            Ok(()) => None,
            Err(err) if err.is_not_found() => None,
            Err(err) => Some(err),
        };
        let Some(err) = err else {
            memory.site_attempts.remove(&site);
            CommitStats::bump(&self.stats.sites_deleted);
            report.sites_deleted += 1;
            info!(site = %site, "commit.site.deleted");
            return false;
        };

        CommitStats::bump(&self.stats.site_delete_failures);
        let attempts = memory.site_attempts.entry(site).or_insert(0);
        *attempts = attempts.saturating_add(1);
        let attempts = *attempts;
        if err.is_transient() && self.config.allows_retry(attempts) {
            warn!(site = %site, attempts, error = %err, "commit.site.failed");
            true
        } else {
            error!(site = %site, attempts, error = %err, "commit.site.dropped");
            memory.site_attempts.remove(&site);
            CommitStats::bump(&self.stats.dropped_after_retries);
            report.dropped += 1;
            false
        }
    }
}

enum Step {
    Continue,
    Stop,
    Fatal(CommitError),
}

pub(crate) fn worker_loop(ctx: &CommitContext, control_rx: &Receiver<ControlMsg>, cancel: &CancellationToken) {
    ctx.set_state(WorkerState::Idle);
    info!(interval_ms = ctx.config.commit_interval.as_millis(), "commit.worker.started");

    while !cancel.is_cancelled() {
        let step = select! {
            recv(control_rx) -> msg => match msg {
                Ok(ControlMsg::Flush { reply }) => {
                    let result = ctx.run_cycle(WorkerState::Idle);
                    let fatal = result.as_ref().err().is_some_and(CommitError::is_fatal);
                    let _ = reply.send(result);
                    if fatal {
                        Step::Fatal(CommitError::poisoned("commit cycle"))
                    } else {
                        Step::Continue
                    }
                }
                Ok(ControlMsg::Shutdown) | Err(_) => Step::Stop,
            },
            default(ctx.config.commit_interval) => match ctx.run_cycle(WorkerState::Idle) {
                Ok(_) => Step::Continue,
                Err(err) if err.is_fatal() => Step::Fatal(err),
                Err(err) => {
                    warn!(error = %err, "commit.cycle.failed");
                    Step::Continue
                }
            },
        };

        match step {
            Step::Continue => {}
            Step::Stop => break,
            Step::Fatal(err) => {
                error!(error = %err, "commit.worker.fatal");
                ctx.set_state(WorkerState::Stopped);
                return;
            }
        }
    }

    ctx.set_state(WorkerState::ShuttingDown);
    for attempt in 0..ctx.config.shutdown_flush_attempts {
        if ctx.pending.counts().is_idle() {
            break;
        }
        if let Err(err) = ctx.run_cycle(WorkerState::ShuttingDown) {
            error!(attempt, error = %err, "commit.worker.shutdown_flush_failed");
            break;
        }
    }

    let left = ctx.pending.counts();
    if !left.is_idle() {
        warn!(
            updates = left.updates,
            deletes = left.deletes + left.in_flight_deletes,
            site_deletes = left.site_deletes,
            "commit.worker.shutdown_incomplete"
        );
    }
    ctx.set_state(WorkerState::Stopped);
    info!("commit.worker.stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeListener;
    use crate::entity::EntityCache;
    use crate::storage::InMemoryDurableStore;

    fn id(local: u64) -> EntityId {
        EntityId::new(SiteId::new(1), local)
    }

    fn context() -> (Arc<EntityCache>, Arc<InMemoryDurableStore>, CommitContext) {
        let pending = Arc::new(PendingChanges::new());
        let cache = Arc::new(EntityCache::new(Arc::clone(&pending) as Arc<dyn ChangeListener>));
        let storage = Arc::new(InMemoryDurableStore::new());
        let ctx = CommitContext::new(
            pending,
            Arc::clone(&cache) as Arc<dyn EntityResolver>,
            Arc::clone(&storage) as Arc<dyn DurableStore>,
            CommitConfig::default(),
        );
        (cache, storage, ctx)
    }

    #[test]
    fn test_state_roundtrips_through_u8() {
        for state in [
            WorkerState::Idle,
            WorkerState::Draining,
            WorkerState::Integrating,
            WorkerState::Committing,
            WorkerState::DeletingCascade,
            WorkerState::DeletingSites,
            WorkerState::ShuttingDown,
            WorkerState::Stopped,
        ] {
            assert_eq!(WorkerState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_empty_cycle_reports_nothing() {
        let (_cache, _storage, ctx) = context();
        let report = ctx.run_cycle(WorkerState::Idle).unwrap();
        assert!(report.is_empty());
        assert_eq!(ctx.state(), WorkerState::Idle);
        assert_eq!(ctx.stats.snapshot(0).cycles, 0);
    }

    #[test]
    fn test_cycle_commits_referenced_targets() {
        let (cache, storage, ctx) = context();
        let owner = Field::new("owner");
        let lamp = cache.create(id(1)).unwrap();
        let player = cache.create(id(2)).unwrap();
        ctx.run_cycle(WorkerState::Idle).unwrap();

        lamp.set_reference(&owner, Some(player.id())).unwrap();
        let report = ctx.run_cycle(WorkerState::Idle).unwrap();
        assert_eq!(report.updates, 1);
        assert_eq!(report.committed, 2);

        let stored = storage.get(player.id()).unwrap().unwrap();
        assert!(stored.has_back_reference(lamp.id(), &owner));
    }

    #[test]
    fn test_delete_cycle_evicts_and_completes() {
        let (cache, storage, ctx) = context();
        let e = cache.create(id(1)).unwrap();
        ctx.run_cycle(WorkerState::Idle).unwrap();
        assert!(storage.get(id(1)).unwrap().is_some());

        e.mark_deleted().unwrap();
        ctx.pending.enqueue_delete([id(1)]);
        let report = ctx.run_cycle(WorkerState::Idle).unwrap();
        assert_eq!(report.deleted, 1);
        assert!(storage.get(id(1)).unwrap().is_none());
        assert!(cache.resolve_any(id(1)).is_none());
        assert!(!ctx.pending.is_delete_pending(id(1)));
    }

    #[test]
    fn test_superseded_removal_is_released_on_delete() {
        let (cache, storage, ctx) = context();
        let owner = Field::new("owner");
        let lamp = cache.create(id(1)).unwrap();
        let player = cache.create(id(2)).unwrap();
        lamp.set_reference(&owner, Some(player.id())).unwrap();
        ctx.run_cycle(WorkerState::Idle).unwrap();

        lamp.set_reference(&owner, None).unwrap();
        lamp.mark_deleted().unwrap();
        ctx.pending.enqueue_delete([lamp.id()]);
        let report = ctx.run_cycle(WorkerState::Idle).unwrap();
        assert_eq!(report.deleted, 1);

        let stored = storage.get(player.id()).unwrap().unwrap();
        assert!(stored.back_references.is_empty());
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
