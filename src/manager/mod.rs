//! The deferred update/delete commit manager.
//!
//! [`UpdateManager`] is the service object producers talk to. It owns the
//! pending change store and one background worker thread that commits the
//! accumulated changes off every producer's critical path.
//!
//! ```text
//! producers ──notify──▶ PendingChanges ◀──drain── worker ──▶ DurableStore
//!            enqueue_delete          (one mutex)     │
//!                                                    └─ ReferenceIntegrity
//! ```

mod config;
mod stats;
mod worker;

pub use config::CommitConfig;
pub use stats::CommitStatsSnapshot;
pub use worker::{CancellationToken, CycleReport, WorkerState};

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Sender};
use tracing::{error, info, warn};

use crate::change::{FieldSet, FlagChanges, IdChanges, PendingChanges, PendingCounts};
use crate::entity::{EntityId, EntityResolver, SiteId};
use crate::error::{CommitError, CommitResult, ContractViolation};
use crate::storage::DurableStore;

use worker::{worker_loop, CommitContext, ControlMsg};

struct WorkerHandle {
    control_tx: Sender<ControlMsg>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Deferred commit manager.
///
/// Producer-facing calls (`notify`, `enqueue_*`, `is_delete_pending`) only
/// take the pending store's lock and never wait on storage.
pub struct UpdateManager {
    ctx: Arc<CommitContext>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl std::fmt::Debug for UpdateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateManager")
            .field("state", &self.worker_state())
            .field("pending", &self.pending_counts())
            .finish_non_exhaustive()
    }
}

impl UpdateManager {
    /// Creates a stopped manager. Call [`UpdateManager::start`] to launch the
    /// worker.
    ///
    /// `pending` must be the listener the entity cache behind `resolver`
    /// reports to.
    ///
    /// # Errors
    /// `Config` if `config` is invalid.
    pub fn new(
        pending: Arc<PendingChanges>,
        resolver: Arc<dyn EntityResolver>,
        storage: Arc<dyn DurableStore>,
        config: CommitConfig,
    ) -> CommitResult<Self> {
        let config = config.validate()?;
        Ok(Self {
            ctx: Arc::new(CommitContext::new(pending, resolver, storage, config)),
            worker: Mutex::new(None),
        })
    }

    fn worker_guard(&self) -> CommitResult<MutexGuard<'_, Option<WorkerHandle>>> {
        self.worker
            .lock()
            .map_err(|_| CommitError::poisoned("commit worker handle"))
    }

    /// Merges a change notification. Contract violations are counted and
    /// logged, and the notification is dropped.
    pub fn notify(
        &self,
        id: EntityId,
        fields_changed: &FieldSet,
        flags_changed: &FlagChanges,
        ids_changed: &IdChanges,
    ) {
        self.ctx
            .pending
            .notify(id, fields_changed, flags_changed, ids_changed);
    }

    /// Like [`UpdateManager::notify`], surfacing contract violations.
    pub fn try_notify(
        &self,
        id: EntityId,
        fields_changed: &FieldSet,
        flags_changed: &FlagChanges,
        ids_changed: &IdChanges,
    ) -> CommitResult<()> {
        self.ctx
            .pending
            .try_notify(id, fields_changed, flags_changed, ids_changed)
    }

    fn check_marked(&self, id: EntityId) -> Result<(), ContractViolation> {
        match self.ctx.resolver.resolve_any(id) {
            Some(handle) if !handle.is_marked_deleted() => Err(ContractViolation::DeleteNotMarked { id }),
            _ => Ok(()),
        }
    }

    /// Queues entities for deletion.
    ///
    /// Every entity must already be marked deleted, and the set must include
    /// everything they contain. Cached entities that are not marked deleted
    /// are skipped and counted as contract violations.
    pub fn enqueue_delete(&self, ids: impl IntoIterator<Item = EntityId>) {
        let accepted: Vec<EntityId> = ids
            .into_iter()
            .filter(|id| match self.check_marked(*id) {
                Ok(()) => true,
                Err(violation) => {
                    self.ctx.pending.record_violation();
                    warn!(entity = %id, error = %violation, "commit.delete.rejected");
                    false
                }
            })
            .collect();
        self.ctx.pending.enqueue_delete(accepted);
    }

    /// All-or-nothing [`UpdateManager::enqueue_delete`].
    ///
    /// # Errors
    /// `Contract(DeleteNotMarked)` for the first cached entity not marked
    /// deleted; nothing is queued.
    pub fn try_enqueue_delete(&self, ids: impl IntoIterator<Item = EntityId>) -> CommitResult<()> {
        let ids: Vec<EntityId> = ids.into_iter().collect();
        if let Some(violation) = ids.iter().find_map(|id| self.check_marked(*id).err()) {
            self.ctx.pending.record_violation();
            return Err(violation.into());
        }
        self.ctx.pending.enqueue_delete(ids);
        Ok(())
    }

    /// Queues a site for deletion. It is deleted once none of its entities
    /// are pending delete any more.
    pub fn enqueue_site_delete(&self, site: SiteId) {
        self.ctx.pending.enqueue_site_delete(site);
    }

    /// Whether `id` is queued or in flight for deletion.
    #[must_use]
    pub fn is_delete_pending(&self, id: EntityId) -> bool {
        self.ctx.pending.is_delete_pending(id)
    }

    /// Launches the worker thread. Does nothing if it is already running.
    ///
    /// # Errors
    /// `WorkerSpawn` if the thread cannot be created.
    pub fn start(&self) -> CommitResult<()> {
        let mut guard = self.worker_guard()?;
        if let Some(handle) = guard.as_ref() {
            if !handle.join.is_finished() {
                return Ok(());
            }
        }
        if let Some(finished) = guard.take() {
            if finished.join.join().is_err() {
                error!("commit.worker.panicked");
            }
        }

        let (control_tx, control_rx) = unbounded::<ControlMsg>();
        let cancel = CancellationToken::new();
        let ctx = Arc::clone(&self.ctx);
        let thread_cancel = cancel.clone();
        ctx.set_state(WorkerState::Idle);
        let join = thread::Builder::new()
            .name(self.ctx.config.thread_name.clone())
            .spawn(move || worker_loop(&ctx, &control_rx, &thread_cancel))
            .map_err(|source| {
                self.ctx.set_state(WorkerState::Stopped);
                CommitError::WorkerSpawn { source }
            })?;

        *guard = Some(WorkerHandle {
            control_tx,
            cancel,
            join,
        });
        info!(thread = %self.ctx.config.thread_name, "commit.manager.started");
        Ok(())
    }

    /// Stops the worker after a bounded best-effort flush and waits for it
    /// to exit. Does nothing if it is not running.
    pub fn stop(&self) {
        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(handle) = handle else {
            return;
        };

        handle.cancel.cancel();
        let _ = handle.control_tx.send(ControlMsg::Shutdown);
        if handle.join.join().is_err() {
            error!("commit.worker.panicked");
            self.ctx.set_state(WorkerState::Stopped);
        }
        info!("commit.manager.stopped");
    }

    /// Whether the worker thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|h| !h.join.is_finished()))
            .unwrap_or(false)
    }

    /// Runs a commit cycle now and waits for it.
    ///
    /// Goes through the worker when it is running, otherwise runs the cycle
    /// on the calling thread.
    ///
    /// # Errors
    /// `WorkerDisconnected` if the worker exits before answering, or any
    /// fatal error of the cycle.
    pub fn flush(&self) -> CommitResult<CycleReport> {
        let control_tx = {
            let guard = self.worker_guard()?;
            guard
                .as_ref()
                .filter(|h| !h.join.is_finished())
                .map(|h| h.control_tx.clone())
        };
        let Some(control_tx) = control_tx else {
            return self.run_cycle();
        };

        let (reply_tx, reply_rx) = bounded::<CommitResult<CycleReport>>(1);
        control_tx
            .send(ControlMsg::Flush { reply: reply_tx })
            .map_err(|_| CommitError::WorkerDisconnected)?;
        reply_rx.recv().map_err(|_| CommitError::WorkerDisconnected)?
    }

    /// Runs one commit cycle on the calling thread. Serialized with the
    /// worker, so it is safe to call while it runs.
    pub fn run_cycle(&self) -> CommitResult<CycleReport> {
        let rest = if self.is_running() {
            WorkerState::Idle
        } else {
            WorkerState::Stopped
        };
        self.ctx.run_cycle(rest)
    }

    /// Where the worker currently is.
    #[must_use]
    pub fn worker_state(&self) -> WorkerState {
        self.ctx.state()
    }

    /// Counters since construction.
    #[must_use]
    pub fn stats(&self) -> CommitStatsSnapshot {
        self.ctx.stats.snapshot(self.ctx.pending.contract_violations())
    }

    /// Sizes of the pending containers.
    #[must_use]
    pub fn pending_counts(&self) -> PendingCounts {
        self.ctx.pending.counts()
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &CommitConfig {
        &self.ctx.config
    }
}

impl Drop for UpdateManager {
    fn drop(&mut self) {
        self.stop();
    }
}
