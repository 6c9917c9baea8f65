//! Commit pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated by the worker.
#[derive(Debug, Default)]
pub(crate) struct CommitStats {
    pub cycles: AtomicU64,
    pub entities_committed: AtomicU64,
    pub commit_failures: AtomicU64,
    pub entities_deleted: AtomicU64,
    pub delete_failures: AtomicU64,
    pub sites_deleted: AtomicU64,
    pub site_delete_failures: AtomicU64,
    pub site_deletes_deferred: AtomicU64,
    pub dropped_after_retries: AtomicU64,
}

impl CommitStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, contract_violations: u64) -> CommitStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CommitStatsSnapshot {
            cycles: load(&self.cycles),
            entities_committed: load(&self.entities_committed),
            commit_failures: load(&self.commit_failures),
            entities_deleted: load(&self.entities_deleted),
            delete_failures: load(&self.delete_failures),
            sites_deleted: load(&self.sites_deleted),
            site_delete_failures: load(&self.site_delete_failures),
            site_deletes_deferred: load(&self.site_deletes_deferred),
            dropped_after_retries: load(&self.dropped_after_retries),
            contract_violations,
        }
    }
}

/// Point-in-time copy of the commit counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStatsSnapshot {
    /// Cycles that found work.
    pub cycles: u64,
    /// Successful entity commits, including scrub and back-reference edits.
    pub entities_committed: u64,
    /// Entity commits the store rejected.
    pub commit_failures: u64,
    /// Entities durably deleted.
    pub entities_deleted: u64,
    /// Entity deletes the store rejected.
    pub delete_failures: u64,
    /// Sites durably deleted.
    pub sites_deleted: u64,
    /// Site deletes the store rejected.
    pub site_delete_failures: u64,
    /// Site deletes postponed because entities of the site were still pending.
    pub site_deletes_deferred: u64,
    /// Work given up after exhausting `max_commit_attempts`, or failing with
    /// a non-retryable error.
    pub dropped_after_retries: u64,
    /// Caller contract violations detected by the pending store.
    pub contract_violations: u64,
}
