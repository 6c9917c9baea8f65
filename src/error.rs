//! Error types for kyrocommit.
//!
//! All errors are strongly typed using thiserror. Producer-facing calls only
//! ever surface [`ContractViolation`]s; storage failures stay on the worker
//! side and are reported through logs and [`crate::CommitStatsSnapshot`].

use std::io;

use thiserror::Error;

use crate::entity::EntityId;
use crate::storage::StorageError;

/// Caller contract violations.
///
/// These are defects in the calling code rather than runtime conditions.
/// They are detected, counted and logged; the offending request is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    /// A change was reported for an entity already queued for deletion.
    #[error("change notification for entity {id} which is pending delete")]
    NotifyWhileDeletePending {
        /// The entity.
        id: EntityId,
    },

    /// A handle mutated an entity that is deleted or pending delete.
    #[error("mutation of entity {id} which is deleted or pending delete")]
    MutateDeletedEntity {
        /// The entity.
        id: EntityId,
    },

    /// A delete was enqueued before the entity was marked deleted.
    #[error("delete enqueued for entity {id} which is not marked deleted")]
    DeleteNotMarked {
        /// The entity.
        id: EntityId,
    },

    /// An entity was created or loaded under an ID already cached.
    #[error("entity {id} already exists")]
    DuplicateEntity {
        /// The entity.
        id: EntityId,
    },
}

/// Top-level error type for kyrocommit.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The durable store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The caller broke the API contract.
    #[error("Contract violation: {0}")]
    Contract(#[from] ContractViolation),

    /// The entity is deleted or pending delete.
    #[error("Entity {id} is unavailable (deleted or delete pending)")]
    EntityUnavailable {
        /// The entity.
        id: EntityId,
    },

    /// A configuration value failed validation.
    #[error("Invalid configuration: {reason}")]
    Config {
        /// What is wrong with it.
        reason: String,
    },

    /// The worker thread could not be started.
    #[error("Failed to spawn commit worker: {source}")]
    WorkerSpawn {
        /// Error from the thread builder.
        #[source]
        source: io::Error,
    },

    /// The worker thread exited or dropped its control channel.
    #[error("Commit worker is not reachable")]
    WorkerDisconnected,

    /// A thread panicked while holding a shared lock. Fatal for the worker.
    #[error("Lock poisoned: {context}")]
    LockPoisoned {
        /// Which lock.
        context: &'static str,
    },

    /// [`crate::global::install`] was called twice.
    #[error("A process-wide update manager is already installed")]
    AlreadyInstalled,
}

impl CommitError {
    /// Creates a lock poisoning error for the given context.
    #[must_use]
    pub const fn poisoned(context: &'static str) -> Self {
        Self::LockPoisoned { context }
    }

    /// Returns true if this is a caller contract violation.
    #[must_use]
    pub const fn is_contract_violation(&self) -> bool {
        matches!(self, Self::Contract(_))
    }

    /// Returns true if this error is fatal for the commit worker.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::LockPoisoned { .. } | Self::WorkerDisconnected)
    }

    /// Returns true if the failed operation may succeed on retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::WorkerDisconnected => false,
            Self::Contract(_)
            | Self::EntityUnavailable { .. }
            | Self::Config { .. }
            | Self::WorkerSpawn { .. }
            | Self::LockPoisoned { .. }
            | Self::AlreadyInstalled => false,
        }
    }
}

/// Result type alias for kyrocommit operations.
pub type CommitResult<T> = Result<T, CommitError>;
