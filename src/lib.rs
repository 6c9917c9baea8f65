//! # kyrocommit - Deferred commit pipeline for persistent object graphs
//!
//! Entities live in memory and are mutated by many producer threads. Every
//! mutation is reported as a small diff; kyrocommit merges those diffs,
//! keeps forward and back-references consistent, and commits the result to
//! durable storage on a background worker so producers never wait on I/O.
//!
//! ## Core Concepts
//!
//! - **Entity / EntityRef**: a record with scalar fields, flags and ID-valued
//!   fields, and the validity-checked handle producers mutate it through
//! - **EntityDiff**: the merged changes of one entity since its last commit
//! - **PendingChanges**: the single-lock store producers notify into
//! - **UpdateManager**: the service object owning the commit worker
//! - **ReferenceIntegrity**: back-reference bookkeeping and deletion scrubs
//! - **DurableStore**: where committed entities end up
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kyrocommit::{
//!     ChangeListener, CommitConfig, EntityCache, EntityId, Field, InMemoryDurableStore,
//!     PendingChanges, SiteId, UpdateManager,
//! };
//!
//! let pending = Arc::new(PendingChanges::new());
//! let cache = Arc::new(EntityCache::new(Arc::clone(&pending) as Arc<dyn ChangeListener>));
//! let manager = UpdateManager::new(
//!     pending,
//!     cache.clone(),
//!     Arc::new(InMemoryDurableStore::new()),
//!     CommitConfig::default(),
//! )?;
//! manager.start()?;
//!
//! let lamp = cache.create(EntityId::new(SiteId::new(1), 1))?;
//! lamp.set_field(&Field::new("name"), "brass lamp")?;
//! manager.flush()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod change;
pub mod entity;
pub mod error;
pub mod global;
pub mod integrity;
pub mod manager;
pub mod storage;

pub use change::{
    ChangeListener, DrainedBatch, EntityDiff, FieldSet, FlagChange, FlagChanges, IdChanges,
    IdDelta, PendingChanges, PendingCounts,
};
pub use entity::{Entity, EntityCache, EntityId, EntityRef, EntityResolver, Field, Flag, IdValue, SiteId, Value};
pub use error::{CommitError, CommitResult, ContractViolation};
pub use integrity::{audit, IntegrityIssue, ReferenceIntegrity, ScrubOutcome};
pub use manager::{CancellationToken, CommitConfig, CommitStatsSnapshot, CycleReport, UpdateManager, WorkerState};
pub use storage::{DurableStore, InMemoryDurableStore, StorageError};
