//! Persistent durable storage backend.
//!
//! Durable, crash-safe storage with:
//! - Write-ahead logging for crash recovery
//! - A directory lock that records its holder, for single-process access
//! - CRC32 checksums for corruption detection
//! - Snapshot compaction to bound replay time
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            PersistentDurableStore            │
//! ├──────────────────────────────────────────────┤
//! │  ┌───────────────┐    ┌──────────────────┐   │
//! │  │ WriteAheadLog │ →  │ entities.snap    │   │
//! │  │ (append-only) │    │ (compacted state)│   │
//! │  └───────┬───────┘    └────────┬─────────┘   │
//! │          └──────────┬──────────┘             │
//! │                     ↓                        │
//! │          ┌─────────────────────┐             │
//! │          │   StoreLock (LOCK)  │             │
//! │          └─────────────────────┘             │
//! └──────────────────────────────────────────────┘
//! ```

mod codec;
mod snapshot;
mod store;
mod store_lock;
mod wal;

pub use store_lock::{LockHolder, StoreLock};
pub use store::{CompactionResult, PersistentDurableStore};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::error::{CommitError, CommitResult};

/// Configuration for persistent storage.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// WAL size that triggers compaction into a snapshot (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024, // 64 MB
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    // Below this, every write would compact.
    const MIN_WAL_SIZE: u64 = 4 * 1024;

    /// # Errors
    /// `Config` if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> CommitResult<Self> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(CommitError::Config {
                reason: format!(
                    "max_wal_size must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            });
        }
        Ok(self)
    }
}

/// Opens or creates a persistent store at `path`.
///
/// # Errors
/// - invalid configuration
/// - the directory cannot be created or accessed
/// - another process holds the lock
/// - the snapshot or the WAL is corrupted
///
/// # Example
/// ```rust,ignore
/// use kyrocommit::storage::persistent::open_store;
///
/// let store = Arc::new(open_store("./world.db", None)?);
/// let manager = UpdateManager::new(pending, cache, store, CommitConfig::default())?;
/// ```
pub fn open_store(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> CommitResult<PersistentDurableStore> {
    let config = config.unwrap_or_default().validate()?;
    PersistentDurableStore::open(path.as_ref(), config)
}
