//! Abstract durable storage contract.
//!
//! The commit worker is the only caller of these methods. Every call reports
//! its own success or failure; a failing call never unwinds the worker.

use thiserror::Error;

use crate::entity::{Entity, EntityId, SiteId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entity not found.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// Site not found.
    #[error("Site not found: {0}")]
    SiteNotFound(SiteId),

    /// Backend temporarily unable to serve the request.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::BackendError(_))
    }

    /// Whether the error means the target is already gone.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::EntityNotFound(_) | Self::SiteNotFound(_))
    }
}

/// Durable storage for entity snapshots.
///
/// # Safety Considerations
/// - Each call must be atomic with respect to itself
/// - Implementations must be safe to call from the worker thread while
///   readers call `get` concurrently
pub trait DurableStore: Send + Sync {
    /// Durably stores the full current state of an entity.
    fn commit_entity(&self, entity: &Entity) -> Result<(), StorageError>;

    /// Durably deletes an entity. `EntityNotFound` if it was never stored.
    fn delete_entity(&self, id: EntityId) -> Result<(), StorageError>;

    /// Durably deletes a site and anything still stored in it.
    /// `SiteNotFound` if the site holds nothing.
    fn delete_site(&self, site: SiteId) -> Result<(), StorageError>;

    /// Reads the stored state of an entity.
    fn get(&self, id: EntityId) -> Result<Option<Entity>, StorageError>;

    /// Lists stored entity IDs of a site (ascending).
    fn list_site(&self, site: SiteId) -> Result<Vec<EntityId>, StorageError>;
}
