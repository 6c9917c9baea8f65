//! Durable storage for committed entities.
//!
//! [`DurableStore`] is the contract the commit worker writes through.
//! [`InMemoryDurableStore`] is the reference backend; the `persistent`
//! feature adds a WAL-backed one.

mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryDurableStore;
pub use traits::{DurableStore, StorageError};
