//! Optional process-wide [`UpdateManager`] handle.
//!
//! Embedders that want a single manager reachable from anywhere install one
//! at startup and uninstall it at shutdown. Everything else in the crate
//! takes the manager explicitly.

use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::{CommitError, CommitResult};
use crate::manager::UpdateManager;

static INSTANCE: RwLock<Option<Arc<UpdateManager>>> = RwLock::new(None);

/// Installs `manager` as the process-wide instance.
///
/// # Errors
/// - `AlreadyInstalled` if another manager is installed
/// - `LockPoisoned` if the slot is unusable
pub fn install(manager: Arc<UpdateManager>) -> CommitResult<Arc<UpdateManager>> {
    let mut slot = INSTANCE
        .write()
        .map_err(|_| CommitError::poisoned("global update manager"))?;
    if slot.is_some() {
        return Err(CommitError::AlreadyInstalled);
    }
    *slot = Some(Arc::clone(&manager));
    info!("commit.global.installed");
    Ok(manager)
}

/// The installed manager, if any.
#[must_use]
pub fn instance() -> Option<Arc<UpdateManager>> {
    INSTANCE.read().ok()?.clone()
}

/// Removes the installed manager and stops its worker.
///
/// The manager stays usable through handles callers still hold; only the
/// worker is stopped.
pub fn uninstall() -> Option<Arc<UpdateManager>> {
    let manager = match INSTANCE.write() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }?;
    manager.stop();
    info!("commit.global.uninstalled");
    Some(manager)
}
