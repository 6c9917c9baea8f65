//! Single-writer lock on a store directory.
//!
//! Opening a store takes an advisory OS lock on `<dir>/LOCK` and records the
//! holder (process id and acquisition time) in that file as JSON. A second
//! open fails immediately and names the recorded holder. The OS lock is the
//! authority; the record is only read back for diagnostics and is cleared
//! when the lock is released.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Who holds a store directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    /// Process id of the holder.
    pub pid: u32,
    /// When the holder took the lock.
    pub acquired_at: DateTime<Utc>,
}

impl LockHolder {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid {} since {}", self.pid, self.acquired_at.to_rfc3339())
    }
}

/// Exclusive hold on a store directory, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
    holder: LockHolder,
}

impl StoreLock {
    /// Name of the lock file inside the store directory.
    pub const FILE_NAME: &'static str = "LOCK";

    /// Takes the lock on `dir` without waiting.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` if another handle holds it; the message
    ///   names the recorded holder when there is one
    /// - `ErrorKind::Unsupported` on platforms without advisory locks
    /// - any I/O error opening or writing the lock file
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let path = dir.join(Self::FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !platform::try_lock_exclusive(&file)? {
            let holder = read_holder(&file)
                .ok()
                .flatten()
                .map_or_else(|| "another process".to_string(), |h| h.to_string());
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("store {} is locked by {holder}", dir.display()),
            ));
        }

        let holder = LockHolder::current();
        write_holder(&file, Some(&holder))?;
        debug!(path = %path.display(), pid = holder.pid, "storage.lock.acquired");
        Ok(Self { file, path, holder })
    }

    /// Holder recorded in `dir`, without taking the lock. `None` if the
    /// store is not held or the record is unreadable.
    ///
    /// # Errors
    /// I/O errors other than a missing lock file.
    pub fn recorded_holder(dir: &Path) -> IoResult<Option<LockHolder>> {
        match File::open(dir.join(Self::FILE_NAME)) {
            Ok(file) => read_holder(&file),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The holder recorded by this lock.
    #[must_use]
    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        // The OS lock goes with the handle; only the record needs clearing.
        if let Err(err) = write_holder(&self.file, None) {
            warn!(path = %self.path.display(), error = %err, "storage.lock.clear_failed");
        }
    }
}

fn read_holder(mut file: &File) -> IoResult<Option<LockHolder>> {
    file.seek(SeekFrom::Start(0))?;
    let mut raw = String::new();
    file.read_to_string(&mut raw)?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    Ok(serde_json::from_str(&raw).ok())
}

fn write_holder(mut file: &File, holder: Option<&LockHolder>) -> IoResult<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    if let Some(holder) = holder {
        serde_json::to_writer(&mut file, holder)
            .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
    }
    file.flush()
}

/// Non-blocking exclusive lock. `Ok(false)` means someone else holds it.
#[cfg(unix)]
mod platform {
    use std::fs::File;
    use std::io::{Error as IoError, Result as IoResult};
    use std::os::unix::io::AsRawFd;

    pub(super) fn try_lock_exclusive(file: &File) -> IoResult<bool> {
        // SAFETY: the descriptor is owned by `file` for the whole call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = IoError::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK => Ok(false),
            _ => Err(err),
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::fs::File;
    use std::io::{Error as IoError, Result as IoResult};
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    // Locks a byte far past the JSON record so the record stays readable.
    const LOCK_OFFSET_HIGH: u32 = 1;

    pub(super) fn try_lock_exclusive(file: &File) -> IoResult<bool> {
        let handle = file.as_raw_handle() as HANDLE;
        // SAFETY: `handle` is owned by `file`; OVERLAPPED is plain data and
        // only carries the lock offset here.
        let ok = unsafe {
            let mut overlapped = std::mem::zeroed::<OVERLAPPED>();
            overlapped.Anonymous.Anonymous.OffsetHigh = LOCK_OFFSET_HIGH;
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };
        if ok != 0 {
            return Ok(true);
        }
        let err = IoError::last_os_error();
        if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use std::fs::File;
    use std::io::{Error as IoError, ErrorKind, Result as IoResult};

    pub(super) fn try_lock_exclusive(_file: &File) -> IoResult<bool> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "advisory file locks are not available on this platform",
        ))
    }
}
