//! Write-ahead log for the persistent store.
//!
//! Every durable operation is appended here before the in-memory index is
//! updated. On open, the log is replayed on top of the last snapshot.
//!
//! The file is a log-kind header followed by one record per [`WalEntry`]. A record torn by a crash ends the log; it is cut off on the
//! next open so new entries follow the last intact one.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entity::{Entity, EntityId, SiteId};

use super::codec::{self, FileKind, Frame};

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The logged operation.
    pub kind: WalEntryKind,
}

/// The logged operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// Full entity state after a commit.
    Commit(Entity),
    /// An entity was durably deleted.
    Delete {
        /// The deleted entity.
        id: EntityId,
    },
    /// Every entity of a site was durably deleted.
    DeleteSite {
        /// The deleted site.
        site: SiteId,
    },
    /// Everything up to `up_to_sequence` is in the snapshot.
    Checkpoint {
        /// Last sequence folded into the snapshot.
        up_to_sequence: u64,
    },
}

struct WalWriter {
    file: BufWriter<File>,
    sequence: u64,
}

/// Append-only log. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal.writer")
}

impl WriteAheadLog {
    /// Opens or creates a log file, recovering the last sequence number.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let sequence = if exists && file.metadata()?.len() >= codec::FILE_HEADER_LEN {
            let (sequence, valid_end) = Self::find_last_sequence(path)?;
            let len = file.metadata()?.len();
            if valid_end < len {
                warn!(dropped_bytes = len - valid_end, "storage.wal.truncated_tail");
                file.set_len(valid_end)?;
            }
            sequence
        } else {
            file.set_len(0)?;
            codec::write_file_header(&mut file, FileKind::Wal)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                file: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    fn writer(&self) -> IoResult<MutexGuard<'_, WalWriter>> {
        self.writer.lock().map_err(|_| poisoned())
    }

    /// Appends an entry and returns its sequence number.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self.writer()?;
        let candidate = writer.sequence + 1;
        let entry = WalEntry {
            sequence: candidate,
            timestamp: Utc::now(),
            kind,
        };

        let encoded = codec::encode_record(&entry)?;
        writer.file.write_all(&encoded)?;
        writer.file.flush()?;
        if self.sync_on_write {
            writer.file.get_ref().sync_all()?;
        }

        writer.sequence = candidate;
        Ok(candidate)
    }

    /// Iterates over all entries, oldest first.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence number of the last appended entry, 0 for an empty log.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.writer()?.sequence)
    }

    /// Current file size, header included.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Empties the log after a snapshot has been written.
    ///
    /// Only call this once the snapshot covering every entry is durable.
    pub fn truncate(&self) -> IoResult<()> {
        let mut writer = self.writer()?;
        writer.file.flush()?;

        let mut file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        codec::write_file_header(&mut file, FileKind::Wal)?;
        if self.sync_on_write {
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&self.path)?;
        writer.file = BufWriter::new(file);
        writer.sequence = 0;
        Ok(())
    }

    /// Last intact sequence number and the byte offset just past it.
    fn find_last_sequence(path: &Path) -> IoResult<(u64, u64)> {
        let mut last_seq = 0;
        let mut iter = WalIterator::new(path)?;
        for entry in iter.by_ref() {
            match entry {
                Ok(entry) => last_seq = entry.sequence,
                Err(err) => {
                    warn!(sequence = last_seq + 1, error = %err, "storage.wal.corruption");
                    break;
                }
            }
        }
        Ok((last_seq, iter.valid_end))
    }
}

/// Iterator over log entries. Stops at the first torn record.
pub struct WalIterator {
    reader: BufReader<File>,
    valid_end: u64,
    done: bool,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        codec::read_file_header(&mut reader, FileKind::Wal)?;
        Ok(Self {
            reader,
            valid_end: codec::FILE_HEADER_LEN,
            done: false,
        })
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let frame = codec::read_record(&mut self.reader)
            .and_then(|frame| Ok((frame, self.reader.stream_position()?)));
        match frame {
            Ok((Frame::Record(entry), end)) => {
                self.valid_end = end;
                Some(Ok(entry))
            }
            Ok((Frame::End | Frame::Torn, _)) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
