//! Compacted entity snapshot.
//!
//! A snapshot holds the full stored state at the moment of compaction. It is
//! written to a temporary file, fsynced and renamed into place, so a crash
//! leaves either the old or the new snapshot, never a partial one.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;

use super::codec::{self, FileKind, Frame};

/// Contents of a snapshot file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Last log sequence folded into this snapshot.
    pub up_to_sequence: u64,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    /// Every stored entity, ascending by ID.
    pub entities: Vec<Entity>,
}

fn write_temp(temp_path: &Path, data: &SnapshotData) -> IoResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(temp_path)?;
    let mut writer = BufWriter::new(file);
    codec::write_file_header(&mut writer, FileKind::Snapshot)?;
    writer.write_all(&codec::encode_record(data)?)?;
    writer.flush()?;
    writer.get_ref().sync_all()
}

/// Atomically replaces the snapshot at `path`.
pub fn write(path: &Path, data: &SnapshotData) -> IoResult<()> {
    let temp_path = path.with_extension("snap.tmp");
    if let Err(err) = write_temp(&temp_path, data) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    fs::rename(&temp_path, path)
}

/// Reads the snapshot at `path`, `None` if there is none yet.
pub fn read(path: &Path) -> IoResult<Option<SnapshotData>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    codec::read_file_header(&mut reader, FileKind::Snapshot)?;
    match codec::read_record(&mut reader)? {
        Frame::Record(data) => Ok(Some(data)),
        // Snapshots are renamed into place whole, so a short one is damage.
        Frame::End | Frame::Torn => Err(IoError::new(
            ErrorKind::InvalidData,
            format!("snapshot {} is truncated", path.display()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityId, SiteId};
    use tempfile::tempdir;

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = tempdir().unwrap();
        assert!(read(&dir.path().join("entities.snap")).unwrap().is_none());
    }

    #[test]
    fn test_write_replaces_previous() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entities.snap");
        let entity = Entity::new(EntityId::new(SiteId::new(1), 1));

        write(
            &path,
            &SnapshotData {
                up_to_sequence: 4,
                created_at: Utc::now(),
                entities: vec![entity.clone()],
            },
        )
        .unwrap();
        write(
            &path,
            &SnapshotData {
                up_to_sequence: 9,
                created_at: Utc::now(),
                entities: Vec::new(),
            },
        )
        .unwrap();

        let data = read(&path).unwrap().unwrap();
        assert_eq!(data.up_to_sequence, 9);
        assert!(data.entities.is_empty());
        assert!(!path.with_extension("snap.tmp").exists());
    }

    #[test]
    fn test_log_file_is_not_read_as_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commit.wal");
        drop(crate::storage::persistent::WriteAheadLog::open(&path, false).unwrap());

        let err = read(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_snapshot_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entities.snap");
        let data = SnapshotData {
            up_to_sequence: 1,
            created_at: Utc::now(),
            entities: vec![Entity::new(EntityId::new(SiteId::new(1), 1))],
        };
        write(&path, &data).unwrap();
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 4).unwrap();

        assert!(read(&path).is_err());
    }
}
