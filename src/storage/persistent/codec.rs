//! On-disk layout shared by the log and the snapshot.
//!
//! A file starts with a six byte header naming what it holds, followed by
//! records:
//!
//! ```text
//! file   := "KCMT" format:u8 kind:u8 record*
//! record := len:u32le crc:u32le payload[len]
//! ```
//!
//! `payload` is the JSON form of a log entry or snapshot, so the serde
//! attributes of the entity model are the schema. `crc` covers the length
//! and the payload, so a damaged length is reported as corruption instead
//! of being trusted. A record cut short by a crash reads as [`Frame::Torn`].

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

const MAGIC: [u8; 4] = *b"KCMT";
const FORMAT_VERSION: u8 = 2;

/// Bytes before the first record.
pub const FILE_HEADER_LEN: u64 = 6;
const RECORD_HEADER_LEN: usize = 8;
/// Largest payload accepted in either direction.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// What a store file holds. Opening a file as the wrong kind fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    /// Append-only commit log.
    Wal = 1,
    /// Compacted entity state.
    Snapshot = 2,
}

impl FileKind {
    const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Wal),
            2 => Some(Self::Snapshot),
            _ => None,
        }
    }
}

/// One read at a record boundary.
#[derive(Debug)]
pub enum Frame<T> {
    /// An intact record.
    Record(T),
    /// Clean end of file.
    End,
    /// The file ends inside a record.
    Torn,
}

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

fn record_crc(len: [u8; 4], payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&len);
    hasher.update(payload);
    hasher.finalize()
}

/// Reads until `buf` is full or the input ends; returns the bytes read.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> IoResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writes the header for a file of `kind`.
pub fn write_file_header(writer: &mut impl Write, kind: FileKind) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[FORMAT_VERSION, kind as u8])
}

/// Checks that the file is a store file of the `expected` kind.
pub fn read_file_header(reader: &mut impl Read, expected: FileKind) -> IoResult<()> {
    let mut header = [0u8; FILE_HEADER_LEN as usize];
    reader.read_exact(&mut header)?;
    if header[..4] != MAGIC {
        return Err(invalid(format!("not a store file (magic {:?})", &header[..4])));
    }
    if header[4] != FORMAT_VERSION {
        return Err(invalid(format!(
            "store format {} is not supported (expected {FORMAT_VERSION})",
            header[4]
        )));
    }
    match FileKind::from_byte(header[5]) {
        Some(kind) if kind == expected => Ok(()),
        Some(kind) => Err(invalid(format!("expected a {expected:?} file, found {kind:?}"))),
        None => Err(invalid(format!("unknown store file kind {}", header[5]))),
    }
}

/// Serializes `value` into one record.
pub fn encode_record<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let payload = serde_json::to_vec(value).map_err(|e| invalid(format!("encode: {e}")))?;
    if payload.len() > MAX_PAYLOAD {
        return Err(IoError::new(
            ErrorKind::InvalidInput,
            format!("record of {} bytes is over the {MAX_PAYLOAD} byte limit", payload.len()),
        ));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| IoError::new(ErrorKind::InvalidInput, "record length overflows u32"))?
        .to_le_bytes();

    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    out.extend_from_slice(&len);
    out.extend_from_slice(&record_crc(len, &payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Reads the next record.
///
/// # Errors
/// `InvalidData` for a checksum mismatch, an oversized length or a payload
/// that does not decode. Running out of input is not an error; see
/// [`Frame`].
pub fn read_record<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<Frame<T>> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    match fill(reader, &mut header)? {
        0 => return Ok(Frame::End),
        n if n < RECORD_HEADER_LEN => return Ok(Frame::Torn),
        _ => {}
    }
    let len = [header[0], header[1], header[2], header[3]];
    let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let size = u32::from_le_bytes(len) as usize;
    if size > MAX_PAYLOAD {
        return Err(invalid(format!("record length {size} is over the {MAX_PAYLOAD} byte limit")));
    }
    let mut payload = vec![0u8; size];
    if fill(reader, &mut payload)? < size {
        return Ok(Frame::Torn);
    }

    let computed = record_crc(len, &payload);
    if computed != stored_crc {
        return Err(invalid(format!(
            "record checksum mismatch (stored {stored_crc:08x}, computed {computed:08x})"
        )));
    }
    serde_json::from_slice(&payload)
        .map(Frame::Record)
        .map_err(|e| invalid(format!("decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::entity::{Entity, EntityId, Field, SiteId};
    use crate::storage::persistent::wal::{WalEntry, WalEntryKind};

    fn read_string(bytes: Vec<u8>) -> IoResult<Frame<String>> {
        read_record(&mut Cursor::new(bytes))
    }

    #[test]
    fn test_flipped_payload_byte_is_corruption() {
        let mut bytes = encode_record(&"commit payload".to_string()).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xFF;
        let err = read_string(bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_damaged_length_is_corruption_not_torn() {
        let mut bytes = encode_record(&"abc".to_string()).unwrap();
        bytes[0] = bytes[0].wrapping_sub(1);
        assert!(read_string(bytes).is_err());
    }

    #[test]
    fn test_short_input_is_torn_and_empty_input_is_end() {
        let bytes = encode_record(&"a complete record".to_string()).unwrap();
        assert!(matches!(read_string(Vec::new()).unwrap(), Frame::End));
        assert!(matches!(read_string(bytes[..5].to_vec()).unwrap(), Frame::Torn));
        assert!(matches!(read_string(bytes[..bytes.len() - 1].to_vec()).unwrap(), Frame::Torn));
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut bytes = (u32::try_from(MAX_PAYLOAD).unwrap() + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 4]);
        assert!(read_string(bytes).unwrap_err().to_string().contains("limit"));
    }

    #[test]
    fn test_header_checks_magic_and_kind() {
        let mut wal = Vec::new();
        write_file_header(&mut wal, FileKind::Wal).unwrap();
        assert_eq!(wal.len() as u64, FILE_HEADER_LEN);
        read_file_header(&mut Cursor::new(wal.clone()), FileKind::Wal).unwrap();

        let err = read_file_header(&mut Cursor::new(wal), FileKind::Snapshot).unwrap_err();
        assert!(err.to_string().contains("Snapshot"));

        let foreign = b"KYRO\x02\x01".to_vec();
        let err = read_file_header(&mut Cursor::new(foreign), FileKind::Wal).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_wal_entry_keeps_back_references() {
        let mut entity = Entity::new(EntityId::new(SiteId::new(3), 8));
        entity
            .back_references
            .entry(EntityId::new(SiteId::new(3), 9))
            .or_default()
            .insert(Field::new("owner"));
        let entry = WalEntry {
            sequence: 1,
            timestamp: chrono::Utc::now(),
            kind: WalEntryKind::Commit(entity.clone()),
        };

        let bytes = encode_record(&entry).unwrap();
        let Frame::Record(decoded) = read_record::<WalEntry>(&mut Cursor::new(bytes)).unwrap() else {
            panic!("expected an intact record");
        };
        assert_eq!(decoded.sequence, 1);
        assert!(matches!(decoded.kind, WalEntryKind::Commit(ref e) if *e == entity));
    }
}
