// Copyright (c) 2026 Myco
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Append-only write-ahead log: `magic(8) | version(2) | node_id(32)` file
//! header, then a stream of `len(u32 LE) | crc32(u32 LE) | payload` records.
//!
//! Every accepted catalog merge is journaled here and `fsync`'d before the
//! caller may treat it as durable. Recovery validates the header, then
//! replays records in order and truncates at the first torn/corrupt tail
//! record rather than failing open.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::types::{decode_canonical_limited, encode_canonical, CodecError, NodeId, ServiceRecord};

/// File magic identifying a Myco catalog WAL.
const WAL_MAGIC: &[u8; 8] = b"MYCOWAL1";

/// On-disk format revision.
const WAL_VERSION: u16 = 1;

/// Header size in bytes: `magic(8) | version(2) | node_id(32)`.
const FILE_HEADER_LEN: usize = 8 + 2 + 32;

/// Header size in bytes: 4-byte length + 4-byte CRC32.
const RECORD_HEADER_LEN: usize = 8;

/// Hard cap on a single record's encoded payload size, defending recovery
/// against a corrupt length field sending us on an unbounded read.
const MAX_RECORD_LEN: usize = 64 * 1024;

/// WAL errors.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying file I/O failed.
    #[error("wal io: {0}")]
    Io(#[from] io::Error),
    /// A record's declared length exceeds `MAX_RECORD_LEN`.
    #[error("record length {0} exceeds cap")]
    RecordTooLarge(usize),
    /// Canonical encode/decode of a record payload failed.
    #[error("wal codec: {0}")]
    Codec(#[from] CodecError),
    /// File header magic did not match [`WAL_MAGIC`].
    #[error("wal file is not a Myco WAL (bad magic)")]
    BadMagic,
    /// File header version is not one this build understands.
    #[error("wal version {0} is not supported")]
    UnsupportedVersion(u16),
}

fn encode_file_header(node_id: NodeId) -> [u8; FILE_HEADER_LEN] {
    let mut header = [0u8; FILE_HEADER_LEN];
    header[0..8].copy_from_slice(WAL_MAGIC);
    header[8..10].copy_from_slice(&WAL_VERSION.to_le_bytes());
    header[10..42].copy_from_slice(node_id.as_bytes());
    header
}

fn validate_file_header(header: &[u8; FILE_HEADER_LEN]) -> Result<(), WalError> {
    if &header[0..8] != WAL_MAGIC {
        return Err(WalError::BadMagic);
    }
    let version = u16::from_le_bytes(header[8..10].try_into().unwrap());
    if version != WAL_VERSION {
        return Err(WalError::UnsupportedVersion(version));
    }
    Ok(())
}

/// One fully-read, CRC-validated record plus its byte offset, used by
/// recovery to report how far replay reached.
pub struct RecoveredRecord {
    /// Decoded record.
    pub record: ServiceRecord,
    /// Offset, in bytes, immediately after this record in the file.
    pub end_offset: u64,
}

/// Outcome of a recovery pass.
pub struct RecoveryReport {
    /// Records successfully replayed, in file order.
    pub records: Vec<RecoveredRecord>,
    /// True if the file was truncated to drop a torn/corrupt tail record.
    pub truncated: bool,
}

/// Append-only, fsync-on-write journal of accepted catalog merges.
pub struct Wal {
    path: PathBuf,
    file: File,
}

impl Wal {
    /// Open (creating if absent) the WAL at `path` for appending. A freshly
    /// created (empty) file gets the `magic | version | node_id` header
    /// written and fsync'd before this returns; an existing file has its
    /// header validated.
    pub fn open(path: impl AsRef<Path>, node_id: NodeId) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;

        if file.metadata()?.len() == 0 {
            let header = encode_file_header(node_id);
            file.write_all(&header)?;
            file.sync_data()?;
        } else {
            let mut header = [0u8; FILE_HEADER_LEN];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            validate_file_header(&header)?;
        }

        Ok(Self { path, file })
    }

    /// Append `record`, `fsync` before returning. The caller must not treat
    /// the merge as durable until this returns `Ok`.
    pub fn append(&mut self, record: &ServiceRecord) -> Result<(), WalError> {
        let payload = encode_canonical(record)?;
        if payload.len() > MAX_RECORD_LEN {
            return Err(WalError::RecordTooLarge(payload.len()));
        }
        let crc = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&payload);

        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Validate the file header, then replay every well-formed record. On
    /// encountering a torn or corrupt record (short read, CRC mismatch, or a
    /// declared length exceeding the cap), stop and truncate the file at the
    /// last good offset — that tail write never completed its `fsync`. A
    /// file that isn't empty but is too short to hold a header, or whose
    /// header is torn, is treated as a torn write and truncated back to an
    /// empty (headerless) file rather than failing open. A file with the
    /// wrong magic or an unsupported version is rejected outright: it is not
    /// a Myco WAL this build can safely replay.
    pub fn recover(path: impl AsRef<Path>) -> Result<RecoveryReport, WalError> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut records = Vec::new();
        let mut truncated = false;

        let mut offset: u64 = if file_len == 0 {
            // Brand new file: `Wal::open` will write the header next.
            0
        } else {
            let mut file_header = [0u8; FILE_HEADER_LEN];
            match reader.read_exact(&mut file_header) {
                Ok(()) => {
                    validate_file_header(&file_header)?;
                    FILE_HEADER_LEN as u64
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    // Non-empty but shorter than a header: the header write
                    // itself never completed its fsync. Truncate back to
                    // empty so `Wal::open` writes a fresh one.
                    truncated = true;
                    0
                }
                Err(e) => return Err(e.into()),
            }
        };

        loop {
            let mut header = [0u8; RECORD_HEADER_LEN];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
            let stored_crc = u32::from_le_bytes(header[4..8].try_into().unwrap());

            if len > MAX_RECORD_LEN {
                truncated = true;
                break;
            }

            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                truncated = true;
                break;
            }

            if crc32fast::hash(&payload) != stored_crc {
                truncated = true;
                break;
            }

            let record: ServiceRecord = match decode_canonical_limited(&payload, MAX_RECORD_LEN) {
                Ok(r) => r,
                Err(_) => {
                    truncated = true;
                    break;
                }
            };

            offset += (RECORD_HEADER_LEN + len) as u64;
            records.push(RecoveredRecord { record, end_offset: offset });
        }

        if truncated {
            let mut file = reader.into_inner();
            file.seek(SeekFrom::Start(offset))?;
            file.set_len(offset)?;
            file.sync_all()?;
        }

        Ok(RecoveryReport { records, truncated })
    }

    /// Replace the WAL contents with a fresh log seeded from `snapshot`
    /// (the checkpointed catalog), via write-to-temp-then-atomic-rename so a
    /// crash mid-compaction never leaves a half-written file in `path`'s
    /// place.
    pub fn checkpoint(path: impl AsRef<Path>, node_id: NodeId, snapshot: &[ServiceRecord]) -> Result<Self, WalError> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("wal.tmp");

        {
            let mut tmp = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
            tmp.write_all(&encode_file_header(node_id))?;
            for record in snapshot {
                let payload = encode_canonical(record)?;
                if payload.len() > MAX_RECORD_LEN {
                    return Err(WalError::RecordTooLarge(payload.len()));
                }
                let crc = crc32fast::hash(&payload);
                tmp.write_all(&(payload.len() as u32).to_le_bytes())?;
                tmp.write_all(&crc.to_le_bytes())?;
                tmp.write_all(&payload)?;
            }
            tmp.sync_all()?;
        }

        std::fs::rename(&tmp_path, path)?;
        Self::open(path, node_id)
    }

    /// Path backing this WAL, for diagnostics.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::HlcTimestamp;
    use crate::core::types::{ExecName, FlakeUri, NodeId, ServiceName};

    fn rec(name: &str, version: u64) -> ServiceRecord {
        ServiceRecord {
            name: ServiceName::new(name).unwrap(),
            version,
            hlc: HlcTimestamp::zero(NodeId::from_bytes([1; 32])),
            flake_uri: FlakeUri::new("github:nixos/nixpkgs#redis").unwrap(),
            exec_name: ExecName::new("redis").unwrap(),
            tombstone: false,
        }
    }

    #[test]
    fn append_then_recover_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        let mut wal = Wal::open(&path, NodeId::from_bytes([1; 32])).unwrap();
        wal.append(&rec("redis", 1)).unwrap();
        wal.append(&rec("nginx", 1)).unwrap();
        drop(wal);

        let report = Wal::recover(&path).unwrap();
        assert!(!report.truncated);
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].record.name.as_str(), "redis");
        assert_eq!(report.records[1].record.name.as_str(), "nginx");
    }

    #[test]
    fn torn_tail_record_is_truncated_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        let mut wal = Wal::open(&path, NodeId::from_bytes([1; 32])).unwrap();
        wal.append(&rec("redis", 1)).unwrap();
        drop(wal);

        // Simulate a crash mid-write: append a header claiming more payload
        // than actually follows.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&0u32.to_le_bytes()).unwrap();
        file.write_all(b"short").unwrap();
        drop(file);

        let report = Wal::recover(&path).unwrap();
        assert!(report.truncated);
        assert_eq!(report.records.len(), 1);

        let len_after = std::fs::metadata(&path).unwrap().len();
        let report2 = Wal::recover(&path).unwrap();
        assert!(!report2.truncated);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_after);
    }

    #[test]
    fn corrupt_crc_is_treated_as_torn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        let mut wal = Wal::open(&path, NodeId::from_bytes([1; 32])).unwrap();
        wal.append(&rec("redis", 1)).unwrap();
        drop(wal);

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let report = Wal::recover(&path).unwrap();
        assert!(report.truncated);
        assert!(report.records.is_empty());
    }

    #[test]
    fn checkpoint_replaces_log_with_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        let mut wal = Wal::open(&path, NodeId::from_bytes([1; 32])).unwrap();
        for i in 0..20 {
            wal.append(&rec(&format!("svc-{i}"), 1)).unwrap();
        }
        drop(wal);

        let snapshot = vec![rec("redis", 5), rec("nginx", 2)];
        let _wal = Wal::checkpoint(&path, NodeId::from_bytes([1; 32]), &snapshot).unwrap();

        let report = Wal::recover(&path).unwrap();
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].record.version, 5);
    }

    #[test]
    fn fresh_file_recovers_empty_and_untruncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        let report = Wal::recover(&path).unwrap();
        assert!(!report.truncated);
        assert!(report.records.is_empty());
    }

    #[test]
    fn header_is_written_on_create_and_validated_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");
        let node_id = NodeId::from_bytes([9; 32]);

        let wal = Wal::open(&path, node_id).unwrap();
        drop(wal);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..8], WAL_MAGIC);
        assert_eq!(u16::from_le_bytes(bytes[8..10].try_into().unwrap()), WAL_VERSION);
        assert_eq!(&bytes[10..42], node_id.as_bytes());

        // Reopening an existing, valid header must succeed and must not
        // rewrite or duplicate it.
        let _wal = Wal::open(&path, node_id).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), FILE_HEADER_LEN as u64);
    }

    #[test]
    fn bad_magic_is_rejected_by_open_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        let mut bytes = vec![0u8; FILE_HEADER_LEN];
        bytes[0..8].copy_from_slice(b"NOTMYCO1");
        bytes[8..10].copy_from_slice(&WAL_VERSION.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(Wal::recover(&path), Err(WalError::BadMagic)));
        assert!(matches!(Wal::open(&path, NodeId::from_bytes([1; 32])), Err(WalError::BadMagic)));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        let mut bytes = vec![0u8; FILE_HEADER_LEN];
        bytes[0..8].copy_from_slice(WAL_MAGIC);
        bytes[8..10].copy_from_slice(&99u16.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(Wal::recover(&path), Err(WalError::UnsupportedVersion(99))));
        assert!(matches!(
            Wal::open(&path, NodeId::from_bytes([1; 32])),
            Err(WalError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn torn_header_is_truncated_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        // Fewer bytes than a full header: the header write itself was torn.
        std::fs::write(&path, &WAL_MAGIC[..4]).unwrap();

        let report = Wal::recover(&path).unwrap();
        assert!(report.truncated);
        assert!(report.records.is_empty());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
