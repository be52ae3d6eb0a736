//! Append-only log of 16-byte `Entry` records, grounded in the teacher's
//! own on-disk label framing (`bincode` + `crc32` + `snafu`, see
//! `nexus_label.rs`).
//!
//! Every physical record is 16 bytes. A `Loc` entry is logically 32 bytes:
//! a `LocHead` record (tag, cluster address, packed cluster location)
//! immediately followed by a raw 16-byte hash record with no tag of its
//! own — the reader always knows to consume it because it only ever
//! follows a `LocHead`. This is the bit-layout decision recorded in
//! SPEC_FULL.md's resolved Open Questions.

use crate::{
    error::EngineErrorKind,
    types::{ClusterAddress, ClusterLocation, ContentHash},
};
use crc::crc32::{self, Hasher32};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::{
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

pub const RECORD_SIZE: usize = 16;

const TAG_LOC_HEAD: u8 = 0;
const TAG_TLOG_CRC: u8 = 1;
const TAG_SCO_CRC: u8 = 2;
const TAG_SYNC: u8 = 3;

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum TLogError {
    #[snafu(display("failed to open tlog at {}: {message}", path.display()))]
    Open { path: PathBuf, message: String },
    #[snafu(display("failed to write tlog record: {message}"))]
    Write { message: String },
    #[snafu(display("failed to rename sealed tlog {}: {message}", path.display()))]
    Seal { path: PathBuf, message: String },
    #[snafu(display("tlog {id} is already sealed"))]
    AlreadySealed { id: String },
}

impl TLogError {
    pub fn kind(&self) -> EngineErrorKind {
        EngineErrorKind::TransientBackend
    }
}

/// A logical entry in the TLog stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Loc {
        ca: ClusterAddress,
        cl: ClusterLocation,
        hash: ContentHash,
    },
    SCOCRC(u32),
    TLogCRC(u32),
    SyncTC,
}

#[derive(Serialize, Deserialize)]
struct RawRecord {
    tag: u8,
    a: u32,
    b: u64,
    pad: [u8; 3],
}

fn encode_record(tag: u8, a: u32, b: u64) -> [u8; RECORD_SIZE] {
    let raw = RawRecord {
        tag,
        a,
        b,
        pad: [0; 3],
    };
    let bytes = bincode::serialize(&raw).expect("fixed-size record never fails");
    let mut out = [0u8; RECORD_SIZE];
    out.copy_from_slice(&bytes);
    out
}

fn decode_record(buf: &[u8; RECORD_SIZE]) -> RawRecord {
    bincode::deserialize(buf).expect("fixed-size record never fails")
}

/// Serializes a finite slice of entries into a byte stream. Pure function,
/// used both by `TLog::append` and directly by property tests (8.2:
/// `parse(serialize(entries)) == entries`).
pub fn serialize_entries(entries: &[Entry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * RECORD_SIZE);
    for e in entries {
        match e {
            Entry::Loc { ca, cl, hash } => {
                out.extend_from_slice(&encode_record(
                    TAG_LOC_HEAD,
                    *ca,
                    cl.to_bits(),
                ));
                out.extend_from_slice(&hash.0);
            }
            Entry::SCOCRC(crc) => {
                out.extend_from_slice(&encode_record(
                    TAG_SCO_CRC,
                    *crc,
                    0,
                ));
            }
            Entry::TLogCRC(crc) => {
                out.extend_from_slice(&encode_record(
                    TAG_TLOG_CRC,
                    *crc,
                    0,
                ));
            }
            Entry::SyncTC => {
                out.extend_from_slice(&encode_record(TAG_SYNC, 0, 0));
            }
        }
    }
    out
}

/// Parses a byte stream of entries. Trailing bytes that don't form a
/// complete record are silently dropped — this is the "tolerate corrupted
/// trailing bytes" rule from §4.F, not an error: a partially written last
/// record is exactly what a crash mid-append leaves behind.
pub fn parse_entries(bytes: &[u8]) -> Vec<Entry> {
    let mut out = vec![];
    let mut i = 0;
    while i + RECORD_SIZE <= bytes.len() {
        let mut buf = [0u8; RECORD_SIZE];
        buf.copy_from_slice(&bytes[i .. i + RECORD_SIZE]);
        i += RECORD_SIZE;
        let raw = decode_record(&buf);
        match raw.tag {
            TAG_LOC_HEAD => {
                if i + RECORD_SIZE > bytes.len() {
                    break; // truncated hash record: whole LOC is unwritten
                }
                let mut hash = [0u8; 16];
                hash.copy_from_slice(&bytes[i .. i + RECORD_SIZE]);
                i += RECORD_SIZE;
                out.push(Entry::Loc {
                    ca: raw.a,
                    cl: ClusterLocation::from_bits(raw.b),
                    hash: ContentHash(hash),
                });
            }
            TAG_SCO_CRC => out.push(Entry::SCOCRC(raw.a)),
            TAG_TLOG_CRC => out.push(Entry::TLogCRC(raw.a)),
            TAG_SYNC => out.push(Entry::SyncTC),
            _ => break, // unrecognised tag: treat the rest as garbage
        }
    }
    out
}

/// Truncates a parsed entry stream at the last `TLogCRC`, mirroring the
/// restart rule: "everything past [the last TLogCRC] is considered
/// unwritten and discarded on restart." Sealed TLogs always end in a
/// `TLogCRC`; an *open* TLog being replayed has none yet, so the whole
/// parsed stream (minus a trailing partial record, already dropped by
/// `parse_entries`) is kept.
pub fn entries_up_to_last_crc(entries: &[Entry]) -> &[Entry] {
    match entries.iter().rposition(|e| matches!(e, Entry::TLogCRC(_))) {
        Some(idx) => &entries[..= idx],
        None => entries,
    }
}

fn crc32_of(bytes: &[u8]) -> u32 {
    let mut digest = crc32::Digest::new(crc32::IEEE);
    digest.write(bytes);
    digest.sum32()
}

/// An append-only TLog file. Synchronous by design: it sits on the
/// critical path under the per-volume append mutex (§5), so it never
/// awaits — `DataStore` calls it while holding that mutex and the caller
/// bridges to async contexts with `spawn_blocking`.
pub struct TLog {
    id: crate::types::TLogId,
    path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
    sealed: bool,
}

impl TLog {
    pub fn create(dir: &Path, id: crate::types::TLogId) -> Result<Self, TLogError> {
        let path = dir.join(format!("open_{id}"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| TLogError::Open {
                path: path.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            id,
            path,
            writer: BufWriter::new(file),
            bytes_written: 0,
            sealed: false,
        })
    }

    pub fn id(&self) -> crate::types::TLogId {
        self.id
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// O(1): appends one entry's wire bytes and flushes them to the OS
    /// (not necessarily to disk — `seal` fsyncs).
    pub fn append(&mut self, entry: Entry) -> Result<(), TLogError> {
        if self.sealed {
            return Err(TLogError::AlreadySealed {
                id: self.id.to_string(),
            });
        }
        let bytes = serialize_entries(std::slice::from_ref(&entry));
        self.writer.write_all(&bytes).map_err(|e| TLogError::Write {
            message: e.to_string(),
        })?;
        self.writer.flush().map_err(|e| TLogError::Write {
            message: e.to_string(),
        })?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Emits `SyncTC` then `TLogCRC(crc32 of all preceding bytes)`, fsyncs
    /// and renames the file to its final `tlog_<id>` name.
    pub fn seal(&mut self, tlog_dir: &Path) -> Result<PathBuf, TLogError> {
        if self.sealed {
            return Err(TLogError::AlreadySealed {
                id: self.id.to_string(),
            });
        }
        self.append(Entry::SyncTC)?;
        // Re-read what's on disk so far to compute the CRC over exactly
        // the bytes that will be shipped to the backend.
        self.writer.flush().map_err(|e| TLogError::Write {
            message: e.to_string(),
        })?;
        let existing = std::fs::read(&self.path).map_err(|e| TLogError::Write {
            message: e.to_string(),
        })?;
        let crc = crc32_of(&existing);
        self.append(Entry::TLogCRC(crc))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| TLogError::Write {
                message: e.to_string(),
            })?;
        self.sealed = true;
        let sealed_path = tlog_dir.join(format!("tlog_{}", self.id));
        std::fs::rename(&self.path, &sealed_path).map_err(|e| TLogError::Seal {
            path: sealed_path.clone(),
            message: e.to_string(),
        })?;
        self.path = sealed_path.clone();
        Ok(sealed_path)
    }

    /// Streams entries back out, tolerant of a truncated trailing record.
    pub fn read_entries(path: &Path) -> Result<Vec<Entry>, TLogError> {
        let file = File::open(path).map_err(|e| TLogError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut reader = BufReader::new(file);
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).map_err(|e| TLogError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(parse_entries(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_arbitrary_entries() {
        let entries = vec![
            Entry::Loc {
                ca: 0,
                cl: ClusterLocation::new(1, 0),
                hash: ContentHash::of(b"a"),
            },
            Entry::Loc {
                ca: 1,
                cl: ClusterLocation::new(1, 1),
                hash: ContentHash::of(b"b"),
            },
            Entry::SCOCRC(0xDEAD_BEEF),
            Entry::SyncTC,
            Entry::TLogCRC(0x1234_5678),
        ];
        let bytes = serialize_entries(&entries);
        assert_eq!(parse_entries(&bytes), entries);
    }

    #[test]
    fn truncated_trailing_record_is_dropped_not_errored() {
        let entries = vec![Entry::SCOCRC(1), Entry::SyncTC];
        let mut bytes = serialize_entries(&entries);
        bytes.truncate(bytes.len() - 3); // chop mid-record
        let parsed = parse_entries(&bytes);
        assert_eq!(parsed, vec![Entry::SCOCRC(1)]);
    }

    #[test]
    fn entries_past_last_crc_are_discarded_on_restart() {
        let entries = vec![
            Entry::SCOCRC(1),
            Entry::TLogCRC(2),
            Entry::SCOCRC(3), // written after the logical seal: a bug, or
                              // leftover from a reused buffer; must not survive
        ];
        let kept = entries_up_to_last_crc(&entries);
        assert_eq!(kept, &entries[..=1]);
    }

    #[test]
    fn append_seal_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let id = uuid::Uuid::new_v4();
        let mut tlog = TLog::create(dir.path(), id).unwrap();
        tlog.append(Entry::Loc {
            ca: 42,
            cl: ClusterLocation::new(3, 7),
            hash: ContentHash::of(b"cluster"),
        })
        .unwrap();
        let sealed_path = tlog.seal(dir.path()).unwrap();
        let entries = TLog::read_entries(&sealed_path).unwrap();
        assert!(matches!(entries[0], Entry::Loc { ca: 42, .. }));
        assert!(matches!(entries[1], Entry::SyncTC));
        assert!(matches!(entries[2], Entry::TLogCRC(_)));
    }
}
