//! File identity and content hashing (spec §3 `FileIdentity`).
//!
//! Two `FileIdentity` values with equal `(device_id, inode, size,
//! mtime_ns)` are defined to refer to the same logical content; the
//! SHA-256 `content_hash` is only computed lazily, when a cache lookup
//! needs byte-level certainty beyond metadata.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub absolute_path: PathBuf,
    pub device_id: u64,
    pub inode: u64,
    pub size: u64,
    pub mtime_ns: i128,
    pub content_hash: Option<[u8; 32]>,
}

impl FileIdentity {
    /// Build an identity from a canonical path's current metadata. Does not
    /// compute `content_hash` — callers needing it call `ensure_content_hash`.
    pub fn from_metadata(absolute_path: PathBuf, meta: &fs::Metadata) -> Self {
        Self {
            absolute_path,
            device_id: meta.dev(),
            inode: meta.ino(),
            size: meta.len(),
            mtime_ns: mtime_ns(meta),
            content_hash: None,
        }
    }

    pub fn stat(absolute_path: &Path) -> io::Result<Self> {
        let meta = fs::symlink_metadata(absolute_path)?;
        Ok(Self::from_metadata(absolute_path.to_path_buf(), &meta))
    }

    /// Two identities refer to the same logical content iff this quadruple
    /// matches — the invariant from spec §3.
    pub fn identity_key(&self) -> (u64, u64, u64, i128) {
        (self.device_id, self.inode, self.size, self.mtime_ns)
    }

    /// Lazily compute and cache the SHA-256 of file contents.
    pub fn ensure_content_hash(&mut self) -> io::Result<[u8; 32]> {
        if let Some(h) = self.content_hash {
            return Ok(h);
        }
        let hash = sha256_file(&self.absolute_path)?;
        self.content_hash = Some(hash);
        Ok(hash)
    }

    /// Re-stat the path and compare against the recorded identity; used by
    /// the cache to detect mutation (mtime/size change) cheaply, without
    /// reading file content.
    pub fn still_current(&self) -> bool {
        match fs::symlink_metadata(&self.absolute_path) {
            Ok(meta) => {
                meta.dev() == self.device_id
                    && meta.ino() == self.inode
                    && meta.len() == self.size
                    && mtime_ns(&meta) == self.mtime_ns
            }
            Err(_) => false,
        }
    }
}

fn mtime_ns(meta: &fs::Metadata) -> i128 {
    (meta.mtime() as i128) * 1_000_000_000 + meta.mtime_nsec() as i128
}

pub fn sha256_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn identity_changes_on_content_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"hello").unwrap();
        let id1 = FileIdentity::stat(&path).unwrap();
        assert!(id1.still_current());

        // Mutate: append data, which changes size and (with high probability) mtime.
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b" world").unwrap();
        drop(f);

        assert!(!id1.still_current());
    }

    #[test]
    fn content_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"hello").unwrap();
        let mut id = FileIdentity::stat(&path).unwrap();
        let h1 = id.ensure_content_hash().unwrap();
        let h2 = id.ensure_content_hash().unwrap();
        assert_eq!(h1, h2);
        assert_eq!(hex(&h1).len(), 64);
    }
}
