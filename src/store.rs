//! # Content-Addressed Store
//!
//! Durable, deduplicated storage of blobs keyed by SHA-256 digest.
//! Every other subsystem stores bytes here and passes digests around:
//! image layers and configs, build inputs and outputs, capsule memory
//! images and filesystem archives.
//!
//! ## Storage Model
//!
//! Objects live in a two-level directory shard keyed by the first two
//! hex characters of the digest:
//!
//! ```text
//! <root>/
//! ├── objects/
//! │   ├── ab/
//! │   │   └── cdef1234...   (object bytes)
//! │   └── cd/
//! │       └── ef567890...
//! ├── meta/
//! │   └── ab/
//! │       └── cdef1234...   (kind + metadata sidecar, JSON)
//! └── tmp/                   (in-flight writes)
//! ```
//!
//! ## Integrity
//!
//! [`ContentStore::put`] computes the digest itself, so stored bytes
//! always hash to their key. [`ContentStore::get`] re-hashes on every
//! read; a corrupted object is deleted on detection and reported as
//! `HashMismatch` so the caller can re-fetch.
//!
//! ## Atomicity
//!
//! Writes go to `tmp/` and are renamed into place within the same
//! filesystem. A reader observes either the complete object or
//! `NotFound`, never a partial write. Interrupted writes leave only
//! `tmp/` litter, which garbage collection clears.
//!
//! ## Garbage Collection
//!
//! [`ContentStore::gc`] marks from caller-provided roots (image
//! manifests, snapshot metadata, build-output manifests), following
//! digest references found in manifest-kind objects, then sweeps
//! everything unmarked.

use crate::constants::{OBJECTS_DIR, TMP_DIR};
use crate::digest::{Digest, ObjectKind};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sidecar directory holding object kind and metadata records.
const META_DIR: &str = "meta";

/// Descriptor for a stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Content digest.
    pub digest: Digest,
    /// Object size in bytes.
    pub size: u64,
    /// Kind tag.
    pub kind: ObjectKind,
    /// Free-form metadata attached at write time.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Statistics from a garbage collection run.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Number of objects removed.
    pub removed_count: u64,
    /// Bytes freed.
    pub freed_bytes: u64,
}

/// Memoization key for `put_path`: identity of a file at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PathStamp {
    path: PathBuf,
    len: u64,
    modified: Option<SystemTime>,
}

/// Content-addressed store rooted at a single directory.
///
/// Thread-safe: object writes are independent and atomic; the path
/// dedup cache is behind its own lock. GC must not run concurrently
/// with writes of objects not yet referenced by a root.
pub struct ContentStore {
    root: PathBuf,
    /// Memoizes `put_path` results per (path, size, mtime).
    path_cache: RwLock<HashMap<PathStamp, Digest>>,
}

impl ContentStore {
    /// Opens a store at the default platform directory
    /// (`~/.strato`, or `./.strato` without a home).
    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_root())
    }

    /// The default platform state directory.
    pub fn default_root() -> PathBuf {
        match dirs::home_dir() {
            Some(home) => home.join(crate::constants::PLATFORM_DIR),
            None => PathBuf::from(crate::constants::PLATFORM_DIR),
        }
    }

    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in [OBJECTS_DIR, META_DIR, TMP_DIR] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| Error::StorageError {
                path: dir,
                reason: e.to_string(),
            })?;
        }

        info!(root = %root.display(), "content store opened");

        Ok(Self {
            root,
            path_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an object's bytes on disk.
    pub fn object_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(OBJECTS_DIR)
            .join(digest.shard())
            .join(digest.shard_rest())
    }

    fn meta_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(META_DIR)
            .join(digest.shard())
            .join(digest.shard_rest())
    }

    /// Checks whether an object exists.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.object_path(digest).exists()
    }

    /// Stores `data` under its computed digest.
    ///
    /// Idempotent: storing bytes already present returns the digest
    /// without re-writing. The write is atomic (temp file + rename in
    /// the same filesystem), so readers never see partial objects.
    pub fn put(&self, data: &[u8], kind: ObjectKind) -> Result<Digest> {
        self.put_with_metadata(data, kind, BTreeMap::new())
    }

    /// Stores `data` with attached metadata.
    pub fn put_with_metadata(
        &self,
        data: &[u8],
        kind: ObjectKind,
        metadata: BTreeMap<String, String>,
    ) -> Result<Digest> {
        let digest = Digest::of_bytes(data);
        let path = self.object_path(&digest);

        if path.exists() {
            debug!(%digest, "object already present");
            return Ok(digest);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageError {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        // Unique temp name: concurrent writers of the same bytes race
        // benignly, the final rename is atomic and content-identical.
        let tmp = self
            .root
            .join(TMP_DIR)
            .join(format!("{}.{}", digest.hex(), Uuid::new_v4().simple()));
        fs::write(&tmp, data).map_err(|e| Error::StorageError {
            path: tmp.clone(),
            reason: e.to_string(),
        })?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(Error::StorageError {
                path,
                reason: e.to_string(),
            });
        }

        self.write_meta(&ObjectInfo {
            digest,
            size: data.len() as u64,
            kind,
            metadata,
        })?;

        debug!(%digest, size = data.len(), %kind, "object stored");
        Ok(digest)
    }

    /// Reads an object, verifying its digest.
    ///
    /// A corrupted object is deleted before `HashMismatch` is returned
    /// so a subsequent re-fetch can repopulate it.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.object_path(digest);
        let data = fs::read(&path).map_err(|_| Error::NotFound {
            digest: digest.to_string(),
        })?;

        let actual = Digest::of_bytes(&data);
        if actual != *digest {
            warn!(expected = %digest, %actual, "corrupt object detected, quarantining");
            let _ = fs::remove_file(&path);
            let _ = fs::remove_file(self.meta_path(digest));
            return Err(Error::HashMismatch {
                digest: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        Ok(data)
    }

    /// Returns the descriptor of a stored object.
    pub fn stat(&self, digest: &Digest) -> Result<ObjectInfo> {
        let meta_path = self.meta_path(digest);
        if !self.contains(digest) {
            return Err(Error::NotFound {
                digest: digest.to_string(),
            });
        }
        let raw = fs::read(&meta_path).map_err(|e| Error::StorageError {
            path: meta_path,
            reason: e.to_string(),
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Stores the contents of a file, memoized per path.
    ///
    /// The memo key includes size and mtime, so a modified file is
    /// re-hashed while repeated ingestion of an unchanged file skips
    /// both the read and the hash.
    pub fn put_path(&self, path: impl AsRef<Path>, kind: ObjectKind) -> Result<Digest> {
        let path = path.as_ref();
        let meta = fs::metadata(path).map_err(|e| Error::StorageError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let stamp = PathStamp {
            path: path.to_path_buf(),
            len: meta.len(),
            modified: meta.modified().ok(),
        };

        if let Some(digest) = self.path_cache.read().expect("path cache lock poisoned").get(&stamp)
            && self.contains(digest)
        {
            debug!(path = %path.display(), %digest, "put_path memoized");
            return Ok(*digest);
        }

        let data = fs::read(path).map_err(|e| Error::StorageError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let digest = self.put(&data, kind)?;

        self.path_cache
            .write()
            .expect("path cache lock poisoned")
            .insert(stamp, digest);
        Ok(digest)
    }

    /// Lists every stored object digest.
    pub fn list(&self) -> Result<Vec<Digest>> {
        let mut digests = Vec::new();
        let objects = self.root.join(OBJECTS_DIR);
        for shard in read_dir(&objects)? {
            let shard_name = shard.file_name();
            for entry in read_dir(&shard.path())? {
                if let Some(rest) = entry.file_name().to_str() {
                    let full = format!("sha256:{}{}", shard_name.to_string_lossy(), rest);
                    if let Ok(digest) = full.parse::<Digest>() {
                        digests.push(digest);
                    }
                }
            }
        }
        Ok(digests)
    }

    /// Removes a single object.
    pub fn remove(&self, digest: &Digest) -> Result<()> {
        let path = self.object_path(digest);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::StorageError {
                path,
                reason: e.to_string(),
            })?;
        }
        let _ = fs::remove_file(self.meta_path(digest));
        Ok(())
    }

    /// Garbage collects objects unreachable from `roots`.
    ///
    /// Marking follows digest references embedded in reachable objects
    /// of manifest kind (image manifests, build-output manifests,
    /// snapshot metadata), so a root manifest keeps its layers alive.
    /// Stale temp files are cleared as part of the sweep. Best-effort:
    /// unreadable objects are skipped, not fatal.
    pub fn gc(&self, roots: &[Digest]) -> Result<GcStats> {
        let mut marked: HashSet<Digest> = HashSet::new();
        let mut queue: VecDeque<Digest> = roots.iter().copied().collect();

        while let Some(digest) = queue.pop_front() {
            if !marked.insert(digest) {
                continue;
            }
            let follow = match self.stat(&digest) {
                Ok(info) => matches!(info.kind, ObjectKind::Manifest | ObjectKind::Config),
                // No sidecar: be conservative and scan for references.
                Err(_) => true,
            };
            if !follow {
                continue;
            }
            if let Ok(data) = self.get(&digest) {
                for referenced in extract_digest_refs(&data) {
                    if !marked.contains(&referenced) {
                        queue.push_back(referenced);
                    }
                }
            }
        }

        let mut stats = GcStats::default();
        for digest in self.list()? {
            if marked.contains(&digest) {
                continue;
            }
            let path = self.object_path(&digest);
            if let Ok(meta) = fs::metadata(&path) {
                stats.freed_bytes += meta.len();
            }
            if self.remove(&digest).is_ok() {
                stats.removed_count += 1;
            }
        }

        // tmp/ entries are leftovers of interrupted writes.
        for entry in read_dir(&self.root.join(TMP_DIR))? {
            let _ = fs::remove_file(entry.path());
        }

        info!(
            removed = stats.removed_count,
            freed = stats.freed_bytes,
            "gc complete"
        );
        Ok(stats)
    }

    fn write_meta(&self, info: &ObjectInfo) -> Result<()> {
        let path = self.meta_path(&info.digest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageError {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        let raw = serde_json::to_vec(info)?;
        fs::write(&path, raw).map_err(|e| Error::StorageError {
            path,
            reason: e.to_string(),
        })
    }
}

/// Extracts `sha256:<64 hex>` references from object bytes.
///
/// Works for both JSON image manifests and the line-oriented
/// `key:value` metadata blobs, which all spell digests in printable
/// form.
fn extract_digest_refs(data: &[u8]) -> Vec<Digest> {
    let text = String::from_utf8_lossy(data);
    let mut refs = Vec::new();
    let mut rest: &str = &text;
    while let Some(idx) = rest.find("sha256:") {
        let tail = &rest[idx + 7..];
        let hex_len = tail.chars().take_while(|c| c.is_ascii_hexdigit()).count();
        if hex_len >= 64
            && let Ok(digest) = format!("sha256:{}", &tail[..64]).parse::<Digest>()
        {
            refs.push(digest);
        }
        rest = &rest[idx + 7..];
    }
    refs
}

fn read_dir(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::StorageError {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })? {
        entries.push(entry.map_err(|e| Error::StorageError {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_get_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path()).unwrap();

        let digest = store.put(b"hello", ObjectKind::Layer).unwrap();
        assert_eq!(store.get(&digest).unwrap(), b"hello");
        assert_eq!(digest, Digest::of_bytes(b"hello"));
    }

    #[test]
    fn put_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path()).unwrap();

        let d1 = store.put(b"hello", ObjectKind::Layer).unwrap();
        let d2 = store.put(b"hello", ObjectKind::Layer).unwrap();
        assert_eq!(d1, d2);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_object_is_quarantined_on_read() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::open(temp.path()).unwrap();

        let digest = store.put(b"payload", ObjectKind::Build).unwrap();
        fs::write(store.object_path(&digest), b"tampered").unwrap();

        match store.get(&digest) {
            Err(Error::HashMismatch { .. }) => {}
            other => panic!("expected HashMismatch, got {other:?}"),
        }
        // Deleted on detection so a re-fetch can repopulate.
        assert!(!store.contains(&digest));
    }

    #[test]
    fn extract_refs_from_manifest_text() {
        let layer = Digest::of_bytes(b"layer");
        let config = Digest::of_bytes(b"config");
        let text = format!("BUILD_OUTPUTS_v1\nout:{layer}\ncfg:{config}\n");
        let refs = extract_digest_refs(text.as_bytes());
        assert!(refs.contains(&layer));
        assert!(refs.contains(&config));
    }
}
