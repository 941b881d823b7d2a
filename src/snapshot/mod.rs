//! # Snapshot & Migration
//!
//! Produces consistent capsule snapshots (memory image, filesystem
//! archive, network and process state), restores them, and drives live
//! migration and rollback on top.
//!
//! Memory and filesystem bytes go into the content store; the snapshot
//! record holds their digests plus the structured state, so snapshots
//! are immutable once finalized and deduplicate across capsules.
//!
//! Capture freezes the capsule's cgroup for the duration, which makes
//! the memory image, fd tables, and connection table mutually
//! consistent.

mod checkpoint;
mod migrate;
mod policy;

pub use checkpoint::{
    CheckpointEngine, ConnectionState, FdEntry, InMemoryCheckpointEngine, InterfaceState, NetworkState,
    ProcCheckpointEngine, ProcessRecord, ProcessState, ThreadState,
};
pub use migrate::{HealthProbe, MigrationCoordinator, MigrationOutcome, RunningProbe};
pub use policy::{
    NamedSnapshotSpec, OperationTrigger, PolicyEngine, RetentionPolicy, SnapshotTriggers, WatchConfig,
};

use crate::capsule::{CapsuleConfig, CapsuleId, CapsuleRuntime};
use crate::constants::{FILESYSTEM_SNAPSHOT_HEADER, MEMORY_DUMP_HEADER};
use crate::digest::{Digest, ObjectKind};
use crate::error::{Error, Result};
use crate::image::ImageManifest;
use crate::store::ContentStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

// =============================================================================
// Snapshot Record
// =============================================================================

/// A finalized snapshot. Immutable; stored by reference in the
/// content store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub capsule_id: String,
    pub taken_at: DateTime<Utc>,
    /// Digest of the `MEMORY_DUMP_v1` metadata blob.
    pub memory_digest: Digest,
    /// Digest of the `FILESYSTEM_SNAPSHOT_v1` metadata blob.
    pub filesystem_digest: Digest,
    pub network_state: NetworkState,
    pub process_state: ProcessState,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Digest of this record's blob in the content store.
    pub record_digest: Digest,
}

impl Snapshot {
    /// Whether retention must never delete this snapshot.
    pub fn keep_forever(&self) -> bool {
        self.metadata.get("keep_forever").map(String::as_str) == Some("true")
    }
}

// =============================================================================
// Filesystem Capability
// =============================================================================

/// Snapshot-capable filesystem seam.
///
/// BTRFS/ZFS drivers implement this against native subvolume
/// snapshots; the portable implementation archives the tree.
pub trait SnapshotFilesystem: Send + Sync {
    /// Captures the tree at `path` into one blob.
    fn capture(&self, path: &Path) -> Result<Vec<u8>>;

    /// Materializes a captured blob into `path`.
    fn materialize(&self, archive: &[u8], path: &Path) -> Result<()>;

    /// Driver name recorded in snapshot metadata.
    fn name(&self) -> &str;
}

/// Portable tar-based snapshotter.
#[derive(Default)]
pub struct TarSnapshotter;

impl SnapshotFilesystem for TarSnapshotter {
    fn capture(&self, path: &Path) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        builder
            .append_dir_all(".", path)
            .map_err(|e| Error::SnapshotFailed {
                capsule: path.display().to_string(),
                reason: format!("archive: {e}"),
            })?;
        builder.into_inner().map_err(|e| Error::SnapshotFailed {
            capsule: path.display().to_string(),
            reason: format!("archive finalize: {e}"),
        })
    }

    fn materialize(&self, archive: &[u8], path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| Error::RestoreFailed {
            capsule: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut archive = tar::Archive::new(archive);
        archive.unpack(path).map_err(|e| Error::RestoreFailed {
            capsule: path.display().to_string(),
            reason: format!("unpack: {e}"),
        })
    }

    fn name(&self) -> &str {
        "tar"
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Takes, indexes, restores, and rolls back snapshots.
pub struct SnapshotManager {
    store: Arc<ContentStore>,
    engine: Arc<dyn CheckpointEngine>,
    filesystem: Arc<dyn SnapshotFilesystem>,
    index: RwLock<Vec<Snapshot>>,
}

impl SnapshotManager {
    pub fn new(
        store: Arc<ContentStore>,
        engine: Arc<dyn CheckpointEngine>,
        filesystem: Arc<dyn SnapshotFilesystem>,
    ) -> Self {
        Self {
            store,
            engine,
            filesystem,
            index: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<dyn CheckpointEngine> {
        &self.engine
    }

    /// Takes a consistent snapshot of a capsule.
    ///
    /// A live capsule is frozen for the duration of the capture and
    /// thawed before return, error or not.
    pub async fn take(
        &self,
        runtime: &CapsuleRuntime,
        id: &CapsuleId,
        mut metadata: BTreeMap<String, String>,
    ) -> Result<Snapshot> {
        let capsule = runtime.inspect(id).ok_or_else(|| Error::SnapshotFailed {
            capsule: id.to_string(),
            reason: "unknown capsule".to_string(),
        })?;

        let frozen = if capsule.state.is_live()
            && let Some(cgroup) = runtime.cgroup_of(id)
        {
            cgroup.freeze()?;
            Some(cgroup)
        } else {
            None
        };

        let captured = self.capture_all(runtime, &capsule).await;

        if let Some(cgroup) = frozen {
            // Thaw on every path; a capture error must not leave the
            // capsule frozen.
            if let Err(e) = cgroup.thaw() {
                warn!(capsule = %id.short(), error = %e, "thaw after capture failed");
            }
        }

        let (memory_digest, filesystem_digest, network_state, process_state) = captured?;

        // The capsule's own config rides along so a different node can
        // restore without access to the source runtime.
        if let Some((config, _)) = runtime.config_of(id) {
            if let Ok(raw) = serde_json::to_string(&config) {
                metadata.insert("capsule_config".to_string(), raw);
            }
        }
        metadata.insert("filesystem_driver".to_string(), self.filesystem.name().to_string());

        let taken_at = Utc::now();
        let mut snapshot = Snapshot {
            capsule_id: id.to_string(),
            taken_at,
            memory_digest,
            filesystem_digest,
            network_state,
            process_state,
            metadata,
            // Placeholder until the record blob is stored.
            record_digest: memory_digest,
        };
        let record = serde_json::to_vec(&snapshot)?;
        snapshot.record_digest = self.store.put(&record, ObjectKind::Manifest)?;

        info!(
            capsule = %id.short(),
            record = %snapshot.record_digest,
            fs = %snapshot.filesystem_digest,
            "snapshot finalized"
        );
        self.index.write().expect("snapshot index lock poisoned").push(snapshot.clone());
        Ok(snapshot)
    }

    async fn capture_all(
        &self,
        _runtime: &CapsuleRuntime,
        capsule: &crate::capsule::Capsule,
    ) -> Result<(Digest, Digest, NetworkState, ProcessState)> {
        // Dead capsules snapshot as filesystem-only.
        let (memory, network_state, process_state) = if capsule.state.is_live() && capsule.pid.is_some() {
            (
                self.engine.capture_memory(capsule).await?,
                self.engine.capture_network(capsule).await?,
                self.engine.capture_processes(capsule).await?,
            )
        } else {
            (Vec::new(), NetworkState::default(), ProcessState::default())
        };

        let memory_data_digest = self.store.put(&memory, ObjectKind::Capsule)?;
        let memory_digest = self.store.put(
            format!(
                "{MEMORY_DUMP_HEADER}\ncapsule:{}\ndata:{}\nsize:{}\n",
                capsule.id,
                memory_data_digest,
                memory.len()
            )
            .as_bytes(),
            ObjectKind::Manifest,
        )?;

        let rootfs_archive = {
            let filesystem = Arc::clone(&self.filesystem);
            let rootfs = capsule.rootfs.clone();
            tokio::task::spawn_blocking(move || filesystem.capture(&rootfs))
                .await
                .map_err(|e| Error::SnapshotFailed {
                    capsule: capsule.id.to_string(),
                    reason: format!("filesystem capture task aborted: {e}"),
                })??
        };
        let fs_data_digest = self.store.put(&rootfs_archive, ObjectKind::Capsule)?;
        let filesystem_digest = self.store.put(
            format!(
                "{FILESYSTEM_SNAPSHOT_HEADER}\ncapsule:{}\ndriver:{}\ndata:{}\nsize:{}\n",
                capsule.id,
                self.filesystem.name(),
                fs_data_digest,
                rootfs_archive.len()
            )
            .as_bytes(),
            ObjectKind::Manifest,
        )?;

        Ok((memory_digest, filesystem_digest, network_state, process_state))
    }

    /// Snapshots known for a capsule, oldest first.
    pub fn list(&self, capsule_id: &str) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> = self
            .index
            .read()
            .expect("snapshot index lock poisoned")
            .iter()
            .filter(|s| s.capsule_id == capsule_id)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.taken_at);
        snapshots
    }

    /// All snapshots, oldest first.
    pub fn list_all(&self) -> Vec<Snapshot> {
        let mut snapshots = self.index.read().expect("snapshot index lock poisoned").clone();
        snapshots.sort_by_key(|s| s.taken_at);
        snapshots
    }

    /// Selects a snapshot by `(capsule id, taken_at)`.
    pub fn get(&self, capsule_id: &str, taken_at: DateTime<Utc>) -> Result<Snapshot> {
        self.index
            .read()
            .expect("snapshot index lock poisoned")
            .iter()
            .find(|s| s.capsule_id == capsule_id && s.taken_at == taken_at)
            .cloned()
            .ok_or_else(|| Error::InvalidCheckpoint {
                capsule: capsule_id.to_string(),
                reason: format!("no snapshot at {taken_at}"),
            })
    }

    /// Deletes a snapshot record from the index.
    ///
    /// The blobs stay until the next GC; the record digest simply
    /// stops being a root.
    pub fn delete(&self, capsule_id: &str, taken_at: DateTime<Utc>) -> Result<()> {
        let mut index = self.index.write().expect("snapshot index lock poisoned");
        let before = index.len();
        index.retain(|s| !(s.capsule_id == capsule_id && s.taken_at == taken_at));
        if index.len() == before {
            return Err(Error::InvalidCheckpoint {
                capsule: capsule_id.to_string(),
                reason: format!("no snapshot at {taken_at}"),
            });
        }
        debug!(capsule = %capsule_id, %taken_at, "snapshot deleted");
        Ok(())
    }

    /// Record digests of every indexed snapshot (GC roots).
    pub fn roots(&self) -> Vec<Digest> {
        self.index
            .read()
            .expect("snapshot index lock poisoned")
            .iter()
            .map(|s| s.record_digest)
            .collect()
    }

    /// Restores a snapshot into `runtime`, preserving the capsule id.
    ///
    /// The filesystem is materialized from the archive, the capsule is
    /// recreated from the config embedded in the snapshot, and runtime
    /// state reinstatement is attempted through the engine. A host
    /// without checkpoint support restarts the entrypoint on the
    /// restored filesystem and reports that as a warning.
    pub async fn restore(&self, runtime: &CapsuleRuntime, snapshot: &Snapshot) -> Result<CapsuleId> {
        let config: CapsuleConfig = snapshot
            .metadata
            .get("capsule_config")
            .ok_or_else(|| Error::InvalidCheckpoint {
                capsule: snapshot.capsule_id.clone(),
                reason: "snapshot carries no capsule config".to_string(),
            })
            .and_then(|raw| {
                serde_json::from_str(raw).map_err(|e| Error::StateCorrupted(format!("embedded config: {e}")))
            })?;

        let fs_archive = self.load_data_blob(&snapshot.filesystem_digest, FILESYSTEM_SNAPSHOT_HEADER)?;
        let memory = self.load_data_blob(&snapshot.memory_digest, MEMORY_DUMP_HEADER)?;

        let id = CapsuleId::from_existing(&snapshot.capsule_id);
        // An older incarnation under the same id must be gone first.
        if runtime.inspect(&id).is_some() {
            runtime.remove(&id)?;
        }

        let manifest = empty_manifest(&self.store)?;
        runtime.create_with_id(id.clone(), config, &manifest)?;

        let rootfs = runtime.capsule_dir(&id).join("rootfs");
        {
            let filesystem = Arc::clone(&self.filesystem);
            let rootfs = rootfs.clone();
            tokio::task::spawn_blocking(move || filesystem.materialize(&fs_archive, &rootfs))
                .await
                .map_err(|e| Error::RestoreFailed {
                    capsule: snapshot.capsule_id.clone(),
                    reason: format!("materialize task aborted: {e}"),
                })??;
        }

        runtime.start(&id).await?;

        if let Some(capsule) = runtime.inspect(&id) {
            if let Err(e) = self
                .engine
                .reinstate(&capsule, &memory, &snapshot.network_state, &snapshot.process_state)
                .await
            {
                warn!(capsule = %id.short(), error = %e, "runtime state reinstatement degraded");
            }
        }

        info!(capsule = %id.short(), record = %snapshot.record_digest, "snapshot restored");
        Ok(id)
    }

    /// Instant rollback to `(capsule id, taken_at)`.
    ///
    /// A fresh backup snapshot is taken before the destructive stop so
    /// the rollback itself can be undone.
    pub async fn rollback(
        &self,
        runtime: &CapsuleRuntime,
        capsule_id: &str,
        taken_at: DateTime<Utc>,
    ) -> Result<(CapsuleId, Snapshot)> {
        let target = self.get(capsule_id, taken_at)?;

        let id = CapsuleId::from_existing(capsule_id);
        let mut backup_meta = BTreeMap::new();
        backup_meta.insert("trigger".to_string(), "rollback-backup".to_string());
        let backup = self.take(runtime, &id, backup_meta).await?;

        runtime.stop(&id, None).await?;
        let restored = self.restore(runtime, &target).await?;

        info!(capsule = %capsule_id, backup = %backup.record_digest, "rollback complete");
        Ok((restored, backup))
    }

    /// Resolves a metadata blob's `data:` digest and loads the bytes.
    fn load_data_blob(&self, metadata_digest: &Digest, expected_header: &str) -> Result<Vec<u8>> {
        let metadata = self.store.get(metadata_digest)?;
        let text = String::from_utf8_lossy(&metadata);
        let mut lines = text.lines();
        if lines.next() != Some(expected_header) {
            return Err(Error::StateCorrupted(format!(
                "blob {metadata_digest} is not a {expected_header} record"
            )));
        }
        let data_digest = lines
            .filter_map(|l| l.strip_prefix("data:"))
            .next()
            .ok_or_else(|| Error::StateCorrupted(format!("{expected_header} record missing data digest")))?;
        self.store.get(&data_digest.parse()?)
    }
}

/// Layerless manifest used when a rootfs comes from a snapshot
/// archive instead of image layers.
fn empty_manifest(store: &ContentStore) -> Result<ImageManifest> {
    let config_digest = store.put(b"{}", ObjectKind::Config)?;
    let record = serde_json::json!({
        "name": "snapshot-restore",
        "tag": "none",
        "layers": [],
        "config_digest": config_digest,
    });
    let digest = store.put(&serde_json::to_vec(&record)?, ObjectKind::Manifest)?;
    Ok(ImageManifest {
        name: "snapshot-restore".to_string(),
        tag: "none".to_string(),
        digest,
        layers: Vec::new(),
        config_digest,
    })
}
