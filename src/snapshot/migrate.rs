//! Live migration.
//!
//! Pipeline: pre-copy memory while the source runs, pause the source
//! via the cgroup freezer, take a final snapshot of the now-stable
//! state, transfer it (content addressing makes repeat transfers
//! delta-only), restore on the target, verify, then tear down the
//! source.
//!
//! At-most-one-live holds under every outcome: the source is frozen
//! before the target starts and is destroyed only after verification;
//! on failure the target restoration is discarded before the source
//! thaws.

use crate::capsule::{CapsuleId, CapsuleRuntime};
use crate::constants::MAX_PRECOPY_ROUNDS;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::snapshot::{Snapshot, SnapshotManager};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Health verification applied to a restored capsule.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// True when the capsule looks healthy and steady.
    async fn healthy(&self, runtime: &CapsuleRuntime, id: &CapsuleId) -> bool;
}

/// Probe that accepts any running capsule.
pub struct RunningProbe;

#[async_trait]
impl HealthProbe for RunningProbe {
    async fn healthy(&self, runtime: &CapsuleRuntime, id: &CapsuleId) -> bool {
        runtime
            .inspect(id)
            .map(|c| c.state == crate::capsule::CapsuleState::Running)
            .unwrap_or(false)
    }
}

/// Result of a completed migration.
#[derive(Debug)]
pub struct MigrationOutcome {
    pub capsule_id: String,
    pub snapshot: Snapshot,
    pub precopy_rounds: usize,
    /// Bytes moved in the final transfer (deltas only).
    pub transferred_bytes: u64,
}

/// Drives migrations between two runtimes.
pub struct MigrationCoordinator {
    source: Arc<SnapshotManager>,
    target: Arc<SnapshotManager>,
}

impl MigrationCoordinator {
    pub fn new(source: Arc<SnapshotManager>, target: Arc<SnapshotManager>) -> Self {
        Self { source, target }
    }

    /// Migrates a capsule from `source_runtime` to `target_runtime`.
    pub async fn migrate(
        &self,
        source_runtime: &CapsuleRuntime,
        target_runtime: &CapsuleRuntime,
        id: &CapsuleId,
        probe: &dyn HealthProbe,
    ) -> Result<MigrationOutcome> {
        let capsule = source_runtime.inspect(id).ok_or_else(|| Error::SnapshotFailed {
            capsule: id.to_string(),
            reason: "unknown capsule".to_string(),
        })?;

        // Phase 1: pre-copy. Iteratively push the memory image while
        // the source keeps running; stop early once two consecutive
        // dumps hash identically.
        let mut rounds = 0usize;
        let mut previous: Option<Digest> = None;
        if capsule.state.is_live() && capsule.pid.is_some() {
            for round in 0..MAX_PRECOPY_ROUNDS {
                rounds = round + 1;
                let memory = match self.source_engine_capture(source_runtime, id).await {
                    Ok(memory) => memory,
                    Err(e) => {
                        debug!(capsule = %id.short(), error = %e, "pre-copy capture unavailable");
                        break;
                    }
                };
                let digest = Digest::of_bytes(&memory);
                self.target
                    .store()
                    .put(&memory, crate::digest::ObjectKind::Capsule)?;
                if previous == Some(digest) {
                    debug!(capsule = %id.short(), rounds, "memory stable, pre-copy done");
                    break;
                }
                previous = Some(digest);
            }
        }

        // Phase 2: pause the source. It stays frozen until the
        // migration either commits or aborts.
        let was_running = capsule.state == crate::capsule::CapsuleState::Running;
        if was_running {
            source_runtime.pause(id)?;
        }

        // Phase 3: final snapshot of the stable state.
        let mut metadata = BTreeMap::new();
        metadata.insert("trigger".to_string(), "live-migration".to_string());
        let snapshot = match self.source.take(source_runtime, id, metadata).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.abort_resume(source_runtime, id, was_running);
                return Err(e);
            }
        };

        // Phase 4: transfer. Only blobs the target does not already
        // hold move, so pre-copied memory makes this the delta.
        let transferred_bytes = match self.transfer(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.abort_resume(source_runtime, id, was_running);
                return Err(Error::NetworkTransferFailed(e.to_string()));
            }
        };

        // Phase 5: restore on the target and verify.
        let restored = match self.target.restore(target_runtime, &snapshot).await {
            Ok(restored) => restored,
            Err(e) => {
                self.abort_resume(source_runtime, id, was_running);
                return Err(e);
            }
        };

        if !probe.healthy(target_runtime, &restored).await {
            warn!(capsule = %id.short(), "target failed verification, resuming source");
            let _ = target_runtime.stop(&restored, None).await;
            let _ = target_runtime.remove(&restored);
            self.abort_resume(source_runtime, id, was_running);
            return Err(Error::RestoreFailed {
                capsule: id.to_string(),
                reason: "target capsule failed health verification".to_string(),
            });
        }

        // Phase 6: tear down the source. Only now do two copies stop
        // existing; the frozen source never served traffic.
        source_runtime.stop(id, None).await?;
        source_runtime.remove(id)?;

        info!(
            capsule = %id.short(),
            rounds,
            transferred = transferred_bytes,
            "live migration complete"
        );
        Ok(MigrationOutcome {
            capsule_id: id.to_string(),
            snapshot,
            precopy_rounds: rounds,
            transferred_bytes,
        })
    }

    async fn source_engine_capture(&self, runtime: &CapsuleRuntime, id: &CapsuleId) -> Result<Vec<u8>> {
        let capsule = runtime.inspect(id).ok_or_else(|| Error::SnapshotFailed {
            capsule: id.to_string(),
            reason: "capsule vanished during pre-copy".to_string(),
        })?;
        self.source.engine().capture_memory(&capsule).await
    }

    /// Copies the snapshot's blobs into the target store, skipping
    /// anything already present.
    fn transfer(&self, snapshot: &Snapshot) -> Result<u64> {
        let mut moved = 0u64;
        let mut queue = vec![
            snapshot.record_digest,
            snapshot.memory_digest,
            snapshot.filesystem_digest,
        ];
        while let Some(digest) = queue.pop() {
            if self.target.store().contains(&digest) {
                continue;
            }
            let data = self.source.store().get(&digest)?;
            // Metadata blobs reference their data blobs by digest.
            for line in String::from_utf8_lossy(&data).lines() {
                if let Some(value) = line.strip_prefix("data:")
                    && let Ok(referenced) = value.parse::<Digest>()
                {
                    queue.push(referenced);
                }
            }
            let kind = self
                .source
                .store()
                .stat(&digest)
                .map(|info| info.kind)
                .unwrap_or(crate::digest::ObjectKind::Capsule);
            moved += data.len() as u64;
            self.target.store().put(&data, kind)?;
        }
        Ok(moved)
    }

    fn abort_resume(&self, runtime: &CapsuleRuntime, id: &CapsuleId, was_running: bool) {
        if was_running {
            if let Err(e) = runtime.resume(id) {
                warn!(capsule = %id.short(), error = %e, "source resume after abort failed");
            }
        }
    }
}
