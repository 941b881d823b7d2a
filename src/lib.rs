//! # strato
//!
//! **Container platform core: capsules, content addressing, and an
//! encrypted service fabric.**
//!
//! This crate is the hard core of the strato platform: an OCI-style
//! capsule runtime, the Surge declarative orchestrator, a
//! content-addressed object store with a deterministic build cache, a
//! snapshot/live-migration engine, and a cluster scheduler, glued
//! together by a QUIC service fabric.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Surge (surge)                           │
//! │   project spec → networks/volumes → dependency-ordered capsules  │
//! ├──────────────┬───────────────┬───────────────┬──────────────────┤
//! │ ImageStore   │ Builder       │ ClusterManager│ QuotaManager     │
//! │ (image)      │ (build)       │ (cluster)     │ (quota)          │
//! ├──────────────┴───────┬───────┴───────┬───────┴──────────────────┤
//! │   ContentStore (store)               │ CapsuleRuntime (capsule) │
//! │   blobs by sha256, atomic writes     │ namespaces, cgroups v2   │
//! ├──────────────────────────────────────┼──────────────────────────┤
//! │ SnapshotManager + MigrationCoordinator (snapshot)               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Fabric (fabric): QUIC transport · service registry · resolver   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ownership Model
//!
//! - The content store exclusively owns blob bytes; images, builds,
//!   and snapshots hold digests only.
//! - The capsule runtime owns kernel objects (namespaces, mounts,
//!   cgroups) for each capsule's lifetime and releases them on every
//!   exit path.
//! - The cluster manager owns node records and holds capsules only as
//!   weak assignment references by id.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strato::{OciRegistryClient, ProjectSpec, Surge};
//!
//! #[tokio::main]
//! async fn main() -> strato::Result<()> {
//!     let surge = Surge::new("/var/lib/strato", Arc::new(OciRegistryClient::new()))?;
//!     let project = ProjectSpec::load("project.toml")?;
//!
//!     match surge.up(&project).await {
//!         Ok(report) => println!("started {} capsules", report.started.len()),
//!         Err(e) => std::process::exit(e.exit_code()),
//!     }
//!     Ok(())
//! }
//! ```

// =============================================================================
// Modules
// =============================================================================

pub mod build;
pub mod capsule;
pub mod cluster;
mod constants;
pub mod digest;
pub mod error;
pub mod fabric;
pub mod image;
pub mod quota;
pub mod snapshot;
pub mod store;
pub mod surge;

// =============================================================================
// Public Surface
// =============================================================================

pub use build::{
    BuildCache, BuildCacheEntry, BuildInput, BuildOptions, BuildOutput, BuildResult, BuildSpec, Builder,
    OutputDecl,
};
pub use capsule::{
    Capsule, CapsuleConfig, CapsuleId, CapsuleRuntime, CapsuleState, CgroupController, DeviceSpec,
    ExecOutcome, Mount, PortMapping, ResourceLimits,
};
pub use cluster::{
    CapsuleAssignment, ClusterManager, Constraints, MigrationCandidate, Node, NodeState, PlacementPolicy,
    ResourceVector,
};
pub use digest::{Digest, DigestAlgorithm, ObjectKind};
pub use error::{Error, Result};
pub use fabric::{
    ControlMessage, Envelope, Fabric, FabricConfig, FabricEvent, Frame, PeerInfo, Record, Resolver,
    ServiceEndpoint, ServiceKey, ServiceRegistry, Transport,
};
pub use image::{
    ImageManifest, ImageReference, ImageStore, LayerDesc, OciRegistryClient, RegistryClient, RemoteImage,
};
pub use quota::{Quota, QuotaLimit, QuotaManager, QuotaScope, QuotaWarning, ResourceKind};
pub use snapshot::{
    CheckpointEngine, ConnectionState, FdEntry, HealthProbe, InMemoryCheckpointEngine, InterfaceState,
    MigrationCoordinator, MigrationOutcome, NamedSnapshotSpec, NetworkState, OperationTrigger,
    PolicyEngine, ProcCheckpointEngine, ProcessRecord, ProcessState, RetentionPolicy, RunningProbe,
    Snapshot, SnapshotFilesystem, SnapshotManager, SnapshotTriggers, TarSnapshotter, ThreadState,
    WatchConfig,
};
pub use store::{ContentStore, GcStats, ObjectInfo};
pub use surge::{
    HealthCheck, NetworkRecord, NetworkSpec, NetworkType, ProjectSpec, ResolverConfig, RestartPolicy,
    ServiceInstance, ServiceResources, ServiceSpec, ServiceStatus, SnapshotFilesystemKind,
    SnapshotsConfig, Surge, TcpProbe, UpReport, VolumeSpec,
};

/// Re-exported constants callers commonly need (default ports, limits).
pub mod limits {
    pub use crate::constants::{
        DEFAULT_FABRIC_PORT, DEFAULT_RESOLVER_PORT, DEFAULT_STOP_GRACE, HEARTBEAT_TIMEOUT,
        MAX_LAYER_SIZE, MAX_LAYERS, MAX_ROOTFS_SIZE,
    };
}
