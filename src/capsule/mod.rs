//! # Capsule Runtime
//!
//! Runs a process tree with the strongest isolation the host permits:
//! private PID, NET, MOUNT, UTS (and optionally USER) namespaces, a
//! cgroup v2 slice with memory/CPU caps, and a rootfs assembled from
//! image layers.
//!
//! ## Lifecycle
//!
//! ```text
//!   Created ──▶ Starting ──▶ Running ──▶ Paused ──▶ Running
//!                                │
//!                                ├──▶ Stopping ──▶ Stopped
//!                                └───────────────▶ Failed
//! ```
//!
//! A capsule is owned exclusively by its host node; the cluster holds
//! only an assignment record addressed by capsule id.
//!
//! ## Cleanup Invariant
//!
//! On every exit path — success, error after partial setup, or signal —
//! all created kernel objects (namespace references, mounts, cgroup
//! directories) are released. Setup runs under a guard that unwinds
//! partial state before an error is returned.

mod cgroup;
mod config;
mod rootfs;
mod runtime;
mod state;

pub use cgroup::CgroupController;
pub use config::{CapsuleConfig, DeviceSpec, Mount, PortMapping, ResourceLimits};
pub use rootfs::extract_layers;
pub use runtime::{CapsuleRuntime, ExecOutcome};
pub use state::{Capsule, CapsuleId, CapsuleState};
