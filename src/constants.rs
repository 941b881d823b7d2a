//! Constants for the platform core.
//!
//! All limits, timeouts, defaults, and well-known names live here to
//! keep magic numbers out of the subsystem modules.

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum image reference length (bytes).
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single image layer (512 MiB).
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum total rootfs size after extraction (4 GiB).
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of layers in an image.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest blob size (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum capsule hostname length (bytes).
pub const MAX_HOSTNAME_LEN: usize = 64;

/// Maximum memory image size captured per snapshot (8 GiB).
pub const MAX_MEMORY_IMAGE_SIZE: u64 = 8 * 1024 * 1024 * 1024;

// =============================================================================
// Timeouts & Intervals
// =============================================================================

/// Timeout for image pull operations.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default grace period between SIGTERM and SIGKILL on capsule stop.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Heartbeat interval for cluster nodes.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A node is considered failed after this long without a heartbeat.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a single build command execution.
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(3600);

/// Timeout for one fabric request/response exchange.
pub const FABRIC_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval at which the rebalancer examines cluster utilization.
pub const REBALANCE_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// TTLs
// =============================================================================

/// TTL for service records in the resolver cache.
pub const SERVICE_RECORD_TTL: Duration = Duration::from_secs(300);

/// TTL for records learned from remote peers.
pub const REMOTE_RECORD_TTL: Duration = Duration::from_secs(60);

/// TTL for control records (node addresses, aliases).
pub const CONTROL_RECORD_TTL: Duration = Duration::from_secs(86_400);

/// TTL for registry entries refreshed by heartbeat.
pub const REGISTRY_ENTRY_TTL: Duration = Duration::from_secs(90);

// =============================================================================
// Network Defaults
// =============================================================================

/// Default fabric bind port.
pub const DEFAULT_FABRIC_PORT: u16 = 4433;

/// Default resolver port.
pub const DEFAULT_RESOLVER_PORT: u16 = 5353;

/// Default bridge network subnet for projects that declare none.
pub const DEFAULT_BRIDGE_SUBNET: &str = "10.89.0.0/24";

/// Default bridge network gateway.
pub const DEFAULT_BRIDGE_GATEWAY: &str = "10.89.0.1";

/// Per-peer bound on queued outbound fabric messages.
pub const MAX_PEER_SEND_QUEUE: usize = 256;

/// Size of a per-service symmetric key in bytes.
pub const SERVICE_KEY_LEN: usize = 32;

/// ALPN protocol identifier for fabric connections.
pub const FABRIC_ALPN: &[u8] = b"strato/1";

// =============================================================================
// Registry Defaults
// =============================================================================

/// Registry assumed when a reference carries no registry host.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag assumed when a reference carries none.
pub const DEFAULT_TAG: &str = "latest";

/// Namespace inserted for bare single-segment names on the default registry.
pub const DEFAULT_REPOSITORY_NAMESPACE: &str = "library";

// =============================================================================
// Storage Layout
// =============================================================================

/// Platform state directory under the user's home.
pub const PLATFORM_DIR: &str = ".strato";

/// Subdirectory for content-addressed objects.
pub const OBJECTS_DIR: &str = "objects";

/// Subdirectory for in-flight object writes.
pub const TMP_DIR: &str = "tmp";

/// Subdirectory for capsule state and rootfs trees.
pub const CAPSULES_DIR: &str = "capsules";

/// Subdirectory for build workspaces.
pub const BUILDS_DIR: &str = "builds";

/// Subdirectory for named volumes.
pub const VOLUMES_DIR: &str = "volumes";

/// Cgroup v2 mount point.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Cgroup subtree that holds capsule cgroups.
pub const CGROUP_SUBTREE: &str = "strato.slice";

// =============================================================================
// Snapshot Metadata Headers
// =============================================================================

/// Header line of a build-output manifest blob.
pub const BUILD_OUTPUTS_HEADER: &str = "BUILD_OUTPUTS_v1";

/// Header line of a filesystem snapshot metadata blob.
pub const FILESYSTEM_SNAPSHOT_HEADER: &str = "FILESYSTEM_SNAPSHOT_v1";

/// Header line of a memory dump metadata blob.
pub const MEMORY_DUMP_HEADER: &str = "MEMORY_DUMP_v1";

// =============================================================================
// Scheduling Thresholds
// =============================================================================

/// Per-core utilization above which a node is overloaded.
pub const OVERLOAD_THRESHOLD: f64 = 0.8;

/// Per-core utilization below which a node may receive migrations.
pub const MIGRATION_TARGET_THRESHOLD: f64 = 0.5;

/// Pre-copy rounds attempted before pausing the source capsule.
pub const MAX_PRECOPY_ROUNDS: usize = 4;

// =============================================================================
// Build Environment
// =============================================================================

/// PATH exposed inside deterministic build environments.
pub const BUILD_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Environment variables allowed through into build environments.
pub const BUILD_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TZ", "SOURCE_DATE_EPOCH"];

// =============================================================================
// Validation
// =============================================================================

/// Valid characters for capsule and service names.
pub const NAME_VALID_CHARS: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Checks a capsule/service name against the allowed character set.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 128 && name.chars().all(|c| NAME_VALID_CHARS.contains(c))
}
