//! Error types for the platform core.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for platform operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the platform core.
///
/// Operational failures are returned as values; invariant violations
/// panic with a diagnostic. Recoverable kinds (`CacheMiss`,
/// `HashMismatch`, image `NotFound`) are handled at the layer that can
/// retry; permission, quota, and configuration errors surface to the
/// caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Content Store Errors
    // =========================================================================
    /// Object not present in the content store.
    #[error("object not found: {digest}")]
    NotFound { digest: String },

    /// Stored bytes no longer hash to their digest.
    #[error("hash mismatch for {digest}: stored bytes hash to {actual}")]
    HashMismatch { digest: String, actual: String },

    /// Content that cannot be stored (bad digest form, oversized, ...).
    #[error("invalid content: {0}")]
    InvalidContent(String),

    /// Underlying storage I/O failure.
    #[error("storage error at {path}: {reason}")]
    StorageError { path: PathBuf, reason: String },

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// Image reference did not resolve to a manifest.
    #[error("image not found: {reference}")]
    ImageNotFound { reference: String },

    /// Manifest or reference failed validation.
    #[error("invalid image format for '{reference}': {reason}")]
    InvalidImageFormat { reference: String, reason: String },

    /// The registry rejected or failed the request.
    #[error("registry error for '{reference}': {reason}")]
    RegistryError { reference: String, reason: String },

    /// Transport-level failure while talking to a registry.
    #[error("network error: {0}")]
    NetworkError(String),

    // =========================================================================
    // Build Errors
    // =========================================================================
    /// Build spec failed validation before fingerprinting.
    #[error("invalid build spec '{name}': {reason}")]
    InvalidBuildSpec { name: String, reason: String },

    /// A declared build input digest does not resolve.
    #[error("build dependency not found: {digest}")]
    DependencyNotFound { digest: String },

    /// The build command exited non-zero.
    #[error("build '{name}' failed: {reason}")]
    BuildFailed { name: String, reason: String },

    /// No cache entry for the fingerprint.
    #[error("build cache miss for fingerprint {fingerprint}")]
    CacheMiss { fingerprint: String },

    /// A collected output failed validation.
    #[error("build output validation failed: {0}")]
    ValidationFailed(String),

    /// A reproducible build produced differing outputs on replay.
    #[error("non-deterministic build '{name}': output '{output}' differs between passes")]
    NonDeterministic { name: String, output: String },

    // =========================================================================
    // Capsule Errors
    // =========================================================================
    /// Namespace creation (unshare/clone) failed.
    #[error("namespace creation failed for capsule '{id}': {reason}")]
    NamespaceCreationFailed { id: String, reason: String },

    /// Cgroup directory or controller file could not be set up.
    #[error("cgroup creation failed at {path}: {reason}")]
    CgroupCreationFailed { path: PathBuf, reason: String },

    /// A mount inside the capsule failed.
    #[error("mount failed ({target}): {reason}")]
    MountFailed { target: String, reason: String },

    /// The entrypoint could not be executed.
    #[error("exec failed in capsule '{id}': {reason}")]
    ExecFailed { id: String, reason: String },

    /// Capsule configuration rejected before any kernel object exists.
    #[error("invalid capsule configuration: {0}")]
    InvalidConfiguration(String),

    /// The operation requires privileges the runtime does not hold.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // =========================================================================
    // Fabric Errors
    // =========================================================================
    /// Connection establishment or send-queue overflow.
    #[error("connection failed to {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    /// Message could not be sealed or opened under the service key.
    #[error("encryption failed for service '{service}': {reason}")]
    EncryptionFailed { service: String, reason: String },

    /// Name did not resolve through any resolution stage.
    #[error("service discovery failed for '{name}'")]
    ServiceDiscoveryFailed { name: String },

    // =========================================================================
    // Snapshot & Migration Errors
    // =========================================================================
    /// Snapshot capture failed.
    #[error("snapshot of capsule '{capsule}' failed: {reason}")]
    SnapshotFailed { capsule: String, reason: String },

    /// Restore from a snapshot failed.
    #[error("restore of capsule '{capsule}' failed: {reason}")]
    RestoreFailed { capsule: String, reason: String },

    /// Snapshot transfer between nodes failed.
    #[error("snapshot transfer failed: {0}")]
    NetworkTransferFailed(String),

    /// Captured state is internally inconsistent.
    #[error("snapshot state corrupted: {0}")]
    StateCorrupted(String),

    /// Checkpoint record failed validation on load.
    #[error("invalid checkpoint for capsule '{capsule}': {reason}")]
    InvalidCheckpoint { capsule: String, reason: String },

    /// Target host lacks resources to restore.
    #[error("resource unavailable for restore: {0}")]
    ResourceUnavailable(String),

    // =========================================================================
    // Cluster Errors
    // =========================================================================
    /// A peer node did not respond.
    #[error("node unreachable: {node}")]
    NodeUnreachable { node: String },

    /// Two nodes claim leadership.
    #[error("cluster split brain: leaders {ours} and {theirs}")]
    ClusterSplitBrain { ours: String, theirs: String },

    /// No candidate node can hold the requested resources.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// Placement failed after filtering and policy application.
    #[error("scheduling failed for capsule '{capsule}': {reason}")]
    SchedulingFailed { capsule: String, reason: String },

    /// Leadership could not be established within the deadline.
    #[error("consensus timeout after {duration:?}")]
    ConsensusTimeout { duration: Duration },

    /// Node is in the wrong state for the operation.
    #[error("node '{node}' is in state '{state}', expected '{expected}'")]
    InvalidNodeState {
        node: String,
        state: String,
        expected: String,
    },

    // =========================================================================
    // Quota Errors
    // =========================================================================
    /// Allocation would exceed a hard limit.
    #[error("quota '{quota}' exceeded: {resource} {requested} over limit {limit}")]
    QuotaExceeded {
        quota: String,
        resource: String,
        requested: u64,
        limit: u64,
    },

    /// Quota definition failed validation.
    #[error("invalid quota spec: {0}")]
    InvalidQuotaSpec(String),

    /// No quota registered under the name.
    #[error("quota not found: {0}")]
    QuotaNotFound(String),

    /// Caller may not modify the quota.
    #[error("insufficient permissions for quota '{0}'")]
    InsufficientPermissions(String),

    // =========================================================================
    // Orchestrator Errors
    // =========================================================================
    /// Project spec file absent.
    #[error("project spec not found at {path}")]
    SpecNotFound { path: PathBuf },

    /// Project spec failed schema validation.
    #[error("invalid project spec: {0}")]
    InvalidSpec(String),

    /// A service's capsule could not be started.
    #[error("service '{service}' failed to start: {reason}")]
    ServiceStartFailed { service: String, reason: String },

    /// A service's capsule could not be stopped.
    #[error("service '{service}' failed to stop: {reason}")]
    ServiceStopFailed { service: String, reason: String },

    /// Dependency graph problem (cycle or unknown service).
    #[error("dependency error: {0}")]
    DependencyError(String),

    // =========================================================================
    // Passthrough
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },
}

impl Error {
    /// Maps an error to the orchestrator's logical exit code.
    ///
    /// `0` success, `2` invalid spec, `3` dependency cycle, `4` image
    /// not found, `5` quota exceeded, `6` scheduling failed, `7` node
    /// unreachable, `1` anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::SpecNotFound { .. } | Error::InvalidSpec(_) => 2,
            Error::DependencyError(_) => 3,
            Error::ImageNotFound { .. } => 4,
            Error::QuotaExceeded { .. } => 5,
            Error::SchedulingFailed { .. } | Error::InsufficientResources(_) => 6,
            Error::NodeUnreachable { .. } => 7,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
