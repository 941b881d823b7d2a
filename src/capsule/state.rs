//! Capsule identity and state machine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

// =============================================================================
// Capsule ID
// =============================================================================

/// Unique capsule identifier.
///
/// Random, URL-safe, well over the required 32 bits of entropy: the
/// hyphen-free form of a v4 UUID. Doubles as the capsule's default
/// hostname, so it stays within hostname length limits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CapsuleId(String);

impl CapsuleId {
    /// Allocates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wraps an existing id (snapshot restore preserves ids).
    pub fn from_existing(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for CapsuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// State Machine
// =============================================================================

/// Capsule lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapsuleState {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl CapsuleState {
    /// Whether the state machine permits `self → next`.
    pub fn can_transition(self, next: CapsuleState) -> bool {
        use CapsuleState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Paused)
                | (Running, Stopping)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }

    /// True for states in which the init process may be alive.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            CapsuleState::Starting | CapsuleState::Running | CapsuleState::Paused | CapsuleState::Stopping
        )
    }
}

impl fmt::Display for CapsuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CapsuleState::Created => "created",
            CapsuleState::Starting => "starting",
            CapsuleState::Running => "running",
            CapsuleState::Paused => "paused",
            CapsuleState::Stopping => "stopping",
            CapsuleState::Stopped => "stopped",
            CapsuleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Capsule Record
// =============================================================================

/// A capsule as tracked by its host runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capsule {
    pub id: CapsuleId,
    pub hostname: String,
    pub rootfs: PathBuf,
    pub working_dir: PathBuf,
    pub user: String,
    pub env: BTreeMap<String, String>,
    /// `source:target` pairs as mounted.
    pub mounts: Vec<(PathBuf, PathBuf)>,
    /// Cgroup directory, present once resources are set up.
    pub cgroup_path: Option<PathBuf>,
    /// Init process pid while live.
    pub pid: Option<u32>,
    pub state: CapsuleState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_random_and_urlsafe() {
        let a = CapsuleId::generate();
        let b = CapsuleId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(a.as_str().len() >= 8);
    }

    #[test]
    fn lifecycle_transitions() {
        use CapsuleState::*;
        assert!(Created.can_transition(Starting));
        assert!(Starting.can_transition(Running));
        assert!(Running.can_transition(Paused));
        assert!(Paused.can_transition(Running));
        assert!(Running.can_transition(Stopping));
        assert!(Stopping.can_transition(Stopped));
        // No resurrection and no skipping.
        assert!(!Stopped.can_transition(Running));
        assert!(!Created.can_transition(Running));
        assert!(!Failed.can_transition(Starting));
    }
}
