//! Node records and resource accounting.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// Node State
// =============================================================================

/// Membership state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Registered, no successful heartbeat yet.
    Joining,
    /// Heartbeating and schedulable.
    Active,
    /// Finishing existing work, refusing new placements.
    Draining,
    /// Heartbeat timeout elapsed.
    Failed,
    /// Operator-imposed, not schedulable.
    Maintenance,
}

impl NodeState {
    /// Whether the scheduler may place new capsules here.
    pub fn schedulable(self) -> bool {
        matches!(self, NodeState::Active)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Joining => "joining",
            NodeState::Active => "active",
            NodeState::Draining => "draining",
            NodeState::Failed => "failed",
            NodeState::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Resources
// =============================================================================

/// A point in resource space: cores, GiB of memory and storage, Mbps.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub bw_mbps: f64,
}

impl ResourceVector {
    pub fn new(cpu_cores: f64, memory_gb: f64, storage_gb: f64) -> Self {
        Self {
            cpu_cores,
            memory_gb,
            storage_gb,
            bw_mbps: 0.0,
        }
    }

    /// Component-wise `self + other`.
    pub fn plus(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_cores: self.cpu_cores + other.cpu_cores,
            memory_gb: self.memory_gb + other.memory_gb,
            storage_gb: self.storage_gb + other.storage_gb,
            bw_mbps: self.bw_mbps + other.bw_mbps,
        }
    }

    /// Component-wise `self - other`, clamped at zero.
    pub fn minus(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_cores: (self.cpu_cores - other.cpu_cores).max(0.0),
            memory_gb: (self.memory_gb - other.memory_gb).max(0.0),
            storage_gb: (self.storage_gb - other.storage_gb).max(0.0),
            bw_mbps: (self.bw_mbps - other.bw_mbps).max(0.0),
        }
    }

    /// Whether every component of `need` fits into `self`.
    pub fn fits(&self, need: &ResourceVector) -> bool {
        self.cpu_cores >= need.cpu_cores
            && self.memory_gb >= need.memory_gb
            && self.storage_gb >= need.storage_gb
            && self.bw_mbps >= need.bw_mbps
    }

    /// Compact `key=value` form carried in heartbeat messages.
    pub fn render(&self) -> String {
        format!(
            "cpu={:.2},memory={:.2},storage={:.2},bandwidth={:.2}",
            self.cpu_cores, self.memory_gb, self.storage_gb, self.bw_mbps
        )
    }

    /// Parses the [`render`](Self::render) form; unknown keys ignored.
    pub fn parse(s: &str) -> Self {
        let mut vector = ResourceVector::default();
        for pair in s.split(',') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<f64>() else {
                continue;
            };
            match key {
                "cpu" => vector.cpu_cores = value,
                "memory" => vector.memory_gb = value,
                "storage" => vector.storage_gb = value,
                "bandwidth" => vector.bw_mbps = value,
                _ => {}
            }
        }
        vector
    }
}

// =============================================================================
// Assignments
// =============================================================================

/// Weak reference from the cluster to a capsule: the node owns the
/// record, the capsule itself lives only on its host runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleAssignment {
    pub capsule_id: String,
    pub node_id: String,
    pub resources: ResourceVector,
}

// =============================================================================
// Node
// =============================================================================

/// A cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub state: NodeState,
    pub capacity: ResourceVector,
    pub usage: ResourceVector,
    pub last_heartbeat_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub assignments: Vec<CapsuleAssignment>,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16, capacity: ResourceVector) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            state: NodeState::Joining,
            capacity,
            usage: ResourceVector::default(),
            last_heartbeat_at: chrono::Utc::now(),
            labels: BTreeMap::new(),
            assignments: Vec::new(),
        }
    }

    /// Headroom left for new placements.
    pub fn available(&self) -> ResourceVector {
        self.capacity.minus(&self.usage)
    }

    /// Whether this node can take a capsule of the given size now.
    pub fn can_schedule(&self, need: &ResourceVector) -> bool {
        self.state.schedulable() && self.available().fits(need)
    }

    /// Per-core CPU utilization in `[0, 1]`.
    pub fn cpu_utilization(&self) -> f64 {
        if self.capacity.cpu_cores <= 0.0 {
            return 0.0;
        }
        self.usage.cpu_cores / self.capacity.cpu_cores
    }

    /// Variance of the (cpu, memory, storage) utilizations.
    ///
    /// Low variance means the node is evenly loaded across dimensions;
    /// the resource-balanced policy minimizes this after placement.
    pub fn utilization_variance(&self) -> f64 {
        let utils = [
            ratio(self.usage.cpu_cores, self.capacity.cpu_cores),
            ratio(self.usage.memory_gb, self.capacity.memory_gb),
            ratio(self.usage.storage_gb, self.capacity.storage_gb),
        ];
        let mean = utils.iter().sum::<f64>() / utils.len() as f64;
        utils.iter().map(|u| (u - mean).powi(2)).sum::<f64>() / utils.len() as f64
    }

    /// Records an assignment, keeping usage equal to the assignment sum.
    pub fn assign(&mut self, assignment: CapsuleAssignment) {
        self.usage = self.usage.plus(&assignment.resources);
        self.assignments.push(assignment);
    }

    /// Drops an assignment by capsule id, returning it.
    pub fn unassign(&mut self, capsule_id: &str) -> Option<CapsuleAssignment> {
        let index = self.assignments.iter().position(|a| a.capsule_id == capsule_id)?;
        let assignment = self.assignments.remove(index);
        self.usage = self.usage.minus(&assignment.resources);
        Some(assignment)
    }

    /// Whether any of the listed capsules run here (anti-affinity).
    pub fn hosts_any(&self, capsule_ids: &[String]) -> bool {
        self.assignments
            .iter()
            .any(|a| capsule_ids.iter().any(|id| *id == a.capsule_id))
    }
}

fn ratio(used: f64, capacity: f64) -> f64 {
    if capacity <= 0.0 { 0.0 } else { used / capacity }
}
