//! # Cluster Manager
//!
//! Tracks nodes and their capacities, elects a leader, schedules
//! capsules against resource headroom, and reacts to heartbeat
//! failures by rescheduling orphaned assignments.
//!
//! Capsules are never owned here: the cluster holds weak references
//! (assignments) addressed by capsule id; the host runtime owns the
//! kernel objects.

mod manager;
mod node;

pub use manager::{ClusterManager, Constraints, MigrationCandidate, PlacementPolicy};
pub use node::{CapsuleAssignment, Node, NodeState, ResourceVector};
