//! Membership, leadership, placement, and failure handling.
//!
//! ## Membership
//!
//! Nodes join as `Joining` and become `Active` on their first
//! heartbeat. The heartbeat timer is the only failure detector: a node
//! silent past the timeout is `Failed`, its usage is dropped, and its
//! assignments are rescheduled.
//!
//! ## Leadership
//!
//! The `Active` node with the lexicographically smallest id leads. An
//! election runs when the leader fails or when a node joins an
//! leaderless cluster. This is deliberately not partition-safe; a
//! second self-claimed leader is surfaced as `ClusterSplitBrain`
//! rather than silently merged.

use crate::cluster::node::{CapsuleAssignment, Node, NodeState, ResourceVector};
use crate::constants::{HEARTBEAT_TIMEOUT, MIGRATION_TARGET_THRESHOLD, OVERLOAD_THRESHOLD};
use crate::error::{Error, Result};
use crate::fabric::{ControlMessage, Fabric};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

// =============================================================================
// Placement Inputs
// =============================================================================

/// Placement policy applied after filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementPolicy {
    /// `index = timestamp mod candidates`.
    RoundRobin,
    /// Minimize `used_cpu / cores`.
    #[default]
    LeastLoaded,
    /// Minimize post-placement utilization variance.
    ResourceBalanced,
    /// Prefer listed nodes, else least-loaded.
    AffinityAware,
}

/// Hard placement constraints.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    /// Candidate nodes hosting any of these capsules are excluded.
    pub anti_affinity: Vec<String>,
    /// Ordered preference for `AffinityAware`.
    pub preferred_nodes: Vec<String>,
}

/// A rebalancing suggestion; the move itself is a live migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationCandidate {
    pub capsule_id: String,
    pub from: String,
    pub to: String,
}

// =============================================================================
// Cluster Manager
// =============================================================================

/// Tracks nodes, elects a leader, places capsules, reacts to failure.
pub struct ClusterManager {
    local_node_id: String,
    nodes: RwLock<HashMap<String, Node>>,
    leader: RwLock<Option<String>>,
    /// Present when deployments may be forwarded to peers.
    fabric: Option<Arc<Fabric>>,
}

impl ClusterManager {
    pub fn new(local_node_id: impl Into<String>) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            nodes: RwLock::new(HashMap::new()),
            leader: RwLock::new(None),
            fabric: None,
        }
    }

    /// Attaches the fabric used to forward remote deployments.
    pub fn with_fabric(mut self, fabric: Arc<Fabric>) -> Self {
        self.fabric = Some(fabric);
        self
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Registers a node in `Joining` state.
    pub fn register_node(&self, node: Node) {
        info!(node = %node.id, addr = %node.address, "node registered");
        self.nodes
            .write()
            .expect("node table lock poisoned")
            .insert(node.id.clone(), node);
        // A cluster without a leader elects on join.
        if self.leader().is_none() {
            self.elect_leader();
        }
    }

    /// Processes a heartbeat: refreshes liveness and usage, promotes
    /// `Joining → Active` on the first beat.
    pub fn heartbeat(&self, node_id: &str, usage: ResourceVector) -> Result<()> {
        let mut elect = false;
        {
            let mut nodes = self.nodes.write().expect("node table lock poisoned");
            let node = nodes.get_mut(node_id).ok_or_else(|| Error::NodeUnreachable {
                node: node_id.to_string(),
            })?;
            node.last_heartbeat_at = Utc::now();
            // Reported usage wins over local bookkeeping for remote nodes.
            if node_id != self.local_node_id {
                node.usage = usage;
            }
            if node.state == NodeState::Joining {
                node.state = NodeState::Active;
                info!(node = %node_id, "node active after first heartbeat");
                elect = self.leader().is_none();
            }
        }
        if elect {
            self.elect_leader();
        }
        Ok(())
    }

    /// Sweeps the heartbeat timers; nodes past the timeout fail.
    ///
    /// Returns reschedule decisions `(capsule, old node, new node)`
    /// made while handling the failures.
    pub fn check_heartbeats(&self) -> Vec<(String, String, String)> {
        let expired: Vec<String> = {
            let nodes = self.nodes.read().expect("node table lock poisoned");
            let now = Utc::now();
            nodes
                .values()
                .filter(|n| {
                    n.state == NodeState::Active
                        && (now - n.last_heartbeat_at).to_std().unwrap_or_default() > HEARTBEAT_TIMEOUT
                })
                .map(|n| n.id.clone())
                .collect()
        };

        let mut rescheduled = Vec::new();
        for node_id in expired {
            warn!(node = %node_id, "heartbeat timeout, marking failed");
            rescheduled.extend(self.handle_node_failure(&node_id));
        }
        rescheduled
    }

    /// Marks a node failed, drops its usage, reschedules its
    /// assignments least-loaded, and re-elects if it led.
    pub fn handle_node_failure(&self, node_id: &str) -> Vec<(String, String, String)> {
        let orphaned: Vec<CapsuleAssignment> = {
            let mut nodes = self.nodes.write().expect("node table lock poisoned");
            let Some(node) = nodes.get_mut(node_id) else {
                return Vec::new();
            };
            node.state = NodeState::Failed;
            node.usage = ResourceVector::default();
            std::mem::take(&mut node.assignments)
        };

        let was_leader = self.leader().as_deref() == Some(node_id);
        if was_leader {
            self.elect_leader();
        }

        let mut moves = Vec::new();
        for assignment in orphaned {
            match self.schedule(
                &assignment.capsule_id,
                &assignment.resources,
                &Constraints::default(),
                PlacementPolicy::LeastLoaded,
            ) {
                Ok(new_node) => {
                    info!(
                        capsule = %assignment.capsule_id,
                        from = %node_id,
                        to = %new_node,
                        "assignment rescheduled after node failure"
                    );
                    moves.push((assignment.capsule_id, node_id.to_string(), new_node));
                }
                Err(e) => {
                    warn!(capsule = %assignment.capsule_id, error = %e, "could not reschedule");
                }
            }
        }
        moves
    }

    /// Gracefully drains a node: no new placements, assignments moved.
    pub fn drain(&self, node_id: &str) -> Result<Vec<(String, String, String)>> {
        let orphaned: Vec<CapsuleAssignment> = {
            let mut nodes = self.nodes.write().expect("node table lock poisoned");
            let node = nodes.get_mut(node_id).ok_or_else(|| Error::NodeUnreachable {
                node: node_id.to_string(),
            })?;
            if node.state != NodeState::Active {
                return Err(Error::InvalidNodeState {
                    node: node_id.to_string(),
                    state: node.state.to_string(),
                    expected: NodeState::Active.to_string(),
                });
            }
            node.state = NodeState::Draining;
            let drained = std::mem::take(&mut node.assignments);
            node.usage = ResourceVector::default();
            drained
        };

        info!(node = %node_id, count = orphaned.len(), "draining node");
        let mut moves = Vec::new();
        for assignment in orphaned {
            let new_node = self.schedule(
                &assignment.capsule_id,
                &assignment.resources,
                &Constraints::default(),
                PlacementPolicy::LeastLoaded,
            )?;
            moves.push((assignment.capsule_id, node_id.to_string(), new_node));
        }
        Ok(moves)
    }

    // =========================================================================
    // Leadership
    // =========================================================================

    /// Current leader, if any.
    pub fn leader(&self) -> Option<String> {
        self.leader.read().expect("leader lock poisoned").clone()
    }

    /// Elects the smallest-id `Active` node.
    pub fn elect_leader(&self) -> Option<String> {
        let elected = {
            let nodes = self.nodes.read().expect("node table lock poisoned");
            nodes
                .values()
                .filter(|n| n.state == NodeState::Active)
                .map(|n| n.id.clone())
                .min()
        };
        let mut leader = self.leader.write().expect("leader lock poisoned");
        if *leader != elected {
            info!(leader = ?elected, "leader elected");
        }
        *leader = elected.clone();
        elected
    }

    /// Validates a peer's leadership claim against our view.
    ///
    /// Two live self-claimed leaders mean the membership views have
    /// diverged; surface it instead of merging silently.
    pub fn observe_leader_claim(&self, claimant: &str) -> Result<()> {
        match self.leader() {
            Some(leader) if leader != claimant => Err(Error::ClusterSplitBrain {
                ours: leader,
                theirs: claimant.to_string(),
            }),
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Places a capsule, debits the chosen node, and records the
    /// assignment. Remote placements are forwarded as a
    /// `DEPLOY_CAPSULE` control message.
    pub fn schedule(
        &self,
        capsule_id: &str,
        requirements: &ResourceVector,
        constraints: &Constraints,
        policy: PlacementPolicy,
    ) -> Result<String> {
        let chosen = {
            let nodes = self.nodes.read().expect("node table lock poisoned");
            let candidates: Vec<&Node> = nodes
                .values()
                .filter(|n| n.can_schedule(requirements))
                .filter(|n| !n.hosts_any(&constraints.anti_affinity))
                .collect();

            if candidates.is_empty() {
                return Err(Error::InsufficientResources(format!(
                    "no node can hold cpu={:.1} memory={:.1} storage={:.1}",
                    requirements.cpu_cores, requirements.memory_gb, requirements.storage_gb
                )));
            }
            Self::apply_policy(&candidates, requirements, constraints, policy).to_string()
        };

        {
            let mut nodes = self.nodes.write().expect("node table lock poisoned");
            let node = nodes.get_mut(&chosen).ok_or_else(|| Error::SchedulingFailed {
                capsule: capsule_id.to_string(),
                reason: format!("candidate {chosen} vanished during placement"),
            })?;
            // Re-check under the write lock; a racing placement may
            // have consumed the headroom.
            if !node.can_schedule(requirements) {
                return Err(Error::SchedulingFailed {
                    capsule: capsule_id.to_string(),
                    reason: format!("node {chosen} lost capacity during placement"),
                });
            }
            node.assign(CapsuleAssignment {
                capsule_id: capsule_id.to_string(),
                node_id: chosen.clone(),
                resources: *requirements,
            });
        }

        info!(capsule = %capsule_id, node = %chosen, ?policy, "capsule scheduled");

        if chosen != self.local_node_id
            && let Some(fabric) = &self.fabric
        {
            let message = ControlMessage::DeployCapsule {
                capsule_id: capsule_id.to_string(),
            };
            let peer = {
                let nodes = self.nodes.read().expect("node table lock poisoned");
                nodes.get(&chosen).map(|n| format!("{}:{}", n.address, n.port))
            };
            if let Some(peer) = peer
                && let Ok(handle) = tokio::runtime::Handle::try_current()
            {
                let fabric = Arc::clone(fabric);
                let capsule = capsule_id.to_string();
                handle.spawn(async move {
                    match peer.parse() {
                        Ok(addr) => {
                            if let Err(e) = fabric.send_control(addr, &message).await {
                                warn!(capsule = %capsule, %peer, error = %e, "deploy forward failed");
                            }
                        }
                        Err(e) => warn!(%peer, error = %e, "bad peer address"),
                    }
                });
            }
        }

        Ok(chosen)
    }

    fn apply_policy<'a>(
        candidates: &[&'a Node],
        requirements: &ResourceVector,
        constraints: &Constraints,
        policy: PlacementPolicy,
    ) -> &'a str {
        match policy {
            PlacementPolicy::RoundRobin => {
                let mut sorted: Vec<&&Node> = candidates.iter().collect();
                sorted.sort_by(|a, b| a.id.cmp(&b.id));
                let index = Utc::now().timestamp() as usize % sorted.len();
                &sorted[index].id
            }
            PlacementPolicy::LeastLoaded => {
                &candidates
                    .iter()
                    .min_by(|a, b| {
                        a.cpu_utilization()
                            .partial_cmp(&b.cpu_utilization())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .expect("candidates is non-empty")
                    .id
            }
            PlacementPolicy::ResourceBalanced => {
                &candidates
                    .iter()
                    .min_by(|a, b| {
                        let variance = |n: &Node| {
                            let mut after = (*n).clone();
                            after.usage = after.usage.plus(requirements);
                            after.utilization_variance()
                        };
                        variance(a)
                            .partial_cmp(&variance(b))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .expect("candidates is non-empty")
                    .id
            }
            PlacementPolicy::AffinityAware => {
                for preferred in &constraints.preferred_nodes {
                    if let Some(node) = candidates.iter().find(|n| n.id == *preferred) {
                        return &node.id;
                    }
                }
                Self::apply_policy(candidates, requirements, constraints, PlacementPolicy::LeastLoaded)
            }
        }
    }

    /// Releases a capsule's assignment (stop, migration teardown).
    pub fn release(&self, capsule_id: &str) {
        let mut nodes = self.nodes.write().expect("node table lock poisoned");
        for node in nodes.values_mut() {
            if node.unassign(capsule_id).is_some() {
                debug!(capsule = %capsule_id, node = %node.id, "assignment released");
                return;
            }
        }
    }

    // =========================================================================
    // Rebalancing
    // =========================================================================

    /// Finds capsules on overloaded nodes (> 0.8 per-core utilization)
    /// that fit on an underloaded node (< 0.5).
    pub fn rebalance_candidates(&self) -> Vec<MigrationCandidate> {
        let nodes = self.nodes.read().expect("node table lock poisoned");
        let mut candidates = Vec::new();

        for node in nodes.values() {
            if node.state != NodeState::Active || node.cpu_utilization() <= OVERLOAD_THRESHOLD {
                continue;
            }
            for assignment in &node.assignments {
                let target = nodes
                    .values()
                    .filter(|t| {
                        t.id != node.id
                            && t.state == NodeState::Active
                            && t.cpu_utilization() < MIGRATION_TARGET_THRESHOLD
                            && t.available().fits(&assignment.resources)
                    })
                    .min_by(|a, b| {
                        a.cpu_utilization()
                            .partial_cmp(&b.cpu_utilization())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                if let Some(target) = target {
                    candidates.push(MigrationCandidate {
                        capsule_id: assignment.capsule_id.clone(),
                        from: node.id.clone(),
                        to: target.id.clone(),
                    });
                }
            }
        }

        if !candidates.is_empty() {
            info!(count = candidates.len(), "rebalance candidates identified");
        }
        candidates
    }

    /// Moves an assignment between nodes after a completed migration.
    pub fn commit_migration(&self, capsule_id: &str, to: &str) -> Result<()> {
        let mut nodes = self.nodes.write().expect("node table lock poisoned");
        let assignment = nodes
            .values_mut()
            .find_map(|n| n.unassign(capsule_id))
            .ok_or_else(|| Error::SchedulingFailed {
                capsule: capsule_id.to_string(),
                reason: "no assignment to migrate".to_string(),
            })?;
        let target = nodes.get_mut(to).ok_or_else(|| Error::NodeUnreachable {
            node: to.to_string(),
        })?;
        target.assign(CapsuleAssignment {
            capsule_id: capsule_id.to_string(),
            node_id: to.to_string(),
            resources: assignment.resources,
        });
        info!(capsule = %capsule_id, to = %to, "migration committed");
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Snapshot of a node.
    pub fn node(&self, node_id: &str) -> Option<Node> {
        self.nodes
            .read()
            .expect("node table lock poisoned")
            .get(node_id)
            .cloned()
    }

    /// Snapshot of all nodes.
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes
            .read()
            .expect("node table lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Usage of the local node rendered for heartbeats.
    pub fn local_usage(&self) -> String {
        self.node(&self.local_node_id)
            .map(|n| n.usage.render())
            .unwrap_or_else(|| ResourceVector::default().render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_node(id: &str, cores: f64, used: f64) -> Node {
        let mut node = Node::new(id, "10.0.0.1", 4433, ResourceVector::new(cores, 64.0, 500.0));
        node.state = NodeState::Active;
        if used > 0.0 {
            node.assign(CapsuleAssignment {
                capsule_id: format!("preexisting-{id}"),
                node_id: id.to_string(),
                resources: ResourceVector::new(used, 1.0, 1.0),
            });
        }
        node
    }

    fn manager_with(nodes: Vec<Node>) -> ClusterManager {
        let manager = ClusterManager::new("n1");
        for node in nodes {
            manager.register_node(node);
        }
        manager
    }

    #[test]
    fn first_heartbeat_activates_node() {
        let manager = ClusterManager::new("n1");
        manager.register_node(Node::new("n1", "10.0.0.1", 4433, ResourceVector::new(8.0, 16.0, 100.0)));
        assert_eq!(manager.node("n1").unwrap().state, NodeState::Joining);

        manager.heartbeat("n1", ResourceVector::default()).unwrap();
        assert_eq!(manager.node("n1").unwrap().state, NodeState::Active);
        assert_eq!(manager.leader().as_deref(), Some("n1"));
    }

    #[test]
    fn leader_is_smallest_active_id() {
        let manager = manager_with(vec![
            active_node("n3", 8.0, 0.0),
            active_node("n1", 8.0, 0.0),
            active_node("n2", 8.0, 0.0),
        ]);
        assert_eq!(manager.elect_leader().as_deref(), Some("n1"));

        manager.handle_node_failure("n1");
        assert_eq!(manager.leader().as_deref(), Some("n2"));
    }

    #[test]
    fn least_loaded_prefers_idle_node() {
        let manager = manager_with(vec![
            active_node("n1", 8.0, 7.0),
            active_node("n2", 8.0, 0.0),
            active_node("n3", 8.0, 0.0),
        ]);

        let chosen = manager
            .schedule(
                "c1",
                &ResourceVector::new(2.0, 2.0, 5.0),
                &Constraints::default(),
                PlacementPolicy::LeastLoaded,
            )
            .unwrap();
        assert_ne!(chosen, "n1");
    }

    #[test]
    fn anti_affinity_excludes_hosting_nodes() {
        let manager = manager_with(vec![active_node("n1", 8.0, 1.0), active_node("n2", 8.0, 0.0)]);
        let constraints = Constraints {
            anti_affinity: vec!["preexisting-n2".to_string()],
            ..Default::default()
        };
        let chosen = manager
            .schedule(
                "c1",
                &ResourceVector::new(1.0, 1.0, 1.0),
                &constraints,
                PlacementPolicy::LeastLoaded,
            )
            .unwrap();
        assert_eq!(chosen, "n1");
    }

    #[test]
    fn affinity_prefers_listed_node() {
        let manager = manager_with(vec![active_node("n1", 8.0, 4.0), active_node("n2", 8.0, 0.0)]);
        let constraints = Constraints {
            preferred_nodes: vec!["n1".to_string()],
            ..Default::default()
        };
        let chosen = manager
            .schedule(
                "c1",
                &ResourceVector::new(1.0, 1.0, 1.0),
                &constraints,
                PlacementPolicy::AffinityAware,
            )
            .unwrap();
        assert_eq!(chosen, "n1");
    }

    #[test]
    fn no_capacity_is_insufficient_resources() {
        let manager = manager_with(vec![active_node("n1", 2.0, 1.5)]);
        let err = manager
            .schedule(
                "c1",
                &ResourceVector::new(4.0, 1.0, 1.0),
                &Constraints::default(),
                PlacementPolicy::LeastLoaded,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientResources(_)));
    }

    #[test]
    fn failure_reschedules_assignments_and_drops_usage() {
        let manager = manager_with(vec![active_node("n1", 8.0, 0.0), active_node("n2", 8.0, 0.0)]);
        manager
            .schedule(
                "c1",
                &ResourceVector::new(2.0, 2.0, 5.0),
                &Constraints::default(),
                PlacementPolicy::LeastLoaded,
            )
            .unwrap();

        let victim = manager
            .nodes()
            .into_iter()
            .find(|n| n.assignments.iter().any(|a| a.capsule_id == "c1"))
            .unwrap();
        let moves = manager.handle_node_failure(&victim.id);

        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].0, "c1");
        assert_ne!(moves[0].2, victim.id);
        let failed = manager.node(&victim.id).unwrap();
        assert_eq!(failed.state, NodeState::Failed);
        assert_eq!(failed.usage.cpu_cores, 0.0);
    }

    #[test]
    fn rebalance_moves_from_hot_to_cold() {
        let manager = manager_with(vec![active_node("n1", 8.0, 6.8), active_node("n2", 8.0, 1.0)]);
        let candidates = manager.rebalance_candidates();
        assert!(!candidates.is_empty());
        assert_eq!(candidates[0].from, "n1");
        assert_eq!(candidates[0].to, "n2");
    }

    #[test]
    fn split_brain_is_surfaced() {
        let manager = manager_with(vec![active_node("n1", 8.0, 0.0), active_node("n2", 8.0, 0.0)]);
        manager.elect_leader();
        assert!(manager.observe_leader_claim("n1").is_ok());
        assert!(matches!(
            manager.observe_leader_claim("n2"),
            Err(Error::ClusterSplitBrain { .. })
        ));
    }
}
