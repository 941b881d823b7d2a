//! Tests for membership, election, placement, and rebalancing.

use strato::{
    CapsuleAssignment, ClusterManager, Constraints, Error, Node, NodeState, PlacementPolicy,
    ResourceVector,
};

fn eight_core_node(id: &str) -> Node {
    Node::new(id, "10.0.0.1", 4433, ResourceVector::new(8.0, 64.0, 500.0))
}

fn cluster_of(ids: &[&str]) -> ClusterManager {
    let manager = ClusterManager::new(ids[0]);
    for id in ids {
        manager.register_node(eight_core_node(id));
        manager.heartbeat(id, ResourceVector::default()).unwrap();
    }
    manager
}

fn preload(manager: &ClusterManager, node_id: &str, capsule: &str, cores: f64) {
    // Drive load through the scheduler so accounting stays honest.
    let chosen = manager
        .schedule(
            capsule,
            &ResourceVector::new(cores, 1.0, 1.0),
            &Constraints {
                preferred_nodes: vec![node_id.to_string()],
                ..Default::default()
            },
            PlacementPolicy::AffinityAware,
        )
        .unwrap();
    assert_eq!(chosen, node_id);
}

// =============================================================================
// Membership & Leadership
// =============================================================================

#[test]
fn nodes_activate_on_first_heartbeat_and_elect_smallest_id() {
    let manager = ClusterManager::new("node-b");
    manager.register_node(eight_core_node("node-b"));
    manager.register_node(eight_core_node("node-a"));

    assert_eq!(manager.node("node-a").unwrap().state, NodeState::Joining);

    manager.heartbeat("node-b", ResourceVector::default()).unwrap();
    assert_eq!(manager.leader().as_deref(), Some("node-b"));

    // A smaller id joining and heartbeating takes over on election.
    manager.heartbeat("node-a", ResourceVector::default()).unwrap();
    manager.elect_leader();
    assert_eq!(manager.leader().as_deref(), Some("node-a"));
}

#[test]
fn heartbeat_for_unknown_node_errors() {
    let manager = ClusterManager::new("n1");
    assert!(matches!(
        manager.heartbeat("ghost", ResourceVector::default()),
        Err(Error::NodeUnreachable { .. })
    ));
}

#[test]
fn conflicting_leader_claim_is_split_brain() {
    let manager = cluster_of(&["n1", "n2"]);
    manager.elect_leader();
    assert!(manager.observe_leader_claim("n1").is_ok());
    assert!(matches!(
        manager.observe_leader_claim("n2"),
        Err(Error::ClusterSplitBrain { .. })
    ));
}

// =============================================================================
// Placement
// =============================================================================

#[test]
fn least_loaded_placement_lands_on_an_idle_node() {
    // Three nodes with 8 cores each, one already at 7 cores used.
    let manager = cluster_of(&["n1", "n2", "n3"]);
    preload(&manager, "n1", "busy", 7.0);

    let chosen = manager
        .schedule(
            "web",
            &ResourceVector::new(2.0, 2.0, 5.0),
            &Constraints::default(),
            PlacementPolicy::LeastLoaded,
        )
        .unwrap();

    assert!(chosen == "n2" || chosen == "n3", "placement on an idle node, got {chosen}");

    // The chosen node's books reflect the assignment.
    let node = manager.node(&chosen).unwrap();
    assert_eq!(node.usage.cpu_cores, 2.0);
    assert_eq!(node.assignments.len(), 1);
    assert_eq!(node.assignments[0].capsule_id, "web");
}

#[test]
fn usage_equals_assignment_sum_after_many_placements() {
    let manager = cluster_of(&["n1", "n2"]);
    for i in 0..6 {
        manager
            .schedule(
                &format!("c{i}"),
                &ResourceVector::new(1.0, 1.0, 2.0),
                &Constraints::default(),
                PlacementPolicy::RoundRobin,
            )
            .unwrap();
    }

    for node in manager.nodes() {
        let sum: f64 = node.assignments.iter().map(|a| a.resources.cpu_cores).sum();
        assert!((node.usage.cpu_cores - sum).abs() < 1e-9, "node {} books diverged", node.id);
    }
}

#[test]
fn resource_balanced_spreads_load() {
    let manager = cluster_of(&["n1", "n2"]);
    preload(&manager, "n1", "hog", 4.0);

    let chosen = manager
        .schedule(
            "balanced",
            &ResourceVector::new(1.0, 1.0, 1.0),
            &Constraints::default(),
            PlacementPolicy::ResourceBalanced,
        )
        .unwrap();
    assert_eq!(chosen, "n2");
}

#[test]
fn oversized_request_is_insufficient_resources() {
    let manager = cluster_of(&["n1"]);
    match manager.schedule(
        "giant",
        &ResourceVector::new(64.0, 1.0, 1.0),
        &Constraints::default(),
        PlacementPolicy::LeastLoaded,
    ) {
        Err(Error::InsufficientResources(_)) => {}
        other => panic!("expected InsufficientResources, got {other:?}"),
    }
}

#[test]
fn draining_node_receives_no_placements() {
    let manager = cluster_of(&["n1", "n2"]);
    manager.drain("n2").unwrap();

    for i in 0..3 {
        let chosen = manager
            .schedule(
                &format!("c{i}"),
                &ResourceVector::new(1.0, 1.0, 1.0),
                &Constraints::default(),
                PlacementPolicy::RoundRobin,
            )
            .unwrap();
        assert_eq!(chosen, "n1");
    }
}

// =============================================================================
// Rebalancing
// =============================================================================

#[test]
fn rebalance_targets_node_below_half_utilization() {
    let manager = cluster_of(&["n1", "n2", "n3"]);
    // Scenario: place a 2-core capsule, then drive its node hot.
    preload(&manager, "n2", "web", 2.0);
    preload(&manager, "n2", "filler", 4.5);
    // n2 is now at 6.5 / 8 ≈ 0.81 > 0.8.

    let candidates = manager.rebalance_candidates();
    assert!(!candidates.is_empty(), "overloaded node must yield candidates");
    for candidate in &candidates {
        assert_eq!(candidate.from, "n2");
        let target = manager.node(&candidate.to).unwrap();
        assert!(
            target.cpu_utilization() < 0.5,
            "migration target must sit below half utilization"
        );
    }
}

#[test]
fn balanced_cluster_yields_no_candidates() {
    let manager = cluster_of(&["n1", "n2"]);
    preload(&manager, "n1", "a", 2.0);
    preload(&manager, "n2", "b", 2.0);
    assert!(manager.rebalance_candidates().is_empty());
}

#[test]
fn commit_migration_moves_the_assignment() {
    let manager = cluster_of(&["n1", "n2"]);
    preload(&manager, "n1", "mover", 2.0);

    manager.commit_migration("mover", "n2").unwrap();

    assert_eq!(manager.node("n1").unwrap().usage.cpu_cores, 0.0);
    let n2 = manager.node("n2").unwrap();
    assert_eq!(n2.usage.cpu_cores, 2.0);
    assert_eq!(n2.assignments[0].capsule_id, "mover");
}

// =============================================================================
// Failure Handling
// =============================================================================

#[test]
fn failed_node_loses_usage_and_work_moves_least_loaded() {
    let manager = cluster_of(&["n1", "n2", "n3"]);
    preload(&manager, "n1", "app", 3.0);
    preload(&manager, "n3", "ballast", 5.0);

    let moves = manager.handle_node_failure("n1");

    assert_eq!(moves.len(), 1);
    let (capsule, from, to) = &moves[0];
    assert_eq!(capsule, "app");
    assert_eq!(from, "n1");
    assert_eq!(to, "n2", "least-loaded target takes the orphan");

    let failed = manager.node("n1").unwrap();
    assert_eq!(failed.state, NodeState::Failed);
    assert_eq!(failed.usage.cpu_cores, 0.0);
    assert!(failed.assignments.is_empty());

    let target = manager.node("n2").unwrap();
    assert!(target.assignments.iter().any(|a: &CapsuleAssignment| a.capsule_id == "app"));
}

#[test]
fn leader_failure_triggers_reelection() {
    let manager = cluster_of(&["n1", "n2", "n3"]);
    manager.elect_leader();
    assert_eq!(manager.leader().as_deref(), Some("n1"));

    manager.handle_node_failure("n1");
    assert_eq!(manager.leader().as_deref(), Some("n2"));
}

#[test]
fn drain_moves_everything_gracefully() {
    let manager = cluster_of(&["n1", "n2"]);
    preload(&manager, "n1", "a", 1.0);
    preload(&manager, "n1", "b", 1.0);

    let moves = manager.drain("n1").unwrap();
    assert_eq!(moves.len(), 2);
    assert!(moves.iter().all(|(_, from, to)| from == "n1" && to == "n2"));
    assert_eq!(manager.node("n1").unwrap().state, NodeState::Draining);

    // A draining node cannot be drained twice.
    assert!(matches!(manager.drain("n1"), Err(Error::InvalidNodeState { .. })));
}
