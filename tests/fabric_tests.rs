//! Tests for the fabric: encrypted transport, registry TTLs, name
//! resolution, and control-plane messages. Endpoints bind loopback
//! UDP sockets on ephemeral ports; no external network is touched.

use std::time::Duration;
use strato::{ControlMessage, Fabric, FabricConfig, FabricEvent, Record, ServiceKey};

fn loopback_config() -> FabricConfig {
    FabricConfig {
        enabled: true,
        node_id: Some("node-test".to_string()),
        bind_address: "127.0.0.1".to_string(),
        bind_port: 0,
        encryption: true,
        service_discovery: true,
    }
}

// =============================================================================
// Service Keys
// =============================================================================

#[test]
fn service_key_seals_and_opens() {
    let key = ServiceKey::generate();
    let envelope = key.seal("db", b"credentials").unwrap();
    assert_eq!(envelope.dest_service, "db");
    assert_ne!(envelope.ciphertext, b"credentials");
    assert_eq!(key.open(&envelope).unwrap(), b"credentials");
}

#[test]
fn foreign_key_cannot_open() {
    let key = ServiceKey::generate();
    let envelope = key.seal("db", b"secret").unwrap();
    assert!(ServiceKey::generate().open(&envelope).is_err());
}

// =============================================================================
// Loopback Messaging
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn encrypted_service_message_roundtrips_through_quic() {
    let (fabric, mut events) = Fabric::start(&loopback_config(), "test.local").await.unwrap();

    let port = fabric.local_addr().port();
    let key = fabric.register_service("echo", "127.0.0.1", port);
    assert!(key.is_some(), "encryption on yields a key");

    let reply = fabric.send_to_service("echo", b"ping").await.unwrap();
    assert_eq!(reply, b"ok");

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within deadline")
        .expect("channel open");
    match event {
        FabricEvent::ServiceMessage { service, payload, .. } => {
            assert_eq!(service, "echo");
            assert_eq!(payload, b"ping", "payload arrives decrypted");
        }
        other => panic!("unexpected event {other:?}"),
    }

    fabric.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn control_heartbeat_updates_peer_table() {
    let (a, _a_events) = Fabric::start(&loopback_config(), "test.local").await.unwrap();
    let mut b_config = loopback_config();
    b_config.node_id = Some("node-b".to_string());
    let (b, mut b_events) = Fabric::start(&b_config, "test.local").await.unwrap();

    let message = ControlMessage::Heartbeat {
        node_id: "node-test".to_string(),
        usage: "cpu=1.00,memory=2.00,storage=3.00,bandwidth=0.00".to_string(),
    };
    a.send_control(b.local_addr(), &message).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), b_events.recv())
        .await
        .expect("event within deadline")
        .expect("channel open");
    match event {
        FabricEvent::Control { message, .. } => assert_eq!(
            message,
            ControlMessage::Heartbeat {
                node_id: "node-test".to_string(),
                usage: "cpu=1.00,memory=2.00,storage=3.00,bandwidth=0.00".to_string(),
            }
        ),
        other => panic!("unexpected event {other:?}"),
    }

    // The heartbeat also registered the sender as a peer.
    assert!(b.registry().peers().iter().any(|p| p.node_id == "node-test"));

    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_service_fails_discovery() {
    let (fabric, _events) = Fabric::start(&loopback_config(), "test.local").await.unwrap();
    assert!(matches!(
        fabric.send_to_service("nope", b"x").await,
        Err(strato::Error::ServiceDiscoveryFailed { .. })
    ));
    fabric.shutdown();
}

// =============================================================================
// Resolution Across Peers
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn name_resolves_across_peers_and_is_cached() {
    let (a, _a_events) = Fabric::start(&loopback_config(), "proj.local").await.unwrap();
    let mut b_config = loopback_config();
    b_config.node_id = Some("node-b".to_string());
    let (b, _b_events) = Fabric::start(&b_config, "proj.local").await.unwrap();

    // b knows the service; a learns about b via a heartbeat.
    let b_port = b.local_addr().port();
    b.register_service("api", "127.0.0.1", b_port);
    b.send_control(
        a.local_addr(),
        &ControlMessage::Heartbeat {
            node_id: "node-b".to_string(),
            usage: "cpu=0.00,memory=0.00,storage=0.00,bandwidth=0.00".to_string(),
        },
    )
    .await
    .unwrap();
    // Allow the dispatch loop to upsert the peer.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let record = a.resolve("api").await.unwrap();
    match record {
        Record::Service { target_port, .. } => assert_eq!(target_port, b_port),
        other => panic!("unexpected record {other:?}"),
    }

    // Second resolution is served from a's cache even if b vanishes.
    b.shutdown();
    let cached = a.resolve("api").await.unwrap();
    assert!(matches!(cached, Record::Service { .. }));

    a.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn unresolvable_name_is_discovery_failure() {
    let (fabric, _events) = Fabric::start(&loopback_config(), "proj.local").await.unwrap();
    assert!(matches!(
        fabric.resolve("phantom").await,
        Err(strato::Error::ServiceDiscoveryFailed { .. })
    ));
    fabric.shutdown();
}

// =============================================================================
// Control Message Grammar
// =============================================================================

#[test]
fn control_message_wire_forms() {
    assert_eq!(
        ControlMessage::DeployCapsule {
            capsule_id: "c1".to_string()
        }
        .to_string(),
        "DEPLOY_CAPSULE:c1"
    );
    assert_eq!(
        ControlMessage::RegisterService {
            name: "web".to_string(),
            port: 443
        }
        .to_string(),
        "REGISTER_SERVICE:web:443"
    );
    assert_eq!(
        "HEARTBEAT:n1:cpu=1.00".parse::<ControlMessage>().unwrap(),
        ControlMessage::Heartbeat {
            node_id: "n1".to_string(),
            usage: "cpu=1.00".to_string()
        }
    );
}
