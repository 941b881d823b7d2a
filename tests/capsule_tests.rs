//! Tests for capsule configuration, creation, and cleanup paths.
//!
//! Starting a capsule needs namespace privileges, so these tests
//! exercise everything up to the fork boundary: validation, rootfs
//! assembly, cgroup files, port/device claims, and the unwinding of
//! partial setup.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use strato::{
    CapsuleConfig, CapsuleRuntime, CapsuleState, ContentStore, DeviceSpec, Digest, ImageManifest,
    LayerDesc, ObjectKind, PortMapping, ResourceLimits,
};
use tempfile::TempDir;

fn fixture(temp: &TempDir) -> (Arc<ContentStore>, CapsuleRuntime) {
    let store = Arc::new(ContentStore::open(temp.path().join("store")).unwrap());
    let runtime = CapsuleRuntime::with_roots(
        Arc::clone(&store),
        temp.path().join("capsules"),
        temp.path().join("cgroup"),
    )
    .unwrap();
    (store, runtime)
}

fn empty_manifest(store: &ContentStore) -> ImageManifest {
    let config_digest = store.put(b"{}", ObjectKind::Config).unwrap();
    let digest = store.put(b"{\"layers\":[]}", ObjectKind::Manifest).unwrap();
    ImageManifest {
        name: "base".to_string(),
        tag: "test".to_string(),
        digest,
        layers: Vec::new(),
        config_digest,
    }
}

fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn config_rejects_zero_memory_and_long_hostnames() {
    let mut config = CapsuleConfig::new("svc", vec!["/bin/true".to_string()]);
    config.resources = ResourceLimits {
        memory_bytes: 0,
        ..Default::default()
    };
    assert!(config.validate().is_err(), "memory.max = 0 is forbidden");

    let mut config = CapsuleConfig::new("svc", vec!["/bin/true".to_string()]);
    config.hostname = Some("x".repeat(65));
    assert!(config.validate().is_err(), "hostname over 64 bytes is forbidden");
}

#[test]
fn config_rejects_bad_names_and_empty_commands() {
    assert!(CapsuleConfig::new("bad name!", vec!["/bin/true".to_string()])
        .validate()
        .is_err());
    assert!(CapsuleConfig::new("ok", Vec::new()).validate().is_err());
}

// =============================================================================
// Creation
// =============================================================================

#[test]
fn create_extracts_layers_into_rootfs() {
    let temp = TempDir::new().unwrap();
    let (store, runtime) = fixture(&temp);

    let archive = tar_bytes(&[("etc/issue", b"strato")]);
    let layer_digest = store.put(&archive, ObjectKind::Layer).unwrap();
    let mut manifest = empty_manifest(&store);
    manifest.layers = vec![LayerDesc {
        digest: layer_digest,
        size: archive.len() as u64,
        media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
    }];

    let config = CapsuleConfig::new("svc", vec!["/bin/sh".to_string()]);
    let id = runtime.create(config, &manifest).unwrap();

    let rootfs = runtime.capsule_dir(&id).join("rootfs");
    assert_eq!(std::fs::read(rootfs.join("etc/issue")).unwrap(), b"strato");

    let capsule = runtime.inspect(&id).unwrap();
    assert_eq!(capsule.state, CapsuleState::Created);
    assert_eq!(capsule.hostname, id.to_string(), "hostname defaults to the id");
    assert!(capsule.hostname.len() <= 64);
}

#[test]
fn create_writes_cgroup_limit_files() {
    let temp = TempDir::new().unwrap();
    let (store, runtime) = fixture(&temp);
    let manifest = empty_manifest(&store);

    let mut config = CapsuleConfig::new("svc", vec!["/bin/sh".to_string()]);
    config.resources = ResourceLimits {
        cpu_cores: 1.5,
        memory_bytes: 64 * 1024 * 1024,
        storage_bytes: 0,
        pids_max: 256,
    };
    let id = runtime.create(config, &manifest).unwrap();

    let cgroup = runtime.inspect(&id).unwrap().cgroup_path.unwrap();
    assert_eq!(
        std::fs::read_to_string(cgroup.join("memory.max")).unwrap(),
        (64u64 * 1024 * 1024).to_string()
    );
    assert_eq!(std::fs::read_to_string(cgroup.join("cpu.max")).unwrap(), "150000 100000");
    assert_eq!(std::fs::read_to_string(cgroup.join("pids.max")).unwrap(), "256");
}

// =============================================================================
// Partial-Setup Unwinding
// =============================================================================

#[test]
fn failed_create_leaves_no_state_behind() {
    let temp = TempDir::new().unwrap();
    let (store, runtime) = fixture(&temp);

    // Manifest referencing a layer the store does not hold.
    let mut manifest = empty_manifest(&store);
    manifest.layers = vec![LayerDesc {
        digest: Digest::of_bytes(b"vanished layer"),
        size: 64,
        media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
    }];

    let mut config = CapsuleConfig::new("svc", vec!["/bin/sh".to_string()]);
    config.ports = vec![PortMapping { host: 9090, capsule: 80 }];
    assert!(runtime.create(config, &manifest).is_err());

    // No capsule directory survives the failed create.
    let leftovers: Vec<_> = std::fs::read_dir(temp.path().join("capsules"))
        .unwrap()
        .flatten()
        .collect();
    assert!(leftovers.is_empty(), "partial capsule state must be unwound");

    // The claimed port was released, so a later create can have it.
    let good = empty_manifest(&store);
    let mut config = CapsuleConfig::new("svc2", vec!["/bin/sh".to_string()]);
    config.ports = vec![PortMapping { host: 9090, capsule: 80 }];
    runtime.create(config, &good).unwrap();
}

// =============================================================================
// Ports & Devices
// =============================================================================

#[test]
fn host_ports_are_exclusive_until_release() {
    let temp = TempDir::new().unwrap();
    let (store, runtime) = fixture(&temp);
    let manifest = empty_manifest(&store);

    let mut first = CapsuleConfig::new("a", vec!["/bin/sh".to_string()]);
    first.ports = vec![PortMapping { host: 8080, capsule: 80 }];
    let id = runtime.create(first, &manifest).unwrap();

    let mut second = CapsuleConfig::new("b", vec!["/bin/sh".to_string()]);
    second.ports = vec![PortMapping { host: 8080, capsule: 80 }];
    assert!(runtime.create(second.clone(), &manifest).is_err());

    runtime.remove(&id).unwrap();
    runtime.create(second, &manifest).unwrap();
}

#[test]
fn exclusive_devices_conflict_shared_devices_do_not() {
    let temp = TempDir::new().unwrap();
    let (store, runtime) = fixture(&temp);
    let manifest = empty_manifest(&store);

    let exclusive = DeviceSpec {
        path: PathBuf::from("/dev/fb0"),
        shared: false,
    };
    let mut a = CapsuleConfig::new("a", vec!["/bin/sh".to_string()]);
    a.devices = vec![exclusive.clone()];
    runtime.create(a, &manifest).unwrap();

    let mut b = CapsuleConfig::new("b", vec!["/bin/sh".to_string()]);
    b.devices = vec![exclusive];
    assert!(runtime.create(b, &manifest).is_err(), "exclusive device is single-holder");

    let shared = DeviceSpec {
        path: PathBuf::from("/dev/dri/renderD128"),
        shared: true,
    };
    for name in ["c", "d"] {
        let mut config = CapsuleConfig::new(name, vec!["/bin/sh".to_string()]);
        config.devices = vec![shared.clone()];
        runtime.create(config, &manifest).unwrap();
    }
}

// =============================================================================
// Lifecycle Boundaries
// =============================================================================

#[tokio::test]
async fn stop_on_created_capsule_is_a_noop_and_remove_cleans_up() {
    let temp = TempDir::new().unwrap();
    let (store, runtime) = fixture(&temp);
    let manifest = empty_manifest(&store);

    let config = CapsuleConfig::new("svc", vec!["/bin/sh".to_string()]);
    let id = runtime.create(config, &manifest).unwrap();

    runtime.stop(&id, None).await.unwrap();
    assert_eq!(runtime.inspect(&id).unwrap().state, CapsuleState::Created);

    runtime.remove(&id).unwrap();
    assert!(runtime.inspect(&id).is_none());
    assert!(!runtime.capsule_dir(&id).exists());
}

#[test]
fn environment_is_carried_into_the_capsule_record() {
    let temp = TempDir::new().unwrap();
    let (store, runtime) = fixture(&temp);
    let manifest = empty_manifest(&store);

    let mut env = BTreeMap::new();
    env.insert("APP_MODE".to_string(), "production".to_string());
    let mut config = CapsuleConfig::new("svc", vec!["/bin/sh".to_string()]);
    config.env = env;
    config.hostname = Some("web-1".to_string());

    let id = runtime.create(config, &manifest).unwrap();
    let capsule = runtime.inspect(&id).unwrap();
    assert_eq!(capsule.env["APP_MODE"], "production");
    assert_eq!(capsule.hostname, "web-1");
}
