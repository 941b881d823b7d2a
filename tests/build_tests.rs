//! Tests for the build cache and reproducible builder.
//!
//! The build commands run under `/bin/sh` in an isolated workspace
//! with a pruned deterministic environment.

use std::collections::BTreeMap;
use std::sync::Arc;
use strato::{BuildCache, BuildInput, BuildOptions, BuildSpec, Builder, ContentStore, Error, ObjectKind, OutputDecl};
use tempfile::TempDir;

fn builder(temp: &TempDir) -> (Arc<ContentStore>, Builder) {
    let store = Arc::new(ContentStore::open(temp.path()).unwrap());
    let builder = Builder::new(Arc::clone(&store), Arc::new(BuildCache::new())).unwrap();
    (store, builder)
}

fn concat_spec(store: &ContentStore) -> BuildSpec {
    let a = store.put(b"alpha\n", ObjectKind::Build).unwrap();
    let b = store.put(b"beta\n", ObjectKind::Build).unwrap();
    BuildSpec {
        name: "concat".to_string(),
        version: "1.0".to_string(),
        inputs: vec![
            BuildInput {
                role: "A".to_string(),
                digest: a,
                kind: ObjectKind::Build,
            },
            BuildInput {
                role: "B".to_string(),
                digest: b,
                kind: ObjectKind::Build,
            },
        ],
        outputs: vec![OutputDecl {
            name: "out".to_string(),
            kind: ObjectKind::Build,
        }],
        command: "cat A B > out".to_string(),
        env: BTreeMap::new(),
        target_system: "x86_64-linux".to_string(),
        reproducible: true,
    }
}

fn count_objects(store: &ContentStore) -> usize {
    store.list().unwrap().len()
}

// =============================================================================
// Cache Behavior
// =============================================================================

#[tokio::test]
async fn second_build_is_a_cache_hit_with_no_new_writes() {
    let temp = TempDir::new().unwrap();
    let (store, builder) = builder(&temp);
    let spec = concat_spec(&store);

    let first = builder.build(&spec).await.unwrap();
    assert!(!first.cached);
    assert_eq!(first.outputs.len(), 1);

    let objects_after_first = count_objects(&store);

    let second = builder.build(&spec).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.manifest_digest, first.manifest_digest);
    assert_eq!(second.outputs[0].digest, first.outputs[0].digest);
    assert_eq!(
        count_objects(&store),
        objects_after_first,
        "cache hit writes nothing new"
    );
}

#[tokio::test]
async fn build_output_is_the_concatenation() {
    let temp = TempDir::new().unwrap();
    let (store, builder) = builder(&temp);
    let spec = concat_spec(&store);

    let result = builder.build(&spec).await.unwrap();
    let out = store.get(&result.outputs[0].digest).unwrap();
    assert_eq!(out, b"alpha\nbeta\n");
}

#[tokio::test]
async fn equal_fingerprints_reuse_across_input_order() {
    let temp = TempDir::new().unwrap();
    let (store, builder) = builder(&temp);

    let mut forward = concat_spec(&store);
    forward.env.insert("X".to_string(), "1".to_string());
    let mut reversed = forward.clone();
    reversed.inputs.reverse();

    assert_eq!(forward.fingerprint(), reversed.fingerprint());

    let first = builder.build(&forward).await.unwrap();
    let second = builder.build(&reversed).await.unwrap();
    assert!(second.cached);
    assert_eq!(first.manifest_digest, second.manifest_digest);
}

// =============================================================================
// Failure Modes
// =============================================================================

#[tokio::test]
async fn missing_input_is_dependency_not_found() {
    let temp = TempDir::new().unwrap();
    let (store, builder) = builder(&temp);

    let mut spec = concat_spec(&store);
    spec.inputs[0].digest = strato::Digest::of_bytes(b"not stored anywhere");

    match builder.build(&spec).await {
        Err(Error::DependencyNotFound { .. }) => {}
        other => panic!("expected DependencyNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn nonzero_exit_is_build_failed_and_not_cached() {
    let temp = TempDir::new().unwrap();
    let (store, builder) = builder(&temp);

    let mut spec = concat_spec(&store);
    spec.command = "echo doomed >&2; exit 3".to_string();

    match builder.build(&spec).await {
        Err(Error::BuildFailed { .. }) => {}
        other => panic!("expected BuildFailed, got {other:?}"),
    }

    // The failure must not poison the cache for the fixed spec.
    spec.command = "cat A B > out".to_string();
    let result = builder.build(&spec).await.unwrap();
    assert!(!result.cached);
}

#[tokio::test]
async fn undeclared_output_is_validation_failure() {
    let temp = TempDir::new().unwrap();
    let (store, builder) = builder(&temp);

    let mut spec = concat_spec(&store);
    spec.command = "true".to_string();

    match builder.build(&spec).await {
        Err(Error::ValidationFailed(_)) => {}
        other => panic!("expected ValidationFailed, got {other:?}"),
    }
}

// =============================================================================
// Reproducibility
// =============================================================================

#[tokio::test]
async fn nondeterministic_reproducible_build_is_rejected() {
    let temp = TempDir::new().unwrap();
    let (store, builder) = builder(&temp);

    let mut spec = concat_spec(&store);
    // Wall-clock nanoseconds differ between the two validation passes.
    spec.command = "date +%s%N > out".to_string();

    match builder.build(&spec).await {
        Err(Error::NonDeterministic { .. }) => {}
        other => panic!("expected NonDeterministic, got {other:?}"),
    }
}

#[tokio::test]
async fn validation_pass_can_be_opted_out() {
    let temp = TempDir::new().unwrap();
    let (store, builder) = builder(&temp);

    let mut spec = concat_spec(&store);
    spec.command = "date +%s%N > out".to_string();

    let options = BuildOptions {
        verify_reproducible: false,
    };
    // Without the validation pass the build itself succeeds.
    builder.build_with_options(&spec, &options).await.unwrap();
}

#[tokio::test]
async fn build_env_is_deterministic() {
    let temp = TempDir::new().unwrap();
    let (store, builder) = builder(&temp);

    let mut spec = concat_spec(&store);
    spec.command = "printf '%s|%s|%s' \"$LANG\" \"$TZ\" \"$HOME\" > out".to_string();
    spec.reproducible = false;

    let result = builder.build(&spec).await.unwrap();
    let out = String::from_utf8(store.get(&result.outputs[0].digest).unwrap()).unwrap();
    let fields: Vec<&str> = out.split('|').collect();
    assert_eq!(fields[0], "C", "POSIX locale");
    assert_eq!(fields[1], "UTC", "UTC timezone");
    assert!(fields[2].contains("concat-"), "HOME is the build directory");
}

#[tokio::test]
async fn spec_env_overlays_the_base() {
    let temp = TempDir::new().unwrap();
    let (store, builder) = builder(&temp);

    let mut spec = concat_spec(&store);
    spec.command = "printf '%s' \"$TZ\" > out".to_string();
    spec.env.insert("TZ".to_string(), "America/New_York".to_string());
    spec.reproducible = false;

    let result = builder.build(&spec).await.unwrap();
    let out = store.get(&result.outputs[0].digest).unwrap();
    assert_eq!(out, b"America/New_York", "spec env wins over the base");
}
