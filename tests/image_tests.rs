//! Tests for reference parsing and image materialization.
//!
//! Pulls go through an in-memory registry so no network is involved.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use strato::{
    ContentStore, Digest, Error, ImageReference, ImageStore, LayerDesc, RegistryClient, RemoteImage,
};
use tempfile::TempDir;

// =============================================================================
// Fake Registry
// =============================================================================

struct FakeRegistry {
    layers: Vec<Vec<u8>>,
    config: Vec<u8>,
    fetches: AtomicUsize,
    layer_fetches: AtomicUsize,
}

impl FakeRegistry {
    fn new(layers: Vec<Vec<u8>>) -> Self {
        Self {
            layers,
            config: b"{\"user\":\"root\"}".to_vec(),
            fetches: AtomicUsize::new(0),
            layer_fetches: AtomicUsize::new(0),
        }
    }

    fn descriptors(&self) -> Vec<LayerDesc> {
        self.layers
            .iter()
            .map(|data| LayerDesc {
                digest: Digest::of_bytes(data),
                size: data.len() as u64,
                media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
            })
            .collect()
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn fetch_image(&self, reference: &ImageReference) -> strato::Result<RemoteImage> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if reference.repository.contains("missing") {
            return Err(Error::RegistryError {
                reference: reference.canonical(),
                reason: "manifest not found".to_string(),
            });
        }
        Ok(RemoteImage {
            layers: self.descriptors(),
            config: self.config.clone(),
        })
    }

    async fn fetch_layer(&self, _reference: &ImageReference, layer: &LayerDesc) -> strato::Result<Vec<u8>> {
        self.layer_fetches.fetch_add(1, Ordering::SeqCst);
        self.layers
            .iter()
            .find(|data| Digest::of_bytes(data) == layer.digest)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                digest: layer.digest.to_string(),
            })
    }
}

fn image_store(temp: &TempDir, registry: Arc<FakeRegistry>) -> (Arc<ContentStore>, ImageStore) {
    let store = Arc::new(ContentStore::open(temp.path()).unwrap());
    let images = ImageStore::new(Arc::clone(&store), registry);
    (store, images)
}

// =============================================================================
// Reference Parsing
// =============================================================================

#[test]
fn bare_name_gets_default_registry_tag_and_namespace() {
    let r = ImageReference::parse("nginx").unwrap();
    assert_eq!(r.canonical(), "docker.io/library/nginx:latest");
}

#[test]
fn explicit_registry_and_tag_are_preserved() {
    let r = ImageReference::parse("ghcr.io/acme/tool:v1.2").unwrap();
    assert_eq!(r.canonical(), "ghcr.io/acme/tool:v1.2");
}

#[test]
fn namespaced_name_on_default_registry_keeps_namespace() {
    let r = ImageReference::parse("acme/tool").unwrap();
    assert_eq!(r.canonical(), "docker.io/acme/tool:latest");
}

// =============================================================================
// Materialization
// =============================================================================

#[tokio::test]
async fn resolve_pulls_layers_config_and_writes_manifest() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::new(vec![b"layer-one".to_vec(), b"layer-two".to_vec()]));
    let (store, images) = image_store(&temp, Arc::clone(&registry));

    let manifest = images.resolve("acme/app:prod").await.unwrap();

    assert_eq!(manifest.name, "acme/app");
    assert_eq!(manifest.tag, "prod");
    assert_eq!(manifest.layers.len(), 2);
    assert!(store.contains(&manifest.digest), "manifest blob stored");
    assert!(store.contains(&manifest.config_digest), "config blob stored");
    for layer in &manifest.layers {
        assert!(store.contains(&layer.digest), "layer {} stored", layer.digest);
    }
    assert!(images.is_materialized(&manifest));
}

#[tokio::test]
async fn second_resolve_skips_the_registry() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::new(vec![b"cached-layer".to_vec()]));
    let (_store, images) = image_store(&temp, Arc::clone(&registry));

    let first = images.resolve("acme/app").await.unwrap();
    let second = images.resolve("acme/app").await.unwrap();

    assert_eq!(first.digest, second.digest);
    assert_eq!(registry.fetches.load(Ordering::SeqCst), 1, "one manifest fetch");
    assert_eq!(registry.layer_fetches.load(Ordering::SeqCst), 1, "one layer fetch");
}

#[tokio::test]
async fn shared_layers_are_fetched_once() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::new(vec![b"shared-base".to_vec()]));
    let (_store, images) = image_store(&temp, Arc::clone(&registry));

    images.resolve("acme/app:one").await.unwrap();
    images.resolve("acme/app:two").await.unwrap();

    // Two manifests, one layer body.
    assert_eq!(registry.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(registry.layer_fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_image_is_image_not_found() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::new(vec![]));
    let (_store, images) = image_store(&temp, registry);

    match images.resolve("acme/missing:latest").await {
        Err(Error::ImageNotFound { .. }) => {}
        other => panic!("expected ImageNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn manifest_roundtrips_through_the_store() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::new(vec![b"only-layer".to_vec()]));
    let (_store, images) = image_store(&temp, registry);

    let manifest = images.resolve("acme/app").await.unwrap();
    let loaded = images.load_manifest(&manifest.digest).unwrap();

    assert_eq!(loaded.name, manifest.name);
    assert_eq!(loaded.layers, manifest.layers);
    assert_eq!(loaded.config_digest, manifest.config_digest);
}

// =============================================================================
// Base Capsule Manifests
// =============================================================================

#[tokio::test]
async fn synthesized_base_has_no_layers() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(FakeRegistry::new(vec![]));
    let (store, images) = image_store(&temp, registry);

    let manifest = images.synthesize_base("scratch").unwrap();
    assert!(manifest.layers.is_empty());
    assert!(store.contains(&manifest.config_digest));
    assert!(images.is_materialized(&manifest));

    let config = store.get(&manifest.config_digest).unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&config).unwrap();
    assert_eq!(parsed["user"], "root");
    assert_eq!(parsed["working_dir"], "/");
}
