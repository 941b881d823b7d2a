//! # Image Store
//!
//! Resolves image references to manifests whose layers live in the
//! content store. A reference of the form `[registry/]name[:tag]`
//! defaults to tag `latest`, and to the well-known registry when the
//! first path segment contains no dot. Pulls go through the
//! [`RegistryClient`] trait so the wire protocol stays outside the
//! core (tests use an in-memory registry).
//!
//! An image is **materialized** iff its manifest digest exists and
//! every referenced layer and config digest resolves in the content
//! store. The manifest itself is stored as a content object, so image
//! manifests double as GC roots.

use crate::constants::{
    DEFAULT_REGISTRY, DEFAULT_REPOSITORY_NAMESPACE, DEFAULT_TAG, IMAGE_PULL_TIMEOUT, MAX_IMAGE_REF_LEN,
    MAX_LAYER_SIZE, MAX_LAYERS,
};
use crate::digest::{Digest, ObjectKind};
use crate::error::{Error, Result};
use crate::store::ContentStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

// =============================================================================
// References
// =============================================================================

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    /// Parses `[registry/]name[:tag]`.
    ///
    /// The registry defaults to the well-known value when the first
    /// path segment carries no dot; bare single-segment names on the
    /// default registry gain the `library/` namespace.
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.is_empty() || reference.len() > MAX_IMAGE_REF_LEN {
            return Err(Error::InvalidImageFormat {
                reference: reference.to_string(),
                reason: format!("length must be 1..={MAX_IMAGE_REF_LEN} bytes"),
            });
        }
        if !reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
        {
            return Err(Error::InvalidImageFormat {
                reference: reference.to_string(),
                reason: "contains invalid characters".to_string(),
            });
        }

        let (name_part, tag) = match reference.rsplit_once(':') {
            // A colon inside the registry host (port) is not a tag.
            Some((name, tag)) if !tag.contains('/') => (name, tag.to_string()),
            _ => (reference, DEFAULT_TAG.to_string()),
        };

        let (registry, mut repository) = match name_part.split_once('/') {
            Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name_part.to_string()),
        };

        if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            repository = format!("{DEFAULT_REPOSITORY_NAMESPACE}/{repository}");
        }

        if repository.is_empty() || tag.is_empty() {
            return Err(Error::InvalidImageFormat {
                reference: reference.to_string(),
                reason: "empty repository or tag".to_string(),
            });
        }

        Ok(Self {
            registry,
            repository,
            tag,
        })
    }

    /// Cache key `registry/repository:tag`.
    pub fn canonical(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

// =============================================================================
// Manifests
// =============================================================================

/// One layer referenced by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDesc {
    pub digest: Digest,
    pub size: u64,
    pub media_type: String,
}

/// An image manifest: ordered layers plus a config, all by digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    pub name: String,
    pub tag: String,
    /// Digest of this manifest blob in the content store.
    pub digest: Digest,
    /// Layers ordered bottom-to-top.
    pub layers: Vec<LayerDesc>,
    pub config_digest: Digest,
}

// =============================================================================
// Registry Client Seam
// =============================================================================

/// Raw image bits fetched from a registry.
#[derive(Debug, Clone)]
pub struct RemoteImage {
    pub layers: Vec<LayerDesc>,
    pub config: Vec<u8>,
}

/// Wire-protocol boundary for image pulls.
///
/// The platform core never speaks the registry protocol directly;
/// implementations fetch manifests and layer bytes, the store verifies
/// and persists them.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetches the manifest and config for a reference.
    async fn fetch_image(&self, reference: &ImageReference) -> Result<RemoteImage>;

    /// Fetches the bytes of one layer.
    async fn fetch_layer(&self, reference: &ImageReference, layer: &LayerDesc) -> Result<Vec<u8>>;
}

/// [`RegistryClient`] backed by the OCI distribution protocol.
pub struct OciRegistryClient {
    client: oci_distribution::Client,
}

impl OciRegistryClient {
    pub fn new() -> Self {
        let config = oci_distribution::client::ClientConfig {
            protocol: oci_distribution::client::ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: oci_distribution::Client::new(config),
        }
    }

    fn oci_reference(reference: &ImageReference) -> Result<oci_distribution::Reference> {
        reference
            .canonical()
            .parse()
            .map_err(|e| Error::InvalidImageFormat {
                reference: reference.canonical(),
                reason: format!("{e}"),
            })
    }
}

impl Default for OciRegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn fetch_image(&self, reference: &ImageReference) -> Result<RemoteImage> {
        let oci_ref = Self::oci_reference(reference)?;
        let auth = oci_distribution::secrets::RegistryAuth::Anonymous;

        let image = tokio::time::timeout(
            IMAGE_PULL_TIMEOUT,
            self.client.pull(
                &oci_ref,
                &auth,
                vec![
                    oci_distribution::manifest::IMAGE_LAYER_MEDIA_TYPE,
                    oci_distribution::manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
                    oci_distribution::manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
                    oci_distribution::manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
                ],
            ),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull {reference}"),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|e| Error::RegistryError {
            reference: reference.canonical(),
            reason: e.to_string(),
        })?;

        let mut layers = Vec::with_capacity(image.layers.len());
        for layer in &image.layers {
            layers.push(LayerDesc {
                digest: layer.sha256_digest().parse()?,
                size: layer.data.len() as u64,
                media_type: layer.media_type.clone(),
            });
        }

        Ok(RemoteImage {
            layers,
            config: image.config.data,
        })
    }

    async fn fetch_layer(&self, reference: &ImageReference, layer: &LayerDesc) -> Result<Vec<u8>> {
        let oci_ref = Self::oci_reference(reference)?;
        let descriptor = oci_distribution::manifest::OciDescriptor {
            digest: layer.digest.to_string(),
            size: layer.size as i64,
            media_type: layer.media_type.clone(),
            urls: None,
            annotations: None,
        };

        let mut data = Vec::new();
        tokio::time::timeout(
            IMAGE_PULL_TIMEOUT,
            self.client.pull_blob(&oci_ref, &descriptor, &mut data),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull layer {}", layer.digest),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|e| Error::RegistryError {
            reference: reference.canonical(),
            reason: e.to_string(),
        })?;

        Ok(data)
    }
}

// =============================================================================
// Image Store
// =============================================================================

/// Resolves references to manifests, pulling on miss.
pub struct ImageStore {
    store: Arc<ContentStore>,
    client: Arc<dyn RegistryClient>,
    /// Reference canonical form → stored manifest digest.
    resolved: RwLock<HashMap<String, Digest>>,
}

impl ImageStore {
    pub fn new(store: Arc<ContentStore>, client: Arc<dyn RegistryClient>) -> Self {
        Self {
            store,
            client,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves a reference to a manifest, pulling layers on miss.
    pub async fn resolve(&self, reference: &str) -> Result<ImageManifest> {
        let parsed = ImageReference::parse(reference)?;
        let key = parsed.canonical();

        let cached = self
            .resolved
            .read()
            .expect("image index lock poisoned")
            .get(&key)
            .copied();
        if let Some(digest) = cached
            && let Ok(manifest) = self.load_manifest(&digest)
            && self.is_materialized(&manifest)
        {
            debug!(reference = %key, "image already materialized");
            return Ok(manifest);
        }

        info!(reference = %key, "pulling image");
        let remote = self
            .client
            .fetch_image(&parsed)
            .await
            .map_err(|e| match e {
                Error::RegistryError { reference, reason } if reason.contains("not found") => {
                    Error::ImageNotFound { reference }
                }
                other => other,
            })?;

        if remote.layers.len() > MAX_LAYERS {
            return Err(Error::InvalidImageFormat {
                reference: key,
                reason: format!("too many layers: {} > {MAX_LAYERS}", remote.layers.len()),
            });
        }

        let config_digest = self.store.put(&remote.config, ObjectKind::Config)?;

        let mut layers = Vec::with_capacity(remote.layers.len());
        for layer in &remote.layers {
            if layer.size > MAX_LAYER_SIZE {
                return Err(Error::InvalidImageFormat {
                    reference: key,
                    reason: format!("layer {} exceeds {MAX_LAYER_SIZE} bytes", layer.digest),
                });
            }
            if !self.store.contains(&layer.digest) {
                let data = self.client.fetch_layer(&parsed, layer).await?;
                let stored = self.store.put(&data, ObjectKind::Layer)?;
                if stored != layer.digest {
                    return Err(Error::HashMismatch {
                        digest: layer.digest.to_string(),
                        actual: stored.to_string(),
                    });
                }
            } else {
                debug!(digest = %layer.digest, "layer already cached");
            }
            layers.push(layer.clone());
        }

        self.finalize_manifest(&parsed, layers, config_digest)
    }

    /// Writes and indexes a manifest after verifying every referenced
    /// digest resolves.
    fn finalize_manifest(
        &self,
        reference: &ImageReference,
        layers: Vec<LayerDesc>,
        config_digest: Digest,
    ) -> Result<ImageManifest> {
        for layer in &layers {
            if !self.store.contains(&layer.digest) {
                return Err(Error::NotFound {
                    digest: layer.digest.to_string(),
                });
            }
        }
        if !self.store.contains(&config_digest) {
            return Err(Error::NotFound {
                digest: config_digest.to_string(),
            });
        }

        // The stored blob omits its own digest; it is filled in after
        // the put assigns one.
        let record = serde_json::json!({
            "name": &reference.repository,
            "tag": &reference.tag,
            "layers": &layers,
            "config_digest": config_digest,
        });
        let bytes = serde_json::to_vec(&record)?;
        let digest = self.store.put(&bytes, ObjectKind::Manifest)?;

        let manifest = ImageManifest {
            name: reference.repository.clone(),
            tag: reference.tag.clone(),
            digest,
            layers,
            config_digest,
        };

        self.resolved
            .write()
            .expect("image index lock poisoned")
            .insert(reference.canonical(), digest);

        info!(reference = %reference, %digest, "image materialized");
        Ok(manifest)
    }

    /// Synthesizes a manifest for a base capsule: no layers, root user,
    /// working directory `/`.
    pub fn synthesize_base(&self, name: &str) -> Result<ImageManifest> {
        let config = serde_json::json!({
            "user": "root",
            "working_dir": "/",
            "env": [],
        });
        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = self.store.put(&config_bytes, ObjectKind::Config)?;

        let reference = ImageReference {
            registry: "strato".to_string(),
            repository: name.to_string(),
            tag: "base".to_string(),
        };
        self.finalize_manifest(&reference, Vec::new(), config_digest)
    }

    /// True when the manifest and all referenced digests resolve.
    pub fn is_materialized(&self, manifest: &ImageManifest) -> bool {
        self.store.contains(&manifest.digest)
            && self.store.contains(&manifest.config_digest)
            && manifest.layers.iter().all(|l| self.store.contains(&l.digest))
    }

    /// Loads a manifest blob back from the content store.
    pub fn load_manifest(&self, digest: &Digest) -> Result<ImageManifest> {
        let data = self.store.get(digest)?;
        let record: serde_json::Value = serde_json::from_slice(&data)?;
        let layers: Vec<LayerDesc> = serde_json::from_value(record["layers"].clone())?;
        let config_digest: Digest = serde_json::from_value(record["config_digest"].clone())?;
        Ok(ImageManifest {
            name: record["name"].as_str().unwrap_or_default().to_string(),
            tag: record["tag"].as_str().unwrap_or_default().to_string(),
            digest: *digest,
            layers,
            config_digest,
        })
    }

    /// Manifest digests currently indexed (GC roots).
    pub fn manifest_roots(&self) -> Vec<Digest> {
        self.resolved
            .read()
            .expect("image index lock poisoned")
            .values()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults_registry_and_tag() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn parse_keeps_explicit_registry() {
        let r = ImageReference::parse("ghcr.io/acme/app:v2").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "acme/app");
        assert_eq!(r.tag, "v2");
    }

    #[test]
    fn parse_port_in_registry_is_not_a_tag() {
        let r = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn parse_rejects_bad_characters() {
        assert!(ImageReference::parse("ngi nx").is_err());
        assert!(ImageReference::parse("").is_err());
    }
}
