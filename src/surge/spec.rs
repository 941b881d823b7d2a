//! Project specification schema.
//!
//! The logical document Surge consumes: a mandatory project name plus
//! services, networks, volumes, and the fabric/resolver/snapshots
//! sections. Stored as TOML on disk; only the logical schema matters
//! here.

use crate::error::{Error, Result};
use crate::fabric::FabricConfig;
use crate::snapshot::{NamedSnapshotSpec, RetentionPolicy, SnapshotTriggers};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

// =============================================================================
// Services
// =============================================================================

/// Restart policy applied by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    OnFailure,
    Always,
}

/// Optional TCP health probe for a service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthCheck {
    pub port: u16,
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_retries")]
    pub retries: u32,
}

fn default_probe_interval() -> u64 {
    10
}

fn default_probe_retries() -> u32 {
    3
}

/// Resource requests for one service replica.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ServiceResources {
    #[serde(default = "default_cpu")]
    pub cpu: f64,
    #[serde(default = "default_memory")]
    pub memory_gb: f64,
    #[serde(default = "default_storage")]
    pub storage_gb: f64,
}

fn default_cpu() -> f64 {
    1.0
}
fn default_memory() -> f64 {
    0.5
}
fn default_storage() -> f64 {
    1.0
}

impl Default for ServiceResources {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory_gb: default_memory(),
            storage_gb: default_storage(),
        }
    }
}

/// One service definition.
///
/// Exactly one of `image`, `build`, or `capsule` selects the rootfs
/// source: a registry image, a registered build spec, or a synthesized
/// base capsule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capsule: Option<String>,
    /// Entrypoint override.
    #[serde(default)]
    pub command: Vec<String>,
    /// `host:container` port strings.
    #[serde(default)]
    pub ports: Vec<String>,
    /// `src:dst` volume strings; `src` may name a declared volume.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheck>,
    #[serde(default)]
    pub resources: ServiceResources,
}

fn default_replicas() -> u32 {
    1
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            image: None,
            build: None,
            capsule: None,
            command: Vec::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
            env: BTreeMap::new(),
            depends_on: Vec::new(),
            networks: Vec::new(),
            restart: RestartPolicy::default(),
            replicas: 1,
            health: None,
            resources: ServiceResources::default(),
        }
    }
}

// =============================================================================
// Networks & Volumes
// =============================================================================

/// Network driver type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Bridge,
    Host,
    None,
}

/// One declared network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSpec {
    #[serde(rename = "type", default)]
    pub network_type: NetworkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// One declared volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    #[serde(default = "default_volume_driver")]
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

fn default_volume_driver() -> String {
    "local".to_string()
}

// =============================================================================
// Resolver & Snapshots Sections
// =============================================================================

/// Resolver configuration (the `resolver` spec section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_resolver_port")]
    pub port: u16,
    /// Defaults to `<project>.local` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_resolver_port() -> u16 {
    crate::constants::DEFAULT_RESOLVER_PORT
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_resolver_port(),
            domain: None,
        }
    }
}

/// Snapshot filesystem selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFilesystemKind {
    #[default]
    Auto,
    Btrfs,
    Zfs,
}

/// Snapshot configuration (the `snapshots` spec section).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub filesystem: SnapshotFilesystemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionPolicy>,
    #[serde(default)]
    pub triggers: SnapshotTriggers,
    #[serde(default)]
    pub named_snapshots: Vec<NamedSnapshotSpec>,
}

// =============================================================================
// Project Spec
// =============================================================================

/// A full project document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub project: String,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkSpec>,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fabric: Option<FabricConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<ResolverConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<SnapshotsConfig>,
}

impl ProjectSpec {
    /// Loads and validates a TOML project file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::SpecNotFound {
            path: path.to_path_buf(),
        })?;
        let spec: ProjectSpec =
            toml::from_str(&content).map_err(|e| Error::InvalidSpec(e.to_string()))?;
        spec.validate()?;
        debug!(project = %spec.project, services = spec.services.len(), "project spec loaded");
        Ok(spec)
    }

    /// Serializes back to TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// The resolver domain, defaulted from the project name.
    pub fn domain(&self) -> String {
        self.resolver
            .as_ref()
            .and_then(|r| r.domain.clone())
            .unwrap_or_else(|| format!("{}.local", self.project))
    }

    /// Schema validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        if self.project.is_empty() {
            return Err(Error::InvalidSpec("project name is required".to_string()));
        }

        for (name, service) in &self.services {
            let sources =
                [service.image.is_some(), service.build.is_some(), service.capsule.is_some()]
                    .iter()
                    .filter(|s| **s)
                    .count();
            if sources != 1 {
                return Err(Error::InvalidSpec(format!(
                    "service '{name}' must declare exactly one of image, build, capsule"
                )));
            }
            for port in &service.ports {
                let valid = port
                    .split_once(':')
                    .map(|(h, c)| h.parse::<u16>().is_ok() && c.parse::<u16>().is_ok())
                    .unwrap_or(false);
                if !valid {
                    return Err(Error::InvalidSpec(format!(
                        "service '{name}' port '{port}' must be host:container"
                    )));
                }
            }
            for volume in &service.volumes {
                if !volume.contains(':') {
                    return Err(Error::InvalidSpec(format!(
                        "service '{name}' volume '{volume}' must be src:dst"
                    )));
                }
            }
            for dependency in &service.depends_on {
                if !self.services.contains_key(dependency) {
                    return Err(Error::DependencyError(format!(
                        "service '{name}' depends on unknown service '{dependency}'"
                    )));
                }
            }
            for network in &service.networks {
                if !self.networks.contains_key(network) {
                    return Err(Error::InvalidSpec(format!(
                        "service '{name}' references unknown network '{network}'"
                    )));
                }
            }
            if service.replicas == 0 {
                return Err(Error::InvalidSpec(format!(
                    "service '{name}' replicas must be at least 1"
                )));
            }
        }
        Ok(())
    }

    /// Services in dependency order (dependencies first).
    ///
    /// Cycles are `DependencyError`.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> =
            self.services.keys().map(|name| (name.as_str(), 0)).collect();
        // Edges point dependency → dependent.
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, service) in &self.services {
            for dependency in &service.depends_on {
                dependents.entry(dependency.as_str()).or_default().push(name.as_str());
                *in_degree.get_mut(name.as_str()).expect("validated service name") += 1;
            }
        }

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        queue.sort();

        let mut order = Vec::with_capacity(self.services.len());
        while let Some(next) = queue.pop() {
            order.push(next.to_string());
            for dependent in dependents.get(next).into_iter().flatten() {
                let degree = in_degree.get_mut(dependent).expect("validated dependent");
                *degree -= 1;
                if *degree == 0 {
                    queue.push(dependent);
                    queue.sort();
                }
            }
        }

        if order.len() != self.services.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(n, _)| *n)
                .collect();
            return Err(Error::DependencyError(format!(
                "dependency cycle involving: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_image(image: &str) -> ServiceSpec {
        ServiceSpec {
            image: Some(image.to_string()),
            ..Default::default()
        }
    }

    fn two_service_spec() -> ProjectSpec {
        let mut services = BTreeMap::new();
        services.insert("db".to_string(), service_with_image("postgres:16"));
        let mut web = service_with_image("nginx:latest");
        web.depends_on = vec!["db".to_string()];
        services.insert("web".to_string(), web);
        ProjectSpec {
            project: "demo".to_string(),
            services,
            networks: BTreeMap::new(),
            volumes: BTreeMap::new(),
            fabric: None,
            resolver: None,
            snapshots: None,
        }
    }

    #[test]
    fn validates_single_source() {
        let mut spec = two_service_spec();
        spec.services.get_mut("web").unwrap().build = Some("webbuild".to_string());
        assert!(matches!(spec.validate(), Err(Error::InvalidSpec(_))));

        spec.services.get_mut("web").unwrap().image = None;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn dependency_order_puts_dependencies_first() {
        let spec = two_service_spec();
        let order = spec.topological_order().unwrap();
        assert_eq!(order, vec!["db", "web"]);
    }

    #[test]
    fn cycles_are_dependency_errors() {
        let mut spec = two_service_spec();
        spec.services.get_mut("db").unwrap().depends_on = vec!["web".to_string()];
        assert!(matches!(spec.topological_order(), Err(Error::DependencyError(_))));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut spec = two_service_spec();
        spec.services.get_mut("web").unwrap().depends_on = vec!["cache".to_string()];
        assert!(matches!(spec.validate(), Err(Error::DependencyError(_))));
    }

    #[test]
    fn domain_defaults_from_project() {
        let spec = two_service_spec();
        assert_eq!(spec.domain(), "demo.local");
    }

    #[test]
    fn toml_roundtrip() {
        let spec = two_service_spec();
        let text = toml::to_string_pretty(&spec).unwrap();
        let parsed: ProjectSpec = toml::from_str(&text).unwrap();
        assert_eq!(parsed.project, "demo");
        assert_eq!(parsed.services.len(), 2);
        assert_eq!(parsed.services["web"].depends_on, vec!["db"]);
    }
}
