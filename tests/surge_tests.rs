//! Tests for the orchestrator: spec schema, dependency ordering,
//! quota/scheduling gates, and exit-code mapping.
//!
//! The fabric is disabled in these projects so no sockets are bound;
//! capsule starts that need namespace privileges are exercised only
//! through their failure gates.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use strato::{
    Error, FabricConfig, ImageReference, InMemoryCheckpointEngine, LayerDesc, ProjectSpec,
    RegistryClient, RemoteImage, ServiceResources, ServiceSpec, Surge,
};
use tempfile::TempDir;

struct EmptyImageRegistry;

#[async_trait]
impl RegistryClient for EmptyImageRegistry {
    async fn fetch_image(&self, reference: &ImageReference) -> strato::Result<RemoteImage> {
        if reference.repository.contains("absent") {
            return Err(Error::RegistryError {
                reference: reference.canonical(),
                reason: "manifest not found".to_string(),
            });
        }
        Ok(RemoteImage {
            layers: Vec::new(),
            config: b"{}".to_vec(),
        })
    }

    async fn fetch_layer(&self, _reference: &ImageReference, layer: &LayerDesc) -> strato::Result<Vec<u8>> {
        Err(Error::NotFound {
            digest: layer.digest.to_string(),
        })
    }
}

fn surge(temp: &TempDir) -> Surge {
    Surge::with_engine(
        temp.path(),
        Arc::new(EmptyImageRegistry),
        Arc::new(InMemoryCheckpointEngine::default()),
    )
    .unwrap()
}

fn offline_project(name: &str) -> ProjectSpec {
    ProjectSpec {
        project: name.to_string(),
        services: BTreeMap::new(),
        networks: BTreeMap::new(),
        volumes: BTreeMap::new(),
        fabric: Some(FabricConfig {
            enabled: false,
            ..Default::default()
        }),
        resolver: None,
        snapshots: None,
    }
}

fn base_service() -> ServiceSpec {
    ServiceSpec {
        capsule: Some("base".to_string()),
        ..Default::default()
    }
}

// =============================================================================
// Spec Schema
// =============================================================================

#[test]
fn project_file_roundtrips_through_toml() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("project.toml");

    std::fs::write(
        &path,
        r#"
project = "shop"

[services.db]
image = "postgres:16"
ports = ["5432:5432"]

[services.web]
image = "nginx:latest"
depends_on = ["db"]
ports = ["80:80"]

[services.web.env]
UPSTREAM = "db"

[networks.frontend]
type = "bridge"
subnet = "10.90.0.0/24"

[volumes.pgdata]
driver = "local"
"#,
    )
    .unwrap();

    let spec = ProjectSpec::load(&path).unwrap();
    assert_eq!(spec.project, "shop");
    assert_eq!(spec.services["web"].depends_on, vec!["db"]);
    assert_eq!(spec.services["web"].env["UPSTREAM"], "db");
    assert!(spec.networks.contains_key("frontend"));
    assert!(spec.volumes.contains_key("pgdata"));
    assert_eq!(spec.domain(), "shop.local");

    let copy = temp.path().join("copy.toml");
    spec.save(&copy).unwrap();
    let reparsed = ProjectSpec::load(&copy).unwrap();
    assert_eq!(reparsed.services.len(), 2);
}

#[test]
fn missing_spec_file_is_spec_not_found() {
    match ProjectSpec::load("/nonexistent/project.toml") {
        Err(Error::SpecNotFound { .. }) => {}
        other => panic!("expected SpecNotFound, got {other:?}"),
    }
}

#[test]
fn service_needs_exactly_one_source() {
    let mut project = offline_project("p");
    let mut svc = base_service();
    svc.image = Some("nginx".to_string());
    project.services.insert("web".to_string(), svc);
    assert!(matches!(project.validate(), Err(Error::InvalidSpec(_))));

    let mut project = offline_project("p");
    project.services.insert("web".to_string(), ServiceSpec::default());
    assert!(matches!(project.validate(), Err(Error::InvalidSpec(_))));
}

#[test]
fn dependency_order_and_cycles() {
    let mut project = offline_project("p");
    let mut a = base_service();
    a.depends_on = vec!["b".to_string()];
    let mut b = base_service();
    b.depends_on = vec!["c".to_string()];
    project.services.insert("a".to_string(), a);
    project.services.insert("b".to_string(), b);
    project.services.insert("c".to_string(), base_service());

    assert_eq!(project.topological_order().unwrap(), vec!["c", "b", "a"]);

    project.services.get_mut("c").unwrap().depends_on = vec!["a".to_string()];
    match project.topological_order() {
        Err(Error::DependencyError(_)) => {}
        other => panic!("expected DependencyError, got {other:?}"),
    }
}

// =============================================================================
// Up Failure Gates
// =============================================================================

#[tokio::test]
async fn unknown_image_maps_to_exit_code_4() {
    let temp = TempDir::new().unwrap();
    let surge = surge(&temp);

    let mut project = offline_project("p");
    let mut svc = ServiceSpec::default();
    svc.image = Some("acme/absent:latest".to_string());
    project.services.insert("web".to_string(), svc);

    let err = surge.up(&project).await.unwrap_err();
    assert!(matches!(err, Error::ImageNotFound { .. }));
    assert_eq!(err.exit_code(), 4);
}

#[tokio::test]
async fn quota_violation_maps_to_exit_code_5() {
    let temp = TempDir::new().unwrap();
    let surge = surge(&temp);

    let mut project = offline_project("p");
    let mut svc = base_service();
    // Over the default user quota of 64 cores.
    svc.resources = ServiceResources {
        cpu: 100.0,
        memory_gb: 1.0,
        storage_gb: 1.0,
    };
    project.services.insert("hungry".to_string(), svc);

    let err = surge.up(&project).await.unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded { .. }));
    assert_eq!(err.exit_code(), 5);

    // The failed allocation left the default quotas untouched.
    let quota = surge.quotas().get("user-default").unwrap();
    assert_eq!(quota.limits[&strato::ResourceKind::Cpu].used, 0);
}

#[tokio::test]
async fn impossible_placement_maps_to_exit_code_6() {
    let temp = TempDir::new().unwrap();
    let surge = surge(&temp);

    let mut project = offline_project("p");
    let mut svc = base_service();
    // Within quota, far beyond any node's storage capacity.
    svc.resources = ServiceResources {
        cpu: 1.0,
        memory_gb: 1.0,
        storage_gb: 100_000.0,
    };
    project.services.insert("vast".to_string(), svc);

    let err = surge.up(&project).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientResources(_)));
    assert_eq!(err.exit_code(), 6);

    // Quota debits from the failed placement were rolled back.
    let quota = surge.quotas().get("user-default").unwrap();
    assert_eq!(quota.limits[&strato::ResourceKind::Cpu].used, 0);
}

#[tokio::test]
async fn invalid_project_maps_to_exit_code_2() {
    let temp = TempDir::new().unwrap();
    let surge = surge(&temp);

    let mut project = offline_project("");
    project.services.insert("web".to_string(), base_service());

    let err = surge.up(&project).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn empty_project_up_succeeds_and_creates_default_network() {
    let temp = TempDir::new().unwrap();
    let surge = surge(&temp);

    let project = offline_project("quiet");
    let report = surge.up(&project).await.unwrap();

    assert!(report.started.is_empty());
    assert_eq!(report.networks, vec!["quiet-default"]);
    // The local node registered and became active.
    let nodes = surge.cluster().nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].state, strato::NodeState::Active);

    surge.down(&project, false).await.unwrap();
}

// =============================================================================
// Exit-Code Mapping
// =============================================================================

#[test]
fn error_taxonomy_maps_to_documented_exit_codes() {
    assert_eq!(Error::InvalidSpec("x".to_string()).exit_code(), 2);
    assert_eq!(Error::DependencyError("cycle".to_string()).exit_code(), 3);
    assert_eq!(
        Error::ImageNotFound {
            reference: "x".to_string()
        }
        .exit_code(),
        4
    );
    assert_eq!(
        Error::QuotaExceeded {
            quota: "q".to_string(),
            resource: "cpu".to_string(),
            requested: 1,
            limit: 0,
        }
        .exit_code(),
        5
    );
    assert_eq!(Error::InsufficientResources("none".to_string()).exit_code(), 6);
    assert_eq!(
        Error::NodeUnreachable {
            node: "n".to_string()
        }
        .exit_code(),
        7
    );
    assert_eq!(Error::NetworkError("other".to_string()).exit_code(), 1);
}
