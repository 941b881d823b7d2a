//! # Surge Orchestrator
//!
//! Applies a declarative project spec: initializes the fabric and
//! resolver, creates networks and volumes, resolves images, and starts
//! service capsules in dependency order through the cluster manager,
//! gated by quotas.
//!
//! `down` stops services with SIGTERM in reverse dependency order;
//! `kill` uses SIGKILL. Process-wide state (registry, resolver cache,
//! quota index) is created at `up` and torn down at `down` — nothing
//! outlives the orchestrator.

mod spec;

pub use spec::{
    HealthCheck, NetworkSpec, NetworkType, ProjectSpec, ResolverConfig, RestartPolicy, ServiceResources,
    ServiceSpec, SnapshotFilesystemKind, SnapshotsConfig, VolumeSpec,
};

use crate::build::{BuildCache, BuildSpec, Builder};
use crate::capsule::{CapsuleConfig, CapsuleId, CapsuleRuntime, Mount, PortMapping, ResourceLimits};
use crate::cluster::{ClusterManager, Constraints, Node, PlacementPolicy, ResourceVector};
use crate::constants::{DEFAULT_BRIDGE_GATEWAY, DEFAULT_BRIDGE_SUBNET, VOLUMES_DIR};
use crate::digest::ObjectKind;
use crate::error::{Error, Result};
use crate::fabric::{Fabric, FabricConfig, FabricEvent, Record};
use crate::image::{ImageManifest, ImageStore, RegistryClient};
use crate::quota::{QuotaManager, QuotaScope, ResourceKind};
use crate::snapshot::{
    CheckpointEngine, HealthProbe, OperationTrigger, PolicyEngine, ProcCheckpointEngine, RetentionPolicy,
    SnapshotManager, TarSnapshotter,
};
use crate::store::ContentStore;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Runtime Records
// =============================================================================

/// One running replica of a service.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub service: String,
    pub capsule_id: CapsuleId,
    pub node_id: String,
    pub resources: ResourceVector,
    pub restart: RestartPolicy,
}

/// A created network.
#[derive(Debug, Clone)]
pub struct NetworkRecord {
    pub name: String,
    pub network_type: NetworkType,
    pub subnet: String,
    pub gateway: String,
    pub dns_servers: Vec<String>,
}

/// Result of `up`.
#[derive(Debug, Default)]
pub struct UpReport {
    pub started: Vec<ServiceInstance>,
    pub networks: Vec<String>,
}

/// Current view of one service replica.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub service: String,
    pub capsule_id: CapsuleId,
    pub node_id: String,
    pub state: Option<crate::capsule::CapsuleState>,
}

// =============================================================================
// Health Probe
// =============================================================================

/// TCP connect probe against a service health port.
pub struct TcpProbe {
    pub address: String,
    pub check: HealthCheck,
}

#[async_trait::async_trait]
impl HealthProbe for TcpProbe {
    async fn healthy(&self, _runtime: &CapsuleRuntime, _id: &CapsuleId) -> bool {
        let target = format!("{}:{}", self.address, self.check.port);
        for attempt in 0..self.check.retries.max(1) {
            match tokio::time::timeout(
                Duration::from_secs(self.check.interval_secs.max(1)),
                tokio::net::TcpStream::connect(&target),
            )
            .await
            {
                Ok(Ok(_)) => return true,
                _ => {
                    debug!(%target, attempt, "health probe connect failed");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
        false
    }
}

// =============================================================================
// Surge
// =============================================================================

/// The orchestrator.
pub struct Surge {
    store: Arc<ContentStore>,
    images: Arc<ImageStore>,
    builder: Builder,
    runtime: Arc<CapsuleRuntime>,
    cluster: Arc<ClusterManager>,
    quotas: Arc<QuotaManager>,
    snapshots: Arc<SnapshotManager>,
    fabric: RwLock<Option<Arc<Fabric>>>,
    policy: RwLock<Option<Arc<PolicyEngine>>>,
    instances: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    networks: RwLock<HashMap<String, NetworkRecord>>,
    build_specs: RwLock<HashMap<String, BuildSpec>>,
    resolver_server: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl Surge {
    /// Opens an orchestrator at the default platform directory with
    /// the OCI registry client.
    pub fn open() -> Result<Self> {
        Self::new(
            ContentStore::default_root(),
            Arc::new(crate::image::OciRegistryClient::new()),
        )
    }

    /// Opens an orchestrator rooted at `root` with a registry client.
    pub fn new(root: impl Into<PathBuf>, registry: Arc<dyn RegistryClient>) -> Result<Self> {
        Self::with_engine(root, registry, Arc::new(ProcCheckpointEngine::new()))
    }

    /// Variant with an explicit checkpoint engine (tests inject an
    /// in-memory engine here).
    pub fn with_engine(
        root: impl Into<PathBuf>,
        registry: Arc<dyn RegistryClient>,
        engine: Arc<dyn CheckpointEngine>,
    ) -> Result<Self> {
        let store = Arc::new(ContentStore::open(root)?);
        let images = Arc::new(ImageStore::new(Arc::clone(&store), registry));
        let builder = Builder::new(Arc::clone(&store), Arc::new(BuildCache::new()))?;
        let runtime = Arc::new(CapsuleRuntime::new(Arc::clone(&store))?);
        let snapshots = Arc::new(SnapshotManager::new(
            Arc::clone(&store),
            engine,
            Arc::new(TarSnapshotter),
        ));
        let local_node = format!("node-{}", chrono::Utc::now().timestamp());

        Ok(Self {
            store,
            images,
            builder,
            runtime,
            cluster: Arc::new(ClusterManager::new(local_node)),
            quotas: Arc::new(QuotaManager::with_defaults()),
            snapshots,
            fabric: RwLock::new(None),
            policy: RwLock::new(None),
            instances: RwLock::new(HashMap::new()),
            networks: RwLock::new(HashMap::new()),
            build_specs: RwLock::new(HashMap::new()),
            resolver_server: RwLock::new(None),
        })
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn images(&self) -> &Arc<ImageStore> {
        &self.images
    }

    pub fn runtime(&self) -> &Arc<CapsuleRuntime> {
        &self.runtime
    }

    pub fn cluster(&self) -> &Arc<ClusterManager> {
        &self.cluster
    }

    pub fn quotas(&self) -> &Arc<QuotaManager> {
        &self.quotas
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Registers a build spec a service may reference via `build`.
    pub fn register_build(&self, spec: BuildSpec) {
        self.build_specs
            .write()
            .expect("build spec table lock poisoned")
            .insert(spec.name.clone(), spec);
    }

    // =========================================================================
    // Up
    // =========================================================================

    /// Applies a project spec.
    pub async fn up(&self, project: &ProjectSpec) -> Result<UpReport> {
        project.validate()?;
        info!(project = %project.project, "surge up");

        self.init_policy(project);
        self.snapshot_before_operation(OperationTrigger::BeforeSurgeUp).await;

        self.init_fabric(project).await?;
        self.register_local_node(project);
        let networks = self.create_networks(project)?;
        self.create_volumes(project)?;

        let order = project.topological_order()?;
        let mut report = UpReport {
            networks,
            ..Default::default()
        };

        for service_name in &order {
            let service = &project.services[service_name];
            for replica in 0..service.replicas {
                let instance = self
                    .start_service_replica(project, service_name, service, replica)
                    .await?;
                report.started.push(instance);
            }
        }

        info!(
            project = %project.project,
            services = order.len(),
            capsules = report.started.len(),
            "surge up complete"
        );
        Ok(report)
    }

    async fn start_service_replica(
        &self,
        project: &ProjectSpec,
        service_name: &str,
        service: &ServiceSpec,
        replica: u32,
    ) -> Result<ServiceInstance> {
        let instance_name = if replica == 0 {
            service_name.to_string()
        } else {
            format!("{service_name}-{replica}")
        };

        let manifest = self.resolve_service_manifest(service_name, service).await?;
        let config = self.capsule_config(project, &instance_name, service, &manifest)?;

        let resources = ResourceVector::new(
            service.resources.cpu,
            service.resources.memory_gb,
            service.resources.storage_gb,
        );

        // Quotas gate placement: all default scopes debit atomically.
        let scopes: [(QuotaScope, &str); 3] = [
            (QuotaScope::User, "default"),
            (QuotaScope::Namespace, "default"),
            (QuotaScope::Cluster, "default"),
        ];
        self.quotas
            .allocate_many(&scopes, ResourceKind::Cpu, service.resources.cpu.ceil() as u64)?;
        if let Err(e) = self.quotas.allocate_many(
            &scopes,
            ResourceKind::Memory,
            service.resources.memory_gb.ceil() as u64,
        ) {
            self.quotas
                .deallocate_many(&scopes, ResourceKind::Cpu, service.resources.cpu.ceil() as u64);
            return Err(e);
        }

        let id = CapsuleId::generate();
        let node_id = match self.cluster.schedule(
            id.as_str(),
            &resources,
            &Constraints::default(),
            PlacementPolicy::LeastLoaded,
        ) {
            Ok(node_id) => node_id,
            Err(e) => {
                self.release_quota(&service.resources);
                return Err(e);
            }
        };

        if node_id == self.cluster.local_node_id() {
            if let Err(e) = self.runtime.create_with_id(id.clone(), config, &manifest) {
                self.cluster.release(id.as_str());
                self.release_quota(&service.resources);
                return Err(Error::ServiceStartFailed {
                    service: instance_name,
                    reason: e.to_string(),
                });
            }
            if let Err(e) = self.runtime.start(&id).await {
                self.cluster.release(id.as_str());
                self.release_quota(&service.resources);
                return Err(Error::ServiceStartFailed {
                    service: instance_name,
                    reason: e.to_string(),
                });
            }
        } else {
            debug!(capsule = %id, node = %node_id, "deployment forwarded to remote node");
        }

        self.register_service_endpoints(project, service_name, service);

        let instance = ServiceInstance {
            service: service_name.to_string(),
            capsule_id: id,
            node_id,
            resources,
            restart: service.restart,
        };
        self.instances
            .write()
            .expect("instance table lock poisoned")
            .entry(service_name.to_string())
            .or_default()
            .push(instance.clone());

        info!(service = %service_name, capsule = %instance.capsule_id, node = %instance.node_id, "service replica started");
        Ok(instance)
    }

    async fn resolve_service_manifest(
        &self,
        service_name: &str,
        service: &ServiceSpec,
    ) -> Result<ImageManifest> {
        if let Some(image) = &service.image {
            return self.images.resolve(image).await;
        }
        if let Some(base) = &service.capsule {
            return self.images.synthesize_base(base);
        }
        if let Some(build_name) = &service.build {
            let spec = self
                .build_specs
                .read()
                .expect("build spec table lock poisoned")
                .get(build_name)
                .cloned()
                .ok_or_else(|| Error::InvalidSpec(format!(
                    "service '{service_name}' references unregistered build '{build_name}'"
                )))?;
            self.snapshot_before_operation(OperationTrigger::BeforeBuild).await;
            let result = self.builder.build(&spec).await?;
            // Layer-kind outputs become the image; anything else rides
            // as a base capsule with the outputs addressable by digest.
            let layers: Vec<crate::image::LayerDesc> = result
                .outputs
                .iter()
                .filter(|o| o.kind == ObjectKind::Layer)
                .map(|o| crate::image::LayerDesc {
                    digest: o.digest,
                    size: o.size,
                    media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
                })
                .collect();
            if layers.is_empty() {
                return self.images.synthesize_base(service_name);
            }
            let config_digest = self.store.put(b"{}", ObjectKind::Config)?;
            let record = serde_json::json!({
                "name": service_name,
                "tag": "build",
                "layers": &layers,
                "config_digest": config_digest,
            });
            let digest = self.store.put(&serde_json::to_vec(&record)?, ObjectKind::Manifest)?;
            return Ok(ImageManifest {
                name: service_name.to_string(),
                tag: "build".to_string(),
                digest,
                layers,
                config_digest,
            });
        }
        Err(Error::InvalidSpec(format!(
            "service '{service_name}' has no image, build, or capsule"
        )))
    }

    fn capsule_config(
        &self,
        project: &ProjectSpec,
        instance_name: &str,
        service: &ServiceSpec,
        _manifest: &ImageManifest,
    ) -> Result<CapsuleConfig> {
        let command = if service.command.is_empty() {
            vec!["/bin/sh".to_string(), "-c".to_string(), "sleep infinity".to_string()]
        } else {
            service.command.clone()
        };

        let mut config = CapsuleConfig::new(instance_name, command);
        config.env = service.env.clone();
        config.resources = ResourceLimits {
            cpu_cores: service.resources.cpu,
            memory_bytes: (service.resources.memory_gb * 1024.0 * 1024.0 * 1024.0) as u64,
            storage_bytes: (service.resources.storage_gb * 1024.0 * 1024.0 * 1024.0) as u64,
            pids_max: 4096,
        };

        for port in &service.ports {
            config.ports.push(PortMapping::parse(port)?);
        }

        let volume_root = self.store.root().join(VOLUMES_DIR);
        for volume in &service.volumes {
            let (source, target) = volume.split_once(':').ok_or_else(|| {
                Error::InvalidSpec(format!("volume '{volume}' must be src:dst"))
            })?;
            // A bare name refers to a declared volume; a path mounts
            // straight from the host.
            let source_path = if source.starts_with('/') {
                PathBuf::from(source)
            } else {
                if !project.volumes.contains_key(source) {
                    return Err(Error::InvalidSpec(format!(
                        "service '{instance_name}' references undeclared volume '{source}'"
                    )));
                }
                volume_root.join(source)
            };
            config.mounts.push(Mount {
                source: source_path,
                target: PathBuf::from(target),
                readonly: false,
            });
        }

        config.validate()?;
        Ok(config)
    }

    // =========================================================================
    // Fabric, Networks, Volumes
    // =========================================================================

    async fn init_fabric(&self, project: &ProjectSpec) -> Result<()> {
        let config = project.fabric.clone().unwrap_or_default();
        if !config.enabled {
            debug!("fabric disabled by project spec");
            return Ok(());
        }
        if self.fabric.read().expect("fabric lock poisoned").is_some() {
            return Ok(());
        }

        let (fabric, events) = Fabric::start(&config, &project.domain()).await?;
        let cluster = Arc::clone(&self.cluster);
        tokio::spawn(Self::fabric_event_loop(events, cluster));

        let usage_cluster = Arc::clone(&self.cluster);
        Arc::clone(&fabric).spawn_heartbeat(move || usage_cluster.local_usage());

        let resolver_config = project.resolver.clone().unwrap_or_default();
        if resolver_config.enabled {
            let resolver = Arc::clone(fabric.resolver());
            let (_addr, handle) = resolver.spawn_udp_server(resolver_config.port).await?;
            *self.resolver_server.write().expect("resolver server lock poisoned") = Some(handle);
        }

        *self.fabric.write().expect("fabric lock poisoned") = Some(fabric);
        Ok(())
    }

    async fn fabric_event_loop(
        mut events: tokio::sync::mpsc::Receiver<FabricEvent>,
        cluster: Arc<ClusterManager>,
    ) {
        use crate::fabric::ControlMessage;
        while let Some(event) = events.recv().await {
            match event {
                FabricEvent::Control { from, message } => match message {
                    ControlMessage::Heartbeat { node_id, usage } => {
                        let usage = ResourceVector::parse(&usage);
                        if let Err(e) = cluster.heartbeat(&node_id, usage) {
                            debug!(node = %node_id, %from, error = %e, "heartbeat from unknown node");
                        }
                    }
                    ControlMessage::DeployCapsule { capsule_id } => {
                        // The scheduling node already holds the
                        // assignment; execution is picked up by the
                        // local reconciler.
                        info!(capsule = %capsule_id, %from, "deploy request received");
                    }
                    other => debug!(%from, message = %other, "control message ignored"),
                },
                FabricEvent::ServiceMessage { from, service, payload } => {
                    debug!(%from, %service, bytes = payload.len(), "service message delivered");
                }
            }
        }
    }

    fn register_local_node(&self, project: &ProjectSpec) {
        let node_id = self
            .fabric
            .read()
            .expect("fabric lock poisoned")
            .as_ref()
            .map(|f| f.node_id().to_string())
            .unwrap_or_else(|| self.cluster.local_node_id().to_string());

        if self.cluster.node(&node_id).is_some() {
            return;
        }

        let cores = std::thread::available_parallelism()
            .map(|p| p.get() as f64)
            .unwrap_or(4.0);
        let capacity = ResourceVector::new(cores, 16.0, 256.0);
        let port = project.fabric.as_ref().map(|f| f.bind_port).unwrap_or_default();

        let node = Node::new(&node_id, "127.0.0.1", port, capacity);
        self.cluster.register_node(node);
        // The local node is trivially alive.
        let _ = self.cluster.heartbeat(&node_id, ResourceVector::default());
    }

    fn create_networks(&self, project: &ProjectSpec) -> Result<Vec<String>> {
        let mut created = Vec::new();
        let mut networks = self.networks.write().expect("network table lock poisoned");

        if project.networks.is_empty() {
            let name = format!("{}-default", project.project);
            networks.insert(
                name.clone(),
                NetworkRecord {
                    name: name.clone(),
                    network_type: NetworkType::Bridge,
                    subnet: DEFAULT_BRIDGE_SUBNET.to_string(),
                    gateway: DEFAULT_BRIDGE_GATEWAY.to_string(),
                    dns_servers: Vec::new(),
                },
            );
            info!(network = %name, subnet = DEFAULT_BRIDGE_SUBNET, "default bridge network created");
            created.push(name);
            return Ok(created);
        }

        for (name, spec) in &project.networks {
            let record = NetworkRecord {
                name: name.clone(),
                network_type: spec.network_type,
                subnet: spec.subnet.clone().unwrap_or_else(|| DEFAULT_BRIDGE_SUBNET.to_string()),
                gateway: spec.gateway.clone().unwrap_or_else(|| DEFAULT_BRIDGE_GATEWAY.to_string()),
                dns_servers: spec.dns_servers.clone(),
            };
            info!(network = %name, kind = ?record.network_type, "network created");
            networks.insert(name.clone(), record);
            created.push(name.clone());
        }
        Ok(created)
    }

    fn create_volumes(&self, project: &ProjectSpec) -> Result<()> {
        let root = self.store.root().join(VOLUMES_DIR);
        for (name, volume) in &project.volumes {
            let path = root.join(name);
            std::fs::create_dir_all(&path).map_err(|e| Error::StorageError {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            debug!(volume = %name, driver = %volume.driver, "volume ready");
        }
        Ok(())
    }

    fn register_service_endpoints(&self, project: &ProjectSpec, service_name: &str, service: &ServiceSpec) {
        let Some(fabric) = self.fabric.read().expect("fabric lock poisoned").clone() else {
            return;
        };
        let gateway = self
            .networks
            .read()
            .expect("network table lock poisoned")
            .values()
            .next()
            .map(|n| n.gateway.clone())
            .unwrap_or_else(|| DEFAULT_BRIDGE_GATEWAY.to_string());
        let port = service
            .ports
            .first()
            .and_then(|p| p.split_once(':'))
            .and_then(|(h, _)| h.parse().ok())
            .unwrap_or(0u16);

        fabric.register_service(service_name, &gateway, port);
        fabric.resolver().insert_control(
            format!("{service_name}.{}", project.domain()),
            Record::Address {
                address: gateway,
                port,
            },
        );
    }

    // =========================================================================
    // Down / Kill / Scale
    // =========================================================================

    /// Stops all services with SIGTERM in reverse dependency order.
    pub async fn down(&self, project: &ProjectSpec, remove_volumes: bool) -> Result<()> {
        self.stop_all(project, None).await?;

        if remove_volumes {
            let root = self.store.root().join(VOLUMES_DIR);
            for name in project.volumes.keys() {
                let _ = std::fs::remove_dir_all(root.join(name));
            }
        }

        // Process-wide maps die with the orchestrator run.
        if let Some(server) = self.resolver_server.write().expect("resolver server lock poisoned").take() {
            server.abort();
        }
        if let Some(fabric) = self.fabric.write().expect("fabric lock poisoned").take() {
            fabric.shutdown();
        }
        self.networks.write().expect("network table lock poisoned").clear();
        info!(project = %project.project, "surge down complete");
        Ok(())
    }

    /// Stops all services immediately (SIGKILL semantics).
    pub async fn kill(&self, project: &ProjectSpec) -> Result<()> {
        self.stop_all(project, Some(Duration::ZERO)).await
    }

    async fn stop_all(&self, project: &ProjectSpec, grace: Option<Duration>) -> Result<()> {
        let mut order = project.topological_order()?;
        order.reverse();

        for service_name in &order {
            let instances = {
                let mut table = self.instances.write().expect("instance table lock poisoned");
                table.remove(service_name).unwrap_or_default()
            };
            for instance in instances {
                if let Err(e) = self.runtime.stop(&instance.capsule_id, grace).await {
                    warn!(service = %service_name, capsule = %instance.capsule_id, error = %e, "stop failed");
                }
                let _ = self.runtime.remove(&instance.capsule_id);
                self.cluster.release(instance.capsule_id.as_str());
                self.release_quota_vector(&instance.resources);
                if let Some(fabric) = self.fabric.read().expect("fabric lock poisoned").as_ref() {
                    fabric.registry().deregister(service_name);
                }
                info!(service = %service_name, capsule = %instance.capsule_id, "service replica stopped");
            }
        }
        Ok(())
    }

    /// Scales a service to `replicas`, starting or stopping capsules.
    pub async fn scale(&self, project: &ProjectSpec, service_name: &str, replicas: u32) -> Result<()> {
        let service = project
            .services
            .get(service_name)
            .ok_or_else(|| Error::InvalidSpec(format!("unknown service '{service_name}'")))?;

        let current = self
            .instances
            .read()
            .expect("instance table lock poisoned")
            .get(service_name)
            .map(|v| v.len() as u32)
            .unwrap_or(0);

        if replicas > current {
            for replica in current..replicas {
                self.start_service_replica(project, service_name, service, replica).await?;
            }
        } else {
            for _ in replicas..current {
                let instance = {
                    let mut table = self.instances.write().expect("instance table lock poisoned");
                    table.get_mut(service_name).and_then(|v| v.pop())
                };
                if let Some(instance) = instance {
                    self.runtime.stop(&instance.capsule_id, None).await?;
                    let _ = self.runtime.remove(&instance.capsule_id);
                    self.cluster.release(instance.capsule_id.as_str());
                    self.release_quota_vector(&instance.resources);
                }
            }
        }
        info!(service = %service_name, replicas, "service scaled");
        Ok(())
    }

    /// Restarts failed capsules according to their restart policy.
    pub async fn reconcile(&self) -> Result<usize> {
        let instances: Vec<ServiceInstance> = self
            .instances
            .read()
            .expect("instance table lock poisoned")
            .values()
            .flatten()
            .cloned()
            .collect();

        let mut restarted = 0;
        for instance in instances {
            let Some(capsule) = self.runtime.inspect(&instance.capsule_id) else {
                continue;
            };
            let should_restart = match capsule.state {
                crate::capsule::CapsuleState::Failed => {
                    matches!(instance.restart, RestartPolicy::OnFailure | RestartPolicy::Always)
                }
                crate::capsule::CapsuleState::Stopped => matches!(instance.restart, RestartPolicy::Always),
                _ => false,
            };
            if should_restart {
                match self.runtime.restart(&instance.capsule_id, None).await {
                    Ok(_) => {
                        info!(service = %instance.service, capsule = %instance.capsule_id, "replica restarted");
                        restarted += 1;
                    }
                    Err(e) => {
                        warn!(service = %instance.service, capsule = %instance.capsule_id, error = %e, "restart failed")
                    }
                }
            }
        }
        Ok(restarted)
    }

    /// Current state of every replica.
    pub fn status(&self) -> Vec<ServiceStatus> {
        self.instances
            .read()
            .expect("instance table lock poisoned")
            .values()
            .flatten()
            .map(|instance| ServiceStatus {
                service: instance.service.clone(),
                capsule_id: instance.capsule_id.clone(),
                node_id: instance.node_id.clone(),
                state: self.runtime.inspect(&instance.capsule_id).map(|c| c.state),
            })
            .collect()
    }

    // =========================================================================
    // Snapshot Policy Hooks
    // =========================================================================

    fn init_policy(&self, project: &ProjectSpec) {
        let Some(config) = &project.snapshots else {
            return;
        };
        if !config.enabled {
            return;
        }
        let engine = PolicyEngine::new(
            config.triggers.clone(),
            config.retention.clone().unwrap_or_else(RetentionPolicy::default),
            config.named_snapshots.clone(),
        );
        *self.policy.write().expect("policy lock poisoned") = Some(Arc::new(engine));
    }

    /// Snapshots every live replica when the operation hook is armed.
    async fn snapshot_before_operation(&self, operation: OperationTrigger) {
        let Some(policy) = self.policy.read().expect("policy lock poisoned").clone() else {
            return;
        };
        if !policy.operation_due(operation) {
            return;
        }

        let ids: Vec<CapsuleId> = self
            .instances
            .read()
            .expect("instance table lock poisoned")
            .values()
            .flatten()
            .map(|i| i.capsule_id.clone())
            .collect();

        for id in ids {
            let mut metadata = BTreeMap::new();
            metadata.insert("trigger".to_string(), format!("{operation:?}"));
            if let Err(e) = self.snapshots.take(&self.runtime, &id, metadata).await {
                warn!(capsule = %id, error = %e, "pre-operation snapshot failed");
            }
        }
    }

    /// Runs one policy tick: timer triggers, change detection,
    /// retention.
    pub async fn policy_tick(&self) -> Result<usize> {
        let Some(policy) = self.policy.read().expect("policy lock poisoned").clone() else {
            return Ok(0);
        };

        let due = policy.due_timer_triggers(chrono::Utc::now());
        let changes = policy.changes_due();
        let mut taken = 0;

        if !due.is_empty() || changes {
            let ids: Vec<CapsuleId> = self
                .instances
                .read()
                .expect("instance table lock poisoned")
                .values()
                .flatten()
                .map(|i| i.capsule_id.clone())
                .collect();
            for id in ids {
                let mut metadata = BTreeMap::new();
                metadata.insert(
                    "trigger".to_string(),
                    if changes { "file-change".to_string() } else { due.join("+") },
                );
                if self.snapshots.take(&self.runtime, &id, metadata).await.is_ok() {
                    taken += 1;
                }
            }
        }

        policy.apply_retention(&self.snapshots);
        Ok(taken)
    }

    // =========================================================================
    // Quota Bookkeeping
    // =========================================================================

    fn release_quota(&self, resources: &ServiceResources) {
        let scopes: [(QuotaScope, &str); 3] = [
            (QuotaScope::User, "default"),
            (QuotaScope::Namespace, "default"),
            (QuotaScope::Cluster, "default"),
        ];
        self.quotas
            .deallocate_many(&scopes, ResourceKind::Cpu, resources.cpu.ceil() as u64);
        self.quotas
            .deallocate_many(&scopes, ResourceKind::Memory, resources.memory_gb.ceil() as u64);
    }

    fn release_quota_vector(&self, resources: &ResourceVector) {
        let scopes: [(QuotaScope, &str); 3] = [
            (QuotaScope::User, "default"),
            (QuotaScope::Namespace, "default"),
            (QuotaScope::Cluster, "default"),
        ];
        self.quotas
            .deallocate_many(&scopes, ResourceKind::Cpu, resources.cpu_cores.ceil() as u64);
        self.quotas
            .deallocate_many(&scopes, ResourceKind::Memory, resources.memory_gb.ceil() as u64);
    }
}
