//! # Network Fabric
//!
//! Three concerns, one component: encrypted node-to-node transport,
//! a TTL'd service registry, and name resolution over both. The
//! cluster manager deploys capsules through it, Surge registers
//! services in it, and snapshots travel across it during migration.
//!
//! Control traffic uses plaintext line messages (`DEPLOY_CAPSULE:…`,
//! `REGISTER_SERVICE:…`, `HEARTBEAT:…`); application traffic is
//! sealed per service key. See [`transport`] for the wire discipline.

mod registry;
mod resolver;
mod transport;

pub use registry::{PeerInfo, ServiceEndpoint, ServiceRegistry};
pub use resolver::{Record, Resolver};
pub use transport::{Envelope, Frame, Inbound, ServiceKey, Transport};

use crate::constants::{DEFAULT_FABRIC_PORT, HEARTBEAT_INTERVAL};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// =============================================================================
// Control Messages
// =============================================================================

/// Plaintext control message exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Instructs the receiving node to run a scheduled capsule.
    DeployCapsule { capsule_id: String },
    /// Announces a service endpoint to a peer.
    RegisterService { name: String, port: u16 },
    /// Liveness + usage report; refreshes registry TTLs.
    Heartbeat { node_id: String, usage: String },
    /// Remote name-resolution query.
    Resolve { name: String },
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::DeployCapsule { capsule_id } => write!(f, "DEPLOY_CAPSULE:{capsule_id}"),
            ControlMessage::RegisterService { name, port } => write!(f, "REGISTER_SERVICE:{name}:{port}"),
            ControlMessage::Heartbeat { node_id, usage } => write!(f, "HEARTBEAT:{node_id}:{usage}"),
            ControlMessage::Resolve { name } => write!(f, "RESOLVE:{name}"),
        }
    }
}

impl FromStr for ControlMessage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (verb, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidContent(format!("malformed control message '{s}'")))?;
        match verb {
            "DEPLOY_CAPSULE" => Ok(ControlMessage::DeployCapsule {
                capsule_id: rest.to_string(),
            }),
            "REGISTER_SERVICE" => {
                let (name, port) = rest
                    .split_once(':')
                    .ok_or_else(|| Error::InvalidContent(format!("malformed REGISTER_SERVICE '{rest}'")))?;
                Ok(ControlMessage::RegisterService {
                    name: name.to_string(),
                    port: port
                        .parse()
                        .map_err(|_| Error::InvalidContent(format!("bad port '{port}'")))?,
                })
            }
            "HEARTBEAT" => {
                let (node_id, usage) = rest
                    .split_once(':')
                    .ok_or_else(|| Error::InvalidContent(format!("malformed HEARTBEAT '{rest}'")))?;
                Ok(ControlMessage::Heartbeat {
                    node_id: node_id.to_string(),
                    usage: usage.to_string(),
                })
            }
            "RESOLVE" => Ok(ControlMessage::Resolve {
                name: rest.to_string(),
            }),
            other => Err(Error::InvalidContent(format!("unknown control verb '{other}'"))),
        }
    }
}

// =============================================================================
// Configuration & Events
// =============================================================================

/// Fabric configuration (the `fabric` project-spec section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    #[serde(default = "default_true")]
    pub encryption: bool,
    #[serde(default = "default_true")]
    pub service_discovery: bool,
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    DEFAULT_FABRIC_PORT
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            node_id: None,
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            encryption: true,
            service_discovery: true,
        }
    }
}

/// Fabric event delivered to the node's consumer (cluster manager).
#[derive(Debug)]
pub enum FabricEvent {
    /// Control message from a peer.
    Control { from: SocketAddr, message: ControlMessage },
    /// Decrypted application payload addressed to a local service.
    ServiceMessage {
        from: SocketAddr,
        service: String,
        payload: Vec<u8>,
    },
}

// =============================================================================
// Fabric
// =============================================================================

/// The assembled fabric: transport + registry + resolver.
pub struct Fabric {
    node_id: String,
    transport: Arc<Transport>,
    registry: Arc<ServiceRegistry>,
    resolver: Arc<Resolver>,
    encryption: bool,
}

impl Fabric {
    /// Binds the transport and starts the inbound dispatch loop.
    ///
    /// Returns the fabric and the stream of events for the node's
    /// control plane.
    pub async fn start(config: &FabricConfig, domain: &str) -> Result<(Arc<Self>, mpsc::Receiver<FabricEvent>)> {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", chrono::Utc::now().timestamp()));
        let bind: SocketAddr = format!("{}:{}", config.bind_address, config.bind_port)
            .parse()
            .map_err(|e| Error::InvalidConfiguration(format!("fabric bind address: {e}")))?;

        let (transport, inbound_rx) = Transport::bind(bind, &node_id).await?;
        let registry = Arc::new(ServiceRegistry::new());
        let resolver = Arc::new(Resolver::new(domain, Arc::clone(&registry)));

        let fabric = Arc::new(Self {
            node_id,
            transport,
            registry,
            resolver,
            encryption: config.encryption,
        });

        let (event_tx, event_rx) = mpsc::channel(256);
        tokio::spawn(Self::dispatch_loop(Arc::clone(&fabric), inbound_rx, event_tx));

        info!(node = %fabric.node_id, addr = %fabric.transport.local_addr(), "fabric started");
        Ok((fabric, event_rx))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Registers a local service and returns its key (when encrypting).
    pub fn register_service(
        &self,
        name: &str,
        address: &str,
        port: u16,
    ) -> Option<ServiceKey> {
        let key = self.encryption.then(ServiceKey::generate);
        self.registry.register(ServiceEndpoint {
            name: name.to_string(),
            address: address.to_string(),
            port,
            protocol: "quic".to_string(),
            encryption_key: key.clone(),
        });
        key
    }

    /// Sends an encrypted payload to a service, resolving it first.
    pub async fn send_to_service(&self, service: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let endpoint = self
            .registry
            .lookup(service)
            .ok_or_else(|| Error::ServiceDiscoveryFailed {
                name: service.to_string(),
            })?;

        let frame = match &endpoint.encryption_key {
            Some(key) => Frame::Service(key.seal(service, payload)?),
            None => Frame::Service(Envelope {
                dest_service: service.to_string(),
                nonce: Vec::new(),
                ciphertext: payload.to_vec(),
            }),
        };

        let peer: SocketAddr = format!("{}:{}", endpoint.address, endpoint.port)
            .parse()
            .map_err(|e| Error::ConnectionFailed {
                peer: format!("{}:{}", endpoint.address, endpoint.port),
                reason: format!("bad endpoint address: {e}"),
            })?;

        match self.transport.request(peer, &frame).await? {
            Frame::Reply(data) => Ok(data),
            other => Err(Error::ConnectionFailed {
                peer: peer.to_string(),
                reason: format!("unexpected reply frame {other:?}"),
            }),
        }
    }

    /// Sends a control message to a peer node.
    pub async fn send_control(&self, peer: SocketAddr, message: &ControlMessage) -> Result<()> {
        let frame = Frame::Control(message.to_string());
        self.transport.request(peer, &frame).await.map(|_| ())
    }

    /// Resolves a name, consulting peers on local miss.
    pub async fn resolve(&self, name: &str) -> Result<Record> {
        let peers = self.registry.peers();
        let transport = Arc::clone(&self.transport);
        self.resolver
            .resolve_with(name, move |form| {
                let peers = peers.clone();
                let transport = Arc::clone(&transport);
                async move {
                    for peer in &peers {
                        let frame = Frame::Control(ControlMessage::Resolve { name: form.clone() }.to_string());
                        if let Ok(Frame::Reply(data)) = transport.request(peer.address, &frame).await
                            && !data.is_empty()
                            && let Ok(record) = serde_json::from_slice::<Record>(&data)
                        {
                            return Some(record);
                        }
                    }
                    None
                }
            })
            .await
    }

    /// Spawns the periodic heartbeat towards every known peer.
    ///
    /// `usage` is rendered by the caller (the cluster manager) so the
    /// fabric stays ignorant of resource bookkeeping.
    pub fn spawn_heartbeat<F>(self: Arc<Self>, usage: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        let fabric = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                let message = ControlMessage::Heartbeat {
                    node_id: fabric.node_id.clone(),
                    usage: usage(),
                };
                for peer in fabric.registry.peers() {
                    if let Err(e) = fabric.send_control(peer.address, &message).await {
                        debug!(peer = %peer.node_id, error = %e, "heartbeat delivery failed");
                    }
                }
                // Local registrations stay alive as long as we do.
                for endpoint in fabric.registry.list() {
                    let _ = fabric.registry.refresh(&endpoint.name);
                }
                fabric.registry.prune_expired();
                fabric.resolver.prune_cache();
            }
        })
    }

    /// Routes inbound frames: answers resolution queries, decrypts
    /// service payloads, and forwards the rest to the event stream.
    async fn dispatch_loop(
        fabric: Arc<Self>,
        mut inbound: mpsc::Receiver<Inbound>,
        events: mpsc::Sender<FabricEvent>,
    ) {
        while let Some(Inbound { from, frame, reply }) = inbound.recv().await {
            match frame {
                Frame::Control(raw) => match raw.parse::<ControlMessage>() {
                    Ok(ControlMessage::Resolve { name }) => {
                        let answer = fabric
                            .resolver
                            .resolve_local(&name)
                            .and_then(|record| serde_json::to_vec(&record).ok())
                            .unwrap_or_default();
                        let _ = reply.send(Frame::Reply(answer));
                    }
                    Ok(message) => {
                        if let ControlMessage::Heartbeat { node_id, .. } = &message {
                            fabric.registry.upsert_peer(node_id.clone(), from);
                        }
                        let _ = reply.send(Frame::Reply(b"ok".to_vec()));
                        if events.send(FabricEvent::Control { from, message }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%from, error = %e, "dropping malformed control message");
                        let _ = reply.send(Frame::Reply(Vec::new()));
                    }
                },
                Frame::Service(envelope) => {
                    let service = envelope.dest_service.clone();
                    let opened = match fabric.registry.lookup(&service) {
                        Some(endpoint) => match &endpoint.encryption_key {
                            Some(key) => key.open(&envelope),
                            None => Ok(envelope.ciphertext.clone()),
                        },
                        None => Err(Error::ServiceDiscoveryFailed {
                            name: service.clone(),
                        }),
                    };
                    match opened {
                        Ok(payload) => {
                            let _ = reply.send(Frame::Reply(b"ok".to_vec()));
                            if events
                                .send(FabricEvent::ServiceMessage { from, service, payload })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(%from, service = %service, error = %e, "rejecting service message");
                            let _ = reply.send(Frame::Reply(Vec::new()));
                        }
                    }
                }
                Frame::Reply(_) => {
                    // Replies never arrive as fresh streams.
                    let _ = reply.send(Frame::Reply(Vec::new()));
                }
            }
        }
        debug!("fabric dispatch loop ended");
    }

    /// Tears the fabric down (orchestrator `down`).
    pub fn shutdown(&self) {
        self.resolver.clear();
        self.transport.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_roundtrip() {
        for message in [
            ControlMessage::DeployCapsule {
                capsule_id: "abc123".to_string(),
            },
            ControlMessage::RegisterService {
                name: "web".to_string(),
                port: 8080,
            },
            ControlMessage::Heartbeat {
                node_id: "node-1".to_string(),
                usage: "cpu=2.5,memory=4,storage=10".to_string(),
            },
            ControlMessage::Resolve {
                name: "db.proj.local".to_string(),
            },
        ] {
            let parsed: ControlMessage = message.to_string().parse().unwrap();
            assert_eq!(parsed, message);
        }
    }

    #[test]
    fn malformed_control_messages_are_rejected() {
        assert!("".parse::<ControlMessage>().is_err());
        assert!("DEPLOY_CAPSULE".parse::<ControlMessage>().is_err());
        assert!("REGISTER_SERVICE:web".parse::<ControlMessage>().is_err());
        assert!("NOPE:x".parse::<ControlMessage>().is_err());
    }
}
