//! Service registry and peer table.
//!
//! Each node holds `{service name → endpoint}` for its local services
//! and `{node id → peer info}` for the nodes it knows. Entries carry a
//! TTL and are refreshed by heartbeat; expired entries stop resolving
//! without explicit deregistration.

use crate::constants::REGISTRY_ENTRY_TTL;
use crate::error::{Error, Result};
use crate::fabric::transport::ServiceKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A registered service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    /// Present when fabric encryption is on.
    #[serde(skip)]
    pub encryption_key: Option<ServiceKey>,
}

/// A known peer node.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node_id: String,
    pub address: SocketAddr,
    pub last_seen: Instant,
}

struct Entry {
    endpoint: ServiceEndpoint,
    expires_at: Instant,
}

/// Node-local registry of services and peers.
///
/// Fine-grained locks per map; lookups copy records out so no lock is
/// held across I/O.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Entry>>,
    peers: RwLock<HashMap<String, PeerInfo>>,
    ttl: Duration,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_ttl(REGISTRY_ENTRY_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Registers (or refreshes) a service endpoint.
    pub fn register(&self, endpoint: ServiceEndpoint) {
        let name = endpoint.name.clone();
        let entry = Entry {
            endpoint,
            expires_at: Instant::now() + self.ttl,
        };
        self.services
            .write()
            .expect("service map lock poisoned")
            .insert(name.clone(), entry);
        info!(service = %name, "service registered");
    }

    /// Refreshes a service's TTL without replacing the record.
    pub fn refresh(&self, name: &str) -> Result<()> {
        let mut services = self.services.write().expect("service map lock poisoned");
        let entry = services
            .get_mut(name)
            .ok_or_else(|| Error::ServiceDiscoveryFailed {
                name: name.to_string(),
            })?;
        entry.expires_at = Instant::now() + self.ttl;
        Ok(())
    }

    /// Removes a service.
    pub fn deregister(&self, name: &str) {
        if self
            .services
            .write()
            .expect("service map lock poisoned")
            .remove(name)
            .is_some()
        {
            debug!(service = %name, "service deregistered");
        }
    }

    /// Looks up a live (unexpired) service endpoint.
    pub fn lookup(&self, name: &str) -> Option<ServiceEndpoint> {
        let services = self.services.read().expect("service map lock poisoned");
        services
            .get(name)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.endpoint.clone())
    }

    /// All live service endpoints.
    pub fn list(&self) -> Vec<ServiceEndpoint> {
        let now = Instant::now();
        self.services
            .read()
            .expect("service map lock poisoned")
            .values()
            .filter(|e| e.expires_at > now)
            .map(|e| e.endpoint.clone())
            .collect()
    }

    /// Drops expired service entries; returns how many were pruned.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut services = self.services.write().expect("service map lock poisoned");
        let before = services.len();
        services.retain(|_, e| e.expires_at > now);
        before - services.len()
    }

    /// Records (or refreshes) a peer node.
    pub fn upsert_peer(&self, node_id: impl Into<String>, address: SocketAddr) {
        let node_id = node_id.into();
        self.peers.write().expect("peer map lock poisoned").insert(
            node_id.clone(),
            PeerInfo {
                node_id,
                address,
                last_seen: Instant::now(),
            },
        );
    }

    /// Removes a peer.
    pub fn remove_peer(&self, node_id: &str) {
        self.peers.write().expect("peer map lock poisoned").remove(node_id);
    }

    /// Copies the peer table out.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .expect("peer map lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
