//! Name resolution.
//!
//! Serves three logical record kinds:
//!
//! - **address**: name → `{address, port}`
//! - **service**: name → `{target address, target port, ttl}`
//! - **alias**: name → another name
//!
//! A lookup by short name tries, in order: the local service registry;
//! the canonical name family (`<name>.<domain>` and the SRV-style
//! `_<name>._quic.<domain>`); then a remote query across known peers.
//! A name that survives all three stages unresolved is
//! `ServiceDiscoveryFailed`. Results are cached per record with a TTL
//! (5 min for services, 1 min for remote-discovered records, 24 h for
//! control records).

use crate::constants::{CONTROL_RECORD_TTL, REMOTE_RECORD_TTL, SERVICE_RECORD_TTL};
use crate::error::{Error, Result};
use crate::fabric::registry::ServiceRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A resolution record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    Address {
        address: String,
        port: u16,
    },
    Service {
        target_address: String,
        target_port: u16,
        ttl_secs: u64,
    },
    Alias {
        target: String,
    },
}

struct CachedRecord {
    record: Record,
    expires_at: Instant,
}

/// Resolves names against the registry, canonical forms, and peers.
pub struct Resolver {
    domain: String,
    registry: Arc<ServiceRegistry>,
    cache: RwLock<HashMap<String, CachedRecord>>,
    /// Statically configured records (node addresses, aliases).
    control: RwLock<HashMap<String, Record>>,
}

impl Resolver {
    /// Creates a resolver serving `<domain>` (e.g. `myproj.local`).
    pub fn new(domain: impl Into<String>, registry: Arc<ServiceRegistry>) -> Self {
        let domain = domain.into();
        info!(%domain, "resolver initialized");
        Self {
            domain,
            registry,
            cache: RwLock::new(HashMap::new()),
            control: RwLock::new(HashMap::new()),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The canonical name family tried for a short name.
    pub fn canonical_forms(&self, name: &str) -> Vec<String> {
        vec![
            name.to_string(),
            format!("{name}.{}", self.domain),
            format!("_{name}._quic.{}", self.domain),
        ]
    }

    /// Installs a control record (TTL 24 h).
    pub fn insert_control(&self, name: impl Into<String>, record: Record) {
        self.control
            .write()
            .expect("control map lock poisoned")
            .insert(name.into(), record);
    }

    /// Resolves a name locally: cache, control records, registry,
    /// canonical forms. Does not consult peers. Aliases are chased up
    /// to a fixed hop limit so a cycle cannot spin.
    pub fn resolve_local(&self, name: &str) -> Option<Record> {
        let mut record = self.lookup_once(name)?;
        for _hop in 0..4 {
            let target = match &record {
                Record::Alias { target } => target.clone(),
                _ => break,
            };
            match self.lookup_once(&target) {
                Some(next) => record = next,
                None => break,
            }
        }
        Some(record)
    }

    /// One resolution step without alias chasing.
    fn lookup_once(&self, name: &str) -> Option<Record> {
        if let Some(record) = self.cached(name) {
            return Some(record);
        }

        for form in self.canonical_forms(name) {
            if let Some(record) = self
                .control
                .read()
                .expect("control map lock poisoned")
                .get(&form)
                .cloned()
            {
                self.cache_record(name, record.clone(), CONTROL_RECORD_TTL);
                return Some(record);
            }

            // Canonical forms strip back to the registered short name.
            let short = form.split('.').next().unwrap_or(&form).trim_start_matches('_');
            if let Some(endpoint) = self.registry.lookup(short) {
                let record = Record::Service {
                    target_address: endpoint.address,
                    target_port: endpoint.port,
                    ttl_secs: SERVICE_RECORD_TTL.as_secs(),
                };
                self.cache_record(name, record.clone(), SERVICE_RECORD_TTL);
                return Some(record);
            }
        }
        None
    }

    /// Full resolution: local stages, then `remote` for each peer
    /// (provided by the fabric, which owns the transport).
    ///
    /// `remote` is invoked per canonical form until one returns a
    /// record.
    pub async fn resolve_with<F, Fut>(&self, name: &str, remote: F) -> Result<Record>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Option<Record>>,
    {
        if let Some(record) = self.resolve_local(name) {
            return Ok(record);
        }

        for form in self.canonical_forms(name) {
            if let Some(record) = remote(form).await {
                debug!(%name, "resolved via peer");
                self.cache_record(name, record.clone(), REMOTE_RECORD_TTL);
                if let Record::Alias { target } = &record {
                    if let Some(chased) = self.resolve_local(&target.clone()) {
                        return Ok(chased);
                    }
                }
                return Ok(record);
            }
        }

        Err(Error::ServiceDiscoveryFailed {
            name: name.to_string(),
        })
    }

    fn cached(&self, name: &str) -> Option<Record> {
        let cache = self.cache.read().expect("resolver cache lock poisoned");
        cache
            .get(name)
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| c.record.clone())
    }

    fn cache_record(&self, name: &str, record: Record, ttl: Duration) {
        self.cache.write().expect("resolver cache lock poisoned").insert(
            name.to_string(),
            CachedRecord {
                record,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drops expired cache entries.
    pub fn prune_cache(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.write().expect("resolver cache lock poisoned");
        let before = cache.len();
        cache.retain(|_, c| c.expires_at > now);
        before - cache.len()
    }

    /// Clears all cached and control state (orchestrator teardown).
    pub fn clear(&self) {
        self.cache.write().expect("resolver cache lock poisoned").clear();
        self.control.write().expect("control map lock poisoned").clear();
    }

    /// Serves lookups over UDP: a datagram carrying a name is answered
    /// with the JSON record, or an empty datagram on a miss.
    ///
    /// Returns the bound address and the server task handle.
    pub async fn spawn_udp_server(
        self: Arc<Self>,
        port: u16,
    ) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
        let socket = tokio::net::UdpSocket::bind(("127.0.0.1", port))
            .await
            .map_err(|e| Error::ConnectionFailed {
                peer: format!("127.0.0.1:{port}"),
                reason: format!("resolver bind: {e}"),
            })?;
        let local = socket.local_addr().map_err(Error::Io)?;
        info!(addr = %local, "resolver listening");

        let resolver = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let name = String::from_utf8_lossy(&buf[..len]).trim().to_string();
                let answer = resolver
                    .resolve_local(&name)
                    .and_then(|record| serde_json::to_vec(&record).ok())
                    .unwrap_or_default();
                let _ = socket.send_to(&answer, peer).await;
            }
        });
        Ok((local, handle))
    }
}
