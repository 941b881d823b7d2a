//! Encrypted node-to-node transport.
//!
//! Nodes speak QUIC with a self-signed identity certificate per node
//! and application-layer encryption per service: every registered
//! service owns a 32-byte symmetric key, and messages addressed to it
//! travel as `{dest_service, nonce, ciphertext}` sealed with
//! XChaCha20-Poly1305 under that key.
//!
//! Delivery is in-order per connection, unordered across connections.
//! The transport reports failures to the caller and never retries
//! application messages on its own. Outbound queues are bounded per
//! peer; overflow surfaces as `ConnectionFailed`.

use crate::constants::{FABRIC_ALPN, FABRIC_REQUEST_TIMEOUT, MAX_PEER_SEND_QUEUE, SERVICE_KEY_LEN};
use crate::error::{Error, Result};
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::XChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// Upper bound on one fabric frame (16 MiB).
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// Service Keys
// =============================================================================

/// Per-service symmetric key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceKey([u8; SERVICE_KEY_LEN]);

impl ServiceKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; SERVICE_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; SERVICE_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Seals a plaintext for `service` under this key.
    pub fn seal(&self, service: &str, plaintext: &[u8]) -> Result<Envelope> {
        let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(&self.0));
        let mut nonce = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| Error::EncryptionFailed {
                service: service.to_string(),
                reason: "seal failed".to_string(),
            })?;
        Ok(Envelope {
            dest_service: service.to_string(),
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Opens an envelope addressed to a service holding this key.
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        if envelope.nonce.len() != 24 {
            return Err(Error::EncryptionFailed {
                service: envelope.dest_service.clone(),
                reason: format!("nonce length {}", envelope.nonce.len()),
            });
        }
        let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(&self.0));
        cipher
            .decrypt(GenericArray::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
            .map_err(|_| Error::EncryptionFailed {
                service: envelope.dest_service.clone(),
                reason: "open failed (wrong key or tampered ciphertext)".to_string(),
            })
    }
}

impl std::fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("ServiceKey(..)")
    }
}

/// An encrypted application message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub dest_service: String,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

// =============================================================================
// Wire Frames
// =============================================================================

/// One frame on a fabric stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Encrypted service-addressed payload.
    Service(Envelope),
    /// Plaintext control message (`DEPLOY_CAPSULE:...`, `HEARTBEAT:...`).
    Control(String),
    /// Acknowledgement / response payload.
    Reply(Vec<u8>),
}

/// A frame received from a peer, tagged with its origin.
#[derive(Debug)]
pub struct Inbound {
    pub from: SocketAddr,
    pub frame: Frame,
    /// Send the reply frame here; dropping it closes the stream empty.
    pub reply: tokio::sync::oneshot::Sender<Frame>,
}

// =============================================================================
// Transport
// =============================================================================

/// QUIC endpoint plus per-peer connection cache.
pub struct Transport {
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
    connections: RwLock<HashMap<SocketAddr, quinn::Connection>>,
    inbound_tx: mpsc::Sender<Inbound>,
}

impl Transport {
    /// Binds a server+client endpoint and starts the accept loop.
    ///
    /// Returns the transport and the stream of inbound frames.
    pub async fn bind(bind_addr: SocketAddr, node_name: &str) -> Result<(Arc<Self>, mpsc::Receiver<Inbound>)> {
        let (cert_der, key_der) = self_signed_identity(node_name)?;

        let mut tls = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![rustls::Certificate(cert_der)], rustls::PrivateKey(key_der))
            .map_err(|e| Error::ConnectionFailed {
                peer: bind_addr.to_string(),
                reason: format!("tls config: {e}"),
            })?;
        tls.alpn_protocols = vec![FABRIC_ALPN.to_vec()];

        let server_config = quinn::ServerConfig::with_crypto(Arc::new(tls));
        let endpoint = quinn::Endpoint::server(server_config, bind_addr).map_err(|e| {
            Error::ConnectionFailed {
                peer: bind_addr.to_string(),
                reason: format!("bind: {e}"),
            }
        })?;
        let local_addr = endpoint.local_addr().map_err(|e| Error::ConnectionFailed {
            peer: bind_addr.to_string(),
            reason: e.to_string(),
        })?;

        let (inbound_tx, inbound_rx) = mpsc::channel(MAX_PEER_SEND_QUEUE);
        let transport = Arc::new(Self {
            endpoint,
            local_addr,
            connections: RwLock::new(HashMap::new()),
            inbound_tx,
        });

        tokio::spawn(Self::accept_loop(Arc::clone(&transport)));
        info!(addr = %local_addr, "fabric transport listening");
        Ok((transport, inbound_rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(self: Arc<Self>) {
        while let Some(connecting) = self.endpoint.accept().await {
            let transport = Arc::clone(&self);
            tokio::spawn(async move {
                match connecting.await {
                    Ok(connection) => transport.serve_connection(connection).await,
                    Err(e) => warn!(error = %e, "inbound connection failed"),
                }
            });
        }
        debug!("fabric accept loop ended");
    }

    async fn serve_connection(self: Arc<Self>, connection: quinn::Connection) {
        let peer = connection.remote_address();
        debug!(%peer, "peer connected");
        loop {
            match connection.accept_bi().await {
                Ok((send, recv)) => {
                    let transport = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = transport.serve_stream(peer, send, recv).await {
                            warn!(%peer, error = %e, "stream handling failed");
                        }
                    });
                }
                Err(quinn::ConnectionError::ApplicationClosed(_)) => break,
                Err(e) => {
                    warn!(%peer, error = %e, "connection error");
                    break;
                }
            }
        }
        self.connections.write().await.remove(&peer);
        debug!(%peer, "peer disconnected");
    }

    async fn serve_stream(
        &self,
        peer: SocketAddr,
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
    ) -> Result<()> {
        let raw = recv
            .read_to_end(MAX_FRAME_SIZE)
            .await
            .map_err(|e| Error::ConnectionFailed {
                peer: peer.to_string(),
                reason: format!("read: {e}"),
            })?;
        let frame: Frame = bincode::deserialize(&raw).map_err(|e| Error::Serialization(e.to_string()))?;

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let inbound = Inbound {
            from: peer,
            frame,
            reply: reply_tx,
        };
        // Bounded handoff: a full consumer surfaces backpressure here
        // instead of queueing without limit.
        self.inbound_tx
            .try_send(inbound)
            .map_err(|_| Error::ConnectionFailed {
                peer: peer.to_string(),
                reason: "inbound queue full".to_string(),
            })?;

        let reply = match reply_rx.await {
            Ok(frame) => frame,
            Err(_) => Frame::Reply(Vec::new()),
        };
        let raw = bincode::serialize(&reply).map_err(|e| Error::Serialization(e.to_string()))?;
        send.write_all(&raw).await.map_err(|e| Error::ConnectionFailed {
            peer: peer.to_string(),
            reason: format!("write: {e}"),
        })?;
        send.finish().await.ok();
        Ok(())
    }

    /// Sends one frame to a peer and awaits its reply frame.
    pub async fn request(&self, peer: SocketAddr, frame: &Frame) -> Result<Frame> {
        let operation = format!("fabric request to {peer}");
        tokio::time::timeout(FABRIC_REQUEST_TIMEOUT, self.request_inner(peer, frame))
            .await
            .map_err(|_| Error::Timeout {
                operation,
                duration: FABRIC_REQUEST_TIMEOUT,
            })?
    }

    async fn request_inner(&self, peer: SocketAddr, frame: &Frame) -> Result<Frame> {
        let connection = self.connect(peer).await?;
        let (mut send, mut recv) = connection.open_bi().await.map_err(|e| Error::ConnectionFailed {
            peer: peer.to_string(),
            reason: format!("open stream: {e}"),
        })?;

        let raw = bincode::serialize(frame).map_err(|e| Error::Serialization(e.to_string()))?;
        send.write_all(&raw).await.map_err(|e| Error::ConnectionFailed {
            peer: peer.to_string(),
            reason: format!("send: {e}"),
        })?;
        send.finish().await.ok();

        let raw = recv
            .read_to_end(MAX_FRAME_SIZE)
            .await
            .map_err(|e| Error::ConnectionFailed {
                peer: peer.to_string(),
                reason: format!("recv: {e}"),
            })?;
        bincode::deserialize(&raw).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Reuses or dials a connection to `peer`.
    async fn connect(&self, peer: SocketAddr) -> Result<quinn::Connection> {
        if let Some(connection) = self.connections.read().await.get(&peer) {
            if connection.close_reason().is_none() {
                return Ok(connection.clone());
            }
        }

        let mut tls = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptNodeIdentity))
            .with_no_client_auth();
        tls.alpn_protocols = vec![FABRIC_ALPN.to_vec()];
        let client_config = quinn::ClientConfig::new(Arc::new(tls));

        let connecting = self
            .endpoint
            .connect_with(client_config, peer, "strato-node")
            .map_err(|e| Error::ConnectionFailed {
                peer: peer.to_string(),
                reason: format!("dial: {e}"),
            })?;
        let connection = connecting.await.map_err(|e| Error::ConnectionFailed {
            peer: peer.to_string(),
            reason: format!("handshake: {e}"),
        })?;

        self.connections.write().await.insert(peer, connection.clone());
        debug!(%peer, "peer connection established");
        Ok(connection)
    }

    /// Closes the endpoint and all connections.
    pub fn shutdown(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
        info!(addr = %self.local_addr, "fabric transport closed");
    }
}

/// Generates the node's self-signed identity certificate.
fn self_signed_identity(node_name: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let cert = rcgen::generate_simple_self_signed(vec![node_name.to_string(), "strato-node".to_string()])
        .map_err(|e| Error::ConnectionFailed {
            peer: node_name.to_string(),
            reason: format!("identity generation: {e}"),
        })?;
    let cert_der = cert.serialize_der().map_err(|e| Error::ConnectionFailed {
        peer: node_name.to_string(),
        reason: format!("certificate serialization: {e}"),
    })?;
    let key_der = cert.serialize_private_key_der();
    Ok((cert_der, key_der))
}

/// Accepts any peer certificate.
///
/// Node identities are self-signed and authenticated at the
/// application layer by service keys; transport TLS provides channel
/// encryption, not peer authentication.
struct AcceptNodeIdentity;

impl rustls::client::ServerCertVerifier for AcceptNodeIdentity {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = ServiceKey::generate();
        let envelope = key.seal("web", b"payload").unwrap();
        assert_eq!(envelope.dest_service, "web");
        assert_eq!(key.open(&envelope).unwrap(), b"payload");
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let key = ServiceKey::generate();
        let other = ServiceKey::generate();
        let envelope = key.seal("web", b"payload").unwrap();
        assert!(other.open(&envelope).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let key = ServiceKey::generate();
        let mut envelope = key.seal("web", b"payload").unwrap();
        envelope.ciphertext[0] ^= 0xff;
        assert!(key.open(&envelope).is_err());
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        let key = ServiceKey::generate();
        let a = key.seal("web", b"x").unwrap();
        let b = key.seal("web", b"x").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
