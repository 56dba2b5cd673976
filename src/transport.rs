//! QUIC session layer.
//!
//! Wraps a `quinn` endpoint into the session primitive the engine needs:
//! connect, disconnect, send-to-set, and per-peer state reported through
//! events. Connections are encrypted with a self-signed certificate and an
//! unverifying client config: TLS here buys transport privacy, not peer
//! authentication.
//!
//! The first frame on every connection is `Hello` carrying the initiator's
//! identity. When both sides invite each other at once, the connection
//! initiated by the lexicographically smaller identity wins on both ends,
//! so duplicate invites collapse to a single link.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig};
use rcgen::generate_simple_self_signed;
use tokio::sync::mpsc;

use crate::config::{EngineConfig, InvitationPolicy};
use crate::error::{SendError, TransportError};
use crate::peer::{ConnectionState, PeerId};
use crate::protocol::{Frame, TLS_SERVER_NAME};

// Frames are single chat messages or hellos; anything bigger is bogus.
const MAX_FRAME_SIZE: usize = 64 * 1024;

static INIT_CRYPTO: Lazy<()> = Lazy::new(|| {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
});

/// State changes and inbound data, delivered to the session manager's
/// event loop. The only way transport outcomes become visible.
#[derive(Debug)]
pub enum SessionEvent {
    StateChanged {
        peer: PeerId,
        state: ConnectionState,
    },
    Data {
        peer: PeerId,
        payload: Vec<u8>,
    },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outbound,
    Inbound,
}

struct Link {
    conn: Connection,
    direction: Direction,
}

#[derive(Clone)]
pub struct Session {
    endpoint: Endpoint,
    identity: PeerId,
    peers: Arc<Mutex<HashMap<PeerId, Link>>>,
    // Peers with an invite in flight; guards duplicate invites.
    pending: Arc<Mutex<HashSet<PeerId>>>,
    events: mpsc::Sender<SessionEvent>,
    policy: InvitationPolicy,
    invite_timeout: Duration,
}

impl Session {
    /// Binds a QUIC endpoint on an ephemeral port and starts accepting
    /// inbound connections.
    pub fn open(
        identity: PeerId,
        config: &EngineConfig,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self, TransportError> {
        Lazy::force(&INIT_CRYPTO);

        let (cert_der, key_der) = generate_self_signed_cert()?;
        let server_config = configure_server(cert_der, key_der)?;
        let client_config = configure_client()?;

        let addr = SocketAddr::from(([0, 0, 0, 0], 0));
        let mut endpoint = Endpoint::server(server_config, addr)?;
        endpoint.set_default_client_config(client_config);

        let session = Self {
            endpoint,
            identity,
            peers: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashSet::new())),
            events,
            policy: Arc::clone(&config.invitation_policy),
            invite_timeout: config.invite_timeout,
        };
        session.spawn_accept_loop();
        Ok(session)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.endpoint.local_addr()
    }

    /// Invites a discovered peer. A no-op when a connection to that peer
    /// already exists or is being established, so rediscovery can re-invite
    /// freely. Completion is observed only through `SessionEvent`s.
    pub fn connect(&self, peer: PeerId, addr: SocketAddr) {
        {
            let peers = self.peers.lock().unwrap();
            let mut pending = self.pending.lock().unwrap();
            if peers.contains_key(&peer) || !pending.insert(peer.clone()) {
                tracing::debug!(%peer, "already connecting or connected, ignoring invite");
                return;
            }
        }

        let session = self.clone();
        tokio::spawn(async move {
            session.emit_state(&peer, ConnectionState::Connecting).await;
            let result = tokio::time::timeout(session.invite_timeout, session.dial(addr)).await;
            session.pending.lock().unwrap().remove(&peer);
            match result {
                Ok(Ok(conn)) => {
                    session
                        .register_connection(peer, conn, Direction::Outbound)
                        .await;
                }
                Ok(Err(e)) => {
                    tracing::warn!(%peer, %addr, error = %e, "invitation failed");
                    session.emit_state(&peer, ConnectionState::NotConnected).await;
                }
                Err(_) => {
                    tracing::warn!(%peer, %addr, "invitation timed out");
                    session.emit_state(&peer, ConnectionState::NotConnected).await;
                }
            }
        });
    }

    async fn dial(&self, addr: SocketAddr) -> Result<Connection, SendError> {
        let conn = self
            .endpoint
            .connect(addr, TLS_SERVER_NAME)
            .map_err(|e| SendError::Transport(e.to_string()))?
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        // Introduce ourselves so the acceptor can attribute the connection.
        let hello = Frame::Hello {
            peer_id: self.identity.clone(),
        }
        .encode()
        .map_err(|e| SendError::Unencodable(e.to_string()))?;
        send_frame(&conn, &hello)
            .await
            .map_err(SendError::Transport)?;
        Ok(conn)
    }

    /// Broadcasts one chat message to the given recipients. Per-peer
    /// failures are logged and the first one is returned; the message is
    /// dropped for that peer, no retry.
    pub async fn send(&self, text: &str, recipients: &[PeerId]) -> Result<(), SendError> {
        if recipients.is_empty() {
            return Err(SendError::NoRecipients);
        }
        let data = Frame::Chat {
            text: text.to_string(),
        }
        .encode()
        .map_err(|e| SendError::Unencodable(e.to_string()))?;

        let mut first_err = None;
        for peer in recipients {
            let conn = {
                let peers = self.peers.lock().unwrap();
                peers.get(peer).map(|link| link.conn.clone())
            };
            let Some(conn) = conn else {
                tracing::warn!(%peer, "recipient no longer connected, skipping");
                continue;
            };
            if let Err(e) = send_frame(&conn, &data).await {
                tracing::warn!(%peer, error = %e, "send failed");
                first_err.get_or_insert(SendError::Transport(e));
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Closes every peer connection; each connected peer is reported as
    /// NotConnected. The endpoint itself stays open and keeps accepting,
    /// so a later start (or an inbound invite) can connect again on the
    /// same port.
    pub async fn disconnect(&self) {
        let links: Vec<(PeerId, Connection)> = {
            let mut peers = self.peers.lock().unwrap();
            peers
                .drain()
                .map(|(peer, link)| (peer, link.conn))
                .collect()
        };
        for (peer, conn) in links {
            conn.close(0u32.into(), b"session stopped");
            self.emit_state(&peer, ConnectionState::NotConnected).await;
        }
    }

    fn spawn_accept_loop(&self) {
        let session = self.clone();
        tokio::spawn(async move {
            while let Some(incoming) = session.endpoint.accept().await {
                let session = session.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => session.handle_inbound(conn).await,
                        Err(e) => tracing::warn!(error = %e, "inbound connection failed"),
                    }
                });
            }
        });
    }

    async fn handle_inbound(&self, conn: Connection) {
        let remote = conn.remote_address();
        let peer = match recv_frame(&conn).await {
            Ok(Frame::Hello { peer_id }) => peer_id,
            Ok(other) => {
                tracing::warn!(%remote, frame = ?other, "expected Hello as first frame");
                conn.close(0u32.into(), b"protocol violation");
                return;
            }
            Err(e) => {
                tracing::warn!(%remote, error = %e, "failed to read Hello");
                return;
            }
        };
        if !(self.policy)(&peer) {
            tracing::info!(%peer, %remote, "invitation policy rejected peer");
            conn.close(0u32.into(), b"rejected");
            return;
        }
        self.register_connection(peer, conn, Direction::Inbound)
            .await;
    }

    async fn register_connection(&self, peer: PeerId, conn: Connection, direction: Direction) {
        {
            let mut peers = self.peers.lock().unwrap();
            if let Some(existing) = peers.get(&peer) {
                // Simultaneous connect: both ends keep the connection dialed
                // by the smaller identity so they agree on the survivor.
                let keep_outbound = self.identity.as_str() < peer.as_str();
                let winner = if keep_outbound {
                    Direction::Outbound
                } else {
                    Direction::Inbound
                };
                if existing.direction == winner || direction != winner {
                    tracing::debug!(%peer, "dropping duplicate connection");
                    conn.close(0u32.into(), b"duplicate");
                    return;
                }
                existing.conn.close(0u32.into(), b"superseded");
            }
            peers.insert(
                peer.clone(),
                Link {
                    conn: conn.clone(),
                    direction,
                },
            );
        }
        tracing::info!(%peer, remote = %conn.remote_address(), "peer connected");
        self.emit_state(&peer, ConnectionState::Connected).await;
        self.spawn_recv_loop(peer, conn);
    }

    fn spawn_recv_loop(&self, peer: PeerId, conn: Connection) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                match recv_frame(&conn).await {
                    Ok(Frame::Chat { text }) => {
                        let event = SessionEvent::Data {
                            peer: peer.clone(),
                            payload: text.into_bytes(),
                        };
                        if session.events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(Frame::Hello { .. }) => {
                        tracing::debug!(%peer, "ignoring repeated Hello");
                    }
                    Err(e) => {
                        tracing::info!(%peer, reason = %e, "peer disconnected");
                        break;
                    }
                }
            }
            let still_current = {
                let mut peers = session.peers.lock().unwrap();
                match peers.get(&peer) {
                    Some(link) if link.conn.stable_id() == conn.stable_id() => {
                        peers.remove(&peer);
                        true
                    }
                    // A superseding connection took over; its own recv loop
                    // reports the eventual disconnect.
                    _ => false,
                }
            };
            if still_current {
                session
                    .emit_state(&peer, ConnectionState::NotConnected)
                    .await;
            }
        });
    }

    async fn emit_state(&self, peer: &PeerId, state: ConnectionState) {
        let event = SessionEvent::StateChanged {
            peer: peer.clone(),
            state,
        };
        if self.events.send(event).await.is_err() {
            tracing::debug!("event channel closed, dropping state change");
        }
    }
}

/// One frame per unidirectional stream.
async fn send_frame(conn: &Connection, data: &[u8]) -> Result<(), String> {
    let mut stream = conn.open_uni().await.map_err(|e| e.to_string())?;
    stream.write_all(data).await.map_err(|e| e.to_string())?;
    stream.finish().map_err(|e| e.to_string())?;
    Ok(())
}

async fn recv_frame(conn: &Connection) -> Result<Frame, String> {
    let mut stream = conn.accept_uni().await.map_err(|e| e.to_string())?;
    let data = stream
        .read_to_end(MAX_FRAME_SIZE)
        .await
        .map_err(|e| e.to_string())?;
    Frame::decode(&data).map_err(|e| e.to_string())
}

fn generate_self_signed_cert() -> Result<(Vec<u8>, Vec<u8>), TransportError> {
    let cert = generate_simple_self_signed(vec![TLS_SERVER_NAME.into()])
        .map_err(|e| TransportError::Certificate(e.to_string()))?;
    Ok((
        cert.cert.der().to_vec(),
        cert.signing_key.serialize_der(),
    ))
}

fn configure_server(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<ServerConfig, TransportError> {
    let cert = rustls::pki_types::CertificateDer::from(cert_der);
    let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
        .map_err(|_| TransportError::Tls("invalid private key".into()))?;
    ServerConfig::with_single_cert(vec![cert], key)
        .map_err(|e| TransportError::Tls(e.to_string()))
}

/// Signature schemes the unverifying client advertises. Taken from the
/// crypto provider so they always cover whatever key `rcgen` generated
/// for the self-signed certificate.
fn verification_schemes() -> Vec<rustls::SignatureScheme> {
    rustls::crypto::aws_lc_rs::default_provider()
        .signature_verification_algorithms
        .supported_schemes()
}

fn configure_client() -> Result<ClientConfig, TransportError> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    struct SkipServerVerification(Vec<SignatureScheme>);
    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.clone()
        }
    }

    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(
            verification_schemes(),
        )))
        .with_no_client_auth();

    let quic_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_config)
            .map_err(|e| TransportError::Tls(e.to_string()))?,
    ));
    Ok(quic_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::SignatureScheme;

    #[test]
    fn verifier_accepts_the_generated_certificate_key() {
        // rcgen's simple self-signed certificate uses an ECDSA P-256 key;
        // the client's verifier must advertise a matching scheme or no
        // handshake can complete.
        let schemes = verification_schemes();
        assert!(schemes.contains(&SignatureScheme::ECDSA_NISTP256_SHA256));
    }
}
