//! Peer-to-peer local network chat engine.
//!
//! `nearchat` discovers peers on the local network over mDNS, connects to
//! them over QUIC, and broadcasts text messages to everyone connected.
//! The consumer surface is [`ChatSession`]: call [`ChatSession::start`] to
//! begin advertising and browsing, read [`ChatSession::connected_peers`]
//! and [`ChatSession::messages`], send with [`ChatSession::send`] and
//! observe [`ChatEvent`]s via [`ChatSession::subscribe`].
//!
//! Security note: by default every peer advertising the shared namespace
//! is accepted — no allow-list, no confirmation, no authentication beyond
//! the transport's encryption. Deployments that need screening can inject
//! an [`config::InvitationPolicy`].

pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::EngineConfig;
pub use error::{DiscoveryError, SendError, TransportError};
pub use identity::derive_identity;
pub use peer::{ConnectionState, InboundMessage, PeerId};
pub use session::{ChatEvent, ChatSession};
