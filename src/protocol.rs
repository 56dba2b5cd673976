use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Default mDNS service type. The "nearchat" label is the shared namespace:
/// every process advertising and browsing it can see each other.
pub const SERVICE_TYPE: &str = "_nearchat._udp.local.";

/// TLS server name presented on QUIC connections. Certificates are
/// self-signed and unverified, so the value only needs to match on both ends.
pub const TLS_SERVER_NAME: &str = "nearchat-local";

/// Wire frames exchanged over QUIC streams, one frame per stream,
/// serde_json encoded.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Frame {
    /// First frame on every new connection: the sender's identity. Stands
    /// in for the identity exchange a platform session layer would do
    /// internally.
    Hello { peer_id: PeerId },
    /// A chat message, UTF-8 text.
    Chat { text: String },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
