use serde::{Deserialize, Deserializer, Serialize};

/// Sanitized peer identifier. See [`crate::identity::derive_identity`] for
/// the derivation rules (alphanumerics plus `_`, at most 10 characters).
/// Deserialization enforces the same rules, so identifiers arriving off
/// the wire are validated before they enter the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PeerId(String);

impl PeerId {
    /// Wraps an already-sanitized identifier. Callers outside the identity
    /// module should go through `derive_identity` instead.
    pub(crate) fn from_sanitized(id: String) -> Self {
        Self(id)
    }

    /// Validates a remote-supplied identifier against the encoding rules:
    /// non-empty, at most 10 characters, ASCII alphanumerics and `_` only.
    pub fn parse(id: &str) -> Option<Self> {
        let valid = !id.is_empty()
            && id.len() <= crate::identity::MAX_IDENTITY_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == crate::identity::SEPARATOR);
        valid.then(|| Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        PeerId::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom("invalid peer identifier encoding"))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection state of a remote peer, driven exclusively by transport
/// events. Discovery never sets this directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    NotConnected,
}

/// A received chat message. Append-only: entries are never mutated after
/// creation and are retained for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: PeerId,
    pub text: String,
}

impl InboundMessage {
    /// The consumer-visible rendering, `[sender]: text`.
    pub fn display_line(&self) -> String {
        format!("[{}]: {}", self.sender, self.text)
    }
}
