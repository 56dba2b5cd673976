use std::sync::Arc;
use std::time::Duration;

use crate::peer::PeerId;
use crate::protocol;

/// Decides whether an inbound connection from the given peer is accepted.
pub type InvitationPolicy = Arc<dyn Fn(&PeerId) -> bool + Send + Sync>;

/// Engine configuration. The defaults reproduce the reference behavior:
/// shared namespace, hostname-derived deterministic identity, 30 second
/// invites, and an accept-everyone invitation policy (any peer advertising
/// the namespace can join and read broadcasts; see the crate docs for the
/// trade-off).
#[derive(Clone)]
pub struct EngineConfig {
    /// mDNS service type all interoperating peers must share. Changing it
    /// partitions the network. Mostly useful to isolate tests.
    pub service_type: String,
    /// Raw device name to derive the identity from; OS hostname when unset.
    pub display_name: Option<String>,
    /// How long an invitation to a discovered peer may take before it is
    /// abandoned. Rediscovery naturally re-invites; there is no backoff.
    pub invite_timeout: Duration,
    /// Inbound connection screening. Default accepts every peer.
    pub invitation_policy: InvitationPolicy,
    /// Append a random suffix to the identity. Off by default so the same
    /// device keeps the same identity across restarts; turning it on
    /// avoids collisions between devices with identical sanitized names.
    pub disambiguate_identity: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_type: protocol::SERVICE_TYPE.to_string(),
            display_name: None,
            invite_timeout: Duration::from_secs(30),
            invitation_policy: Arc::new(|_| true),
            disambiguate_identity: false,
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("service_type", &self.service_type)
            .field("display_name", &self.display_name)
            .field("invite_timeout", &self.invite_timeout)
            .field("disambiguate_identity", &self.disambiguate_identity)
            .finish_non_exhaustive()
    }
}
