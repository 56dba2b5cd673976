//! mDNS advertise + browse.
//!
//! The advertiser registers this peer under the shared service type so
//! others can find it; the browser scans for the same type. Both sit on a
//! single `mdns-sd` daemon. Failures here are non-fatal: the engine
//! degrades to "no peers available" and a later start may retry.

use std::net::{IpAddr, SocketAddr};

use local_ip_address::local_ip;
use mdns_sd::{Receiver, ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::error::DiscoveryError;
use crate::peer::PeerId;

/// Peer-found / peer-lost notifications, adapted from raw mDNS events.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerFound { peer: PeerId, addr: SocketAddr },
    PeerLost { peer: PeerId },
}

pub struct Discovery {
    daemon: ServiceDaemon,
    service_type: String,
    // Fullname of the registered service, kept for unregistering.
    registered_service: Option<String>,
    browsing: bool,
}

impl Discovery {
    pub fn new(service_type: &str) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new()?;
        Ok(Self {
            daemon,
            service_type: service_type.to_string(),
            registered_service: None,
            browsing: false,
        })
    }

    /// Makes this peer discoverable. Re-registering replaces the previous
    /// announcement.
    pub fn advertise(&mut self, identity: &PeerId, port: u16) -> Result<(), DiscoveryError> {
        if let Some(fullname) = self.registered_service.take() {
            tracing::info!(%fullname, "unregistering old service");
            let _ = self.daemon.unregister(&fullname);
        }

        let ip = local_ip()?;
        let m_hostname = format!("{}.local.", identity);
        let properties = [("id", identity.as_str()), ("v", "0.1.0")];

        let service_info = ServiceInfo::new(
            &self.service_type,
            identity.as_str(),
            &m_hostname,
            &ip.to_string(),
            port,
            &properties[..],
        )?;
        let fullname = service_info.get_fullname().to_string();

        self.daemon.register(service_info)?;
        tracing::info!(%identity, %fullname, %ip, port, "advertising service");

        self.registered_service = Some(fullname);
        Ok(())
    }

    /// Idempotent: safe when not advertising.
    pub fn stop_advertising(&mut self) {
        if let Some(fullname) = self.registered_service.take() {
            tracing::info!(%fullname, "stop advertising");
            if let Err(e) = self.daemon.unregister(&fullname) {
                tracing::warn!(error = %e, "failed to unregister service");
            }
        }
    }

    /// Starts scanning for peers under the service type. The returned
    /// receiver yields raw daemon events; adapt them with
    /// [`adapt_service_event`].
    pub fn browse(&mut self) -> Result<Receiver<ServiceEvent>, DiscoveryError> {
        let receiver = self.daemon.browse(&self.service_type)?;
        self.browsing = true;
        Ok(receiver)
    }

    /// Idempotent: safe when not browsing.
    pub fn stop_browsing(&mut self) {
        if self.browsing {
            if let Err(e) = self.daemon.stop_browse(&self.service_type) {
                tracing::warn!(error = %e, "failed to stop browsing");
            }
            self.browsing = false;
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop_browsing();
        if let Some(fullname) = self.registered_service.take() {
            tracing::info!(%fullname, "unregistering service");
            if let Err(e) = self.daemon.unregister(&fullname) {
                tracing::error!(error = %e, "failed to unregister service");
            }
            // Give the daemon time to send the goodbye packet before its
            // background thread goes away with us.
            std::thread::sleep(std::time::Duration::from_millis(300));
        }
    }
}

/// Translates a raw mDNS event into a discovery event. Our own
/// advertisement echoed back is filtered out, as are events that carry no
/// usable identity or address.
pub fn adapt_service_event(event: ServiceEvent, local_id: &PeerId) -> Option<DiscoveryEvent> {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let raw_id = info.get_property_val_str("id")?;
            if raw_id == local_id.as_str() {
                return None;
            }
            let Some(peer) = PeerId::parse(raw_id) else {
                tracing::warn!(id = raw_id, "ignoring peer with malformed identifier");
                return None;
            };
            let ip: IpAddr = info
                .get_addresses()
                .iter()
                .next()?
                .to_string()
                .parse()
                .ok()?;
            Some(DiscoveryEvent::PeerFound {
                peer,
                addr: SocketAddr::new(ip, info.get_port()),
            })
        }
        ServiceEvent::ServiceRemoved(_ty, fullname) => {
            let raw_id = fullname.split('.').next().unwrap_or_default();
            if raw_id == local_id.as_str() {
                return None;
            }
            let peer = PeerId::parse(raw_id)?;
            Some(DiscoveryEvent::PeerLost { peer })
        }
        _ => None,
    }
}
