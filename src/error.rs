use thiserror::Error;

/// Failures while broadcasting a chat message. Validation variants are
/// returned to the caller; transport variants surface on the send path and
/// are logged by the session loop (the message is dropped, no retry).
#[derive(Error, Debug)]
pub enum SendError {
    #[error("no connected peers to send to")]
    NoRecipients,

    #[error("message is empty")]
    EmptyMessage,

    #[error("message could not be encoded: {0}")]
    Unencodable(String),

    #[error("transport send failed: {0}")]
    Transport(String),
}

/// Failures while starting advertising or browsing. Non-fatal: discovery
/// simply stays inactive and a later start may retry.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    Daemon(#[from] mdns_sd::Error),

    #[error("could not determine local address: {0}")]
    LocalAddress(#[from] local_ip_address::Error),
}

/// Failures while opening the QUIC endpoint.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("certificate generation failed: {0}")]
    Certificate(String),

    #[error("TLS configuration failed: {0}")]
    Tls(String),

    #[error("endpoint bind failed: {0}")]
    Bind(#[from] std::io::Error),
}
