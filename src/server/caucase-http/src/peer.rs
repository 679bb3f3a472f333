//! Connection metadata handed to the router.

use std::net::SocketAddr;

/// What the transport knows about the client.
///
/// The TLS listener attaches it to every request through
/// [`axum::extract::ConnectInfo`]. Requests served without it are never
/// authenticated.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Remote address of the connection.
    pub remote_addr: SocketAddr,
    /// DER certificate presented during the TLS handshake, if any.
    pub client_certificate: Option<Vec<u8>>,
}

impl PeerInfo {
    /// A peer that presented no certificate.
    pub fn anonymous(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            client_certificate: None,
        }
    }
}
