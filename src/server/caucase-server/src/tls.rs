//! Mutual-TLS listener.
//!
//! Client certificates are optional at the handshake: the HTTP layer decides
//! which routes need one. Handshakes run in their own tasks so one slow
//! client cannot stall the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use caucase_http::PeerInfo;

use crate::identity::ServerIdentity;

/// Maximum time a client gets to complete its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_BACKLOG: usize = 64;

/// Builds the listener config: the server identity chained to the service
/// CA certificates, and client certificates checked against the user CA
/// certificates.
pub fn server_config(
    identity: &ServerIdentity,
    service_chain: &[String],
    user_chain: &[String],
) -> anyhow::Result<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    for pem in user_chain {
        for cert in CertificateDer::pem_slice_iter(pem.as_bytes()) {
            roots
                .add(cert.context("invalid user CA certificate")?)
                .context("unusable user CA certificate")?;
        }
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .allow_unauthenticated()
        .build()
        .context("client verifier setup failed")?;

    let mut chain = CertificateDer::pem_slice_iter(identity.crt_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid server certificate")?;
    for pem in service_chain {
        for cert in CertificateDer::pem_slice_iter(pem.as_bytes()) {
            chain.push(cert.context("invalid service CA certificate")?);
        }
    }
    let key = PrivateKeyDer::from_pem_slice(identity.key_pem.as_bytes())
        .context("invalid server key")?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .context("server certificate does not match its key")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Server config shared with the listener, replaced on rotation.
pub struct TlsContext {
    current: RwLock<Arc<ServerConfig>>,
}

impl TlsContext {
    /// Wraps an initial config.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Config used by new handshakes.
    pub async fn current(&self) -> Arc<ServerConfig> {
        self.current.read().await.clone()
    }

    /// Swaps the config. Established connections keep the old one.
    pub async fn replace(&self, config: ServerConfig) {
        *self.current.write().await = Arc::new(config);
    }
}

type Accepted = (TlsStream<TcpStream>, PeerInfo);

/// Listener yielding established TLS streams with their peer information.
pub struct TlsListener {
    incoming: mpsc::Receiver<Accepted>,
    local_addr: SocketAddr,
}

impl TlsListener {
    /// Starts accepting on `listener`. Stops once the returned listener is
    /// dropped.
    pub fn spawn(listener: TcpListener, tls: Arc<TlsContext>) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        tokio::spawn(accept_loop(listener, tls, tx));
        Ok(Self {
            incoming: rx,
            local_addr,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(listener: TcpListener, tls: Arc<TlsContext>, tx: mpsc::Sender<Accepted>) {
    loop {
        let (tcp, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(error = %e, "HTTPS accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
            () = tx.closed() => break,
        };

        let acceptor = TlsAcceptor::from(tls.current().await);
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                Ok(Ok(stream)) => {
                    let client_certificate = stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .and_then(|chain| chain.first())
                        .map(|cert| cert.to_vec());
                    let peer = PeerInfo {
                        remote_addr,
                        client_certificate,
                    };
                    if tx.send((stream, peer)).await.is_err() {
                        debug!(%remote_addr, "Listener closed before connection was served");
                    }
                }
                Ok(Err(e)) => debug!(%remote_addr, error = %e, "TLS handshake failed"),
                Err(_) => debug!(%remote_addr, "TLS handshake timed out"),
            }
        });
    }
    debug!("HTTPS accept loop stopped");
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = PeerInfo;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(accepted) => accepted,
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(PeerInfo::anonymous(self.local_addr))
    }
}
