//! Daemon lifecycle: bind, serve, maintain, stop.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use time::{Duration, OffsetDateTime};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use caucase_auth::{AuthBackend, ClientCertificateBackend};
use caucase_ca::CertificateAuthority;
use caucase_http::{Application, PeerInfo};
use caucase_storage_sqlite::SqliteDatabase;

use crate::backup::{self, BACKUP_RETRY};
use crate::config::DaemonConfig;
use crate::identity::{self, ServerIdentity};
use crate::tls::{self, TlsContext, TlsListener};

/// Longest sleep of the maintenance task, so CA rollovers reach the TLS
/// config in time.
const MAINTENANCE_INTERVAL: Duration = Duration::hours(1);

/// Delay before retrying a failed server certificate renewal.
const ROTATION_RETRY: Duration = Duration::hours(1);

/// Lifecycle state of one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Not serving.
    Stopped,
    /// Bound, about to serve.
    Starting,
    /// Accepting connections.
    Serving,
    /// Draining connections after shutdown was requested.
    Stopping,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Serving => "serving",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

struct Listener {
    name: &'static str,
    state: watch::Sender<ListenerState>,
}

impl Listener {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: watch::Sender::new(ListenerState::Stopped),
        })
    }

    fn set(&self, state: ListenerState) {
        self.state.send_replace(state);
        info!(listener = self.name, %state, "Listener state changed");
    }
}

/// A bound daemon, ready to run.
pub struct Daemon {
    config: DaemonConfig,
    cau: Arc<CertificateAuthority>,
    cas: Arc<CertificateAuthority>,
    identity: ServerIdentity,
    tls: Arc<TlsContext>,
    http: TcpListener,
    https: TcpListener,
    http_listener: Arc<Listener>,
    https_listener: Arc<Listener>,
}

impl Daemon {
    /// Binds both ports, opens the database and loads or obtains the server
    /// certificate.
    pub async fn bind(config: DaemonConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let host = config.hostname.as_str();
        let http = TcpListener::bind((host, config.http_port))
            .await
            .with_context(|| format!("cannot bind HTTP port {}", config.http_port))?;
        let https_port = config.https_port()?;
        let https = TcpListener::bind((host, https_port))
            .await
            .with_context(|| format!("cannot bind HTTPS port {https_port}"))?;
        let base_url = config.base_url(http.local_addr()?.port());

        let database = SqliteDatabase::open(&config.db_path)
            .await
            .with_context(|| format!("cannot open {}", config.db_path.display()))?;
        let cau = CertificateAuthority::new(
            Arc::new(database.namespace(config.user_storage()).await?),
            config.user_authority(&base_url),
        )
        .await?;
        let cas = CertificateAuthority::new(
            Arc::new(database.namespace(config.service_storage()).await?),
            config.service_authority(&base_url),
        )
        .await?;

        let identity = identity::ensure(&cas, &config.server_key_path, &config.hostname).await?;
        let tls_config = tls::server_config(
            &identity,
            &cas.get_valid_ca_chain().await?,
            &cau.get_valid_ca_chain().await?,
        )?;

        info!(
            http = %http.local_addr()?,
            https = %https.local_addr()?,
            %base_url,
            "Daemon bound"
        );

        Ok(Self {
            config,
            cau: Arc::new(cau),
            cas: Arc::new(cas),
            identity,
            tls: Arc::new(TlsContext::new(tls_config)),
            http,
            https,
            http_listener: Listener::new("http"),
            https_listener: Listener::new("https"),
        })
    }

    /// Plain HTTP address.
    pub fn http_addr(&self) -> std::io::Result<SocketAddr> {
        self.http.local_addr()
    }

    /// HTTPS address.
    pub fn https_addr(&self) -> std::io::Result<SocketAddr> {
        self.https.local_addr()
    }

    /// User authority.
    pub fn cau(&self) -> &Arc<CertificateAuthority> {
        &self.cau
    }

    /// Service authority.
    pub fn cas(&self) -> &Arc<CertificateAuthority> {
        &self.cas
    }

    /// Watches the `(http, https)` listener states.
    pub fn listener_states(
        &self,
    ) -> (watch::Receiver<ListenerState>, watch::Receiver<ListenerState>) {
        (
            self.http_listener.state.subscribe(),
            self.https_listener.state.subscribe(),
        )
    }

    /// Serves until `shutdown` turns true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let auth: Arc<dyn AuthBackend> = Arc::new(ClientCertificateBackend::new(self.cau.clone()));
        let router = Application::new(self.cau.clone(), self.cas.clone(), auth).router();

        let https = TlsListener::spawn(self.https, self.tls.clone())?;
        let http_task = tokio::spawn(serve_http(
            self.http,
            router.clone(),
            self.http_listener,
            shutdown.clone(),
        ));
        let https_task = tokio::spawn(serve_https(
            https,
            router,
            self.https_listener,
            shutdown.clone(),
        ));
        let maintenance = Maintenance {
            config: self.config,
            cau: self.cau,
            cas: self.cas,
            identity: self.identity,
            tls: self.tls,
        };
        let maintenance_task = tokio::spawn(maintenance.run(shutdown));

        let (http, https, maintenance) = tokio::join!(http_task, https_task, maintenance_task);
        http.context("HTTP listener panicked")??;
        https.context("HTTPS listener panicked")??;
        maintenance.context("maintenance task panicked")??;
        info!("Daemon stopped");
        Ok(())
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>, listener: Arc<Listener>) {
    // A dropped sender also means shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
    listener.set(ListenerState::Stopping);
}

async fn serve_http(
    tcp: TcpListener,
    router: Router,
    listener: Arc<Listener>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    listener.set(ListenerState::Starting);
    let serve = axum::serve(tcp, router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown, listener.clone()));
    listener.set(ListenerState::Serving);
    let result = serve.await.context("HTTP listener failed");
    listener.set(ListenerState::Stopped);
    result
}

async fn serve_https(
    tls: TlsListener,
    router: Router,
    listener: Arc<Listener>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    listener.set(ListenerState::Starting);
    let serve = axum::serve(tls, router.into_make_service_with_connect_info::<PeerInfo>())
        .with_graceful_shutdown(wait_for_shutdown(shutdown, listener.clone()));
    listener.set(ListenerState::Serving);
    let result = serve.await.context("HTTPS listener failed");
    listener.set(ListenerState::Stopped);
    result
}

/// Server certificate renewal, TLS refresh and backups.
struct Maintenance {
    config: DaemonConfig,
    cau: Arc<CertificateAuthority>,
    cas: Arc<CertificateAuthority>,
    identity: ServerIdentity,
    tls: Arc<TlsContext>,
}

impl Maintenance {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut next_rotation = self.identity.renewal_due(self.config.threshold);
        let mut next_backup = match &self.config.backup_directory {
            Some(dir) => Some(backup::first_due(
                dir,
                self.config.backup_period,
                OffsetDateTime::now_utc(),
            )?),
            None => None,
        };
        let mut chains = self.chains().await?;

        loop {
            let now = OffsetDateTime::now_utc();

            if now >= next_rotation {
                next_rotation = match self.rotate().await {
                    Ok(()) => self.identity.renewal_due(self.config.threshold),
                    Err(e) => {
                        error!(error = %e, "Server certificate renewal failed");
                        now + ROTATION_RETRY
                    }
                };
            }

            match self.chains().await {
                Ok(current) if current != chains => {
                    chains = current;
                    if let Err(e) = self.reload_tls(&chains).await {
                        error!(error = %e, "TLS config refresh failed");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Cannot read CA certificates"),
            }

            if let (Some(due), Some(dir)) = (next_backup, &self.config.backup_directory) {
                if now >= due {
                    next_backup = Some(match backup::write_backup(&self.cau, dir, now).await {
                        Ok(Some(_)) => now + self.config.backup_period,
                        Ok(None) => now + BACKUP_RETRY,
                        Err(e) => {
                            error!(error = %e, "Backup failed");
                            now + BACKUP_RETRY
                        }
                    });
                }
            }

            let mut wake = (now + MAINTENANCE_INTERVAL).min(next_rotation);
            if let Some(due) = next_backup {
                wake = wake.min(due);
            }
            let delay = std::time::Duration::try_from(wake - OffsetDateTime::now_utc())
                .unwrap_or_default();

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
        Ok(())
    }

    async fn chains(&self) -> anyhow::Result<(Vec<String>, Vec<String>)> {
        Ok((
            self.cas.get_valid_ca_chain().await?,
            self.cau.get_valid_ca_chain().await?,
        ))
    }

    async fn rotate(&mut self) -> anyhow::Result<()> {
        self.identity = identity::rotate(
            &self.cas,
            &self.identity,
            &self.config.server_key_path,
            &self.config.hostname,
        )
        .await?;
        let chains = self.chains().await?;
        self.reload_tls(&chains).await
    }

    async fn reload_tls(&self, (service, user): &(Vec<String>, Vec<String>)) -> anyhow::Result<()> {
        let config = tls::server_config(&self.identity, service, user)?;
        self.tls.replace(config).await;
        info!("TLS config reloaded");
        Ok(())
    }
}
