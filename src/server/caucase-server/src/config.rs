//! Daemon configuration.

use std::path::PathBuf;

use anyhow::{bail, Context};
use time::Duration;

use caucase_ca::AuthorityConfig;
use caucase_storage_sqlite::SqliteStorageConfig;

/// Issuance policy of one authority.
#[derive(Debug, Clone)]
pub struct AuthorityPolicy {
    /// Lifetime of issued certificates.
    pub crt_life_time: Duration,
    /// Maximum amount of pending CSRs.
    pub max_csr_amount: u64,
    /// Amount of CSRs approved without operator action.
    pub auto_approve_count: u64,
}

/// Configuration of the `caucased` daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// SQLite database path.
    pub db_path: PathBuf,
    /// File holding the server key and certificate.
    pub server_key_path: PathBuf,
    /// Host name the server is reached at; also its certificate's name.
    pub hostname: String,
    /// Plain HTTP port. `0` binds both listeners to ephemeral ports.
    pub http_port: u16,
    /// How long before expiry the server certificate is renewed.
    pub threshold: Duration,
    /// Policy of the service authority (`cas`).
    pub service: AuthorityPolicy,
    /// Policy of the user authority (`cau`).
    pub user: AuthorityPolicy,
    /// Persist the auto-approve counts permanently.
    pub lock_auto_approve_count: bool,
    /// Where backups go. Backups are disabled when unset.
    pub backup_directory: Option<PathBuf>,
    /// Time between two backups.
    pub backup_period: Duration,
}

impl DaemonConfig {
    /// Creates a config with default policies for the given network location
    /// (`host:port`).
    pub fn new(
        db_path: impl Into<PathBuf>,
        server_key_path: impl Into<PathBuf>,
        netloc: &str,
    ) -> anyhow::Result<Self> {
        let (hostname, http_port) = parse_netloc(netloc)?;
        Ok(Self {
            db_path: db_path.into(),
            server_key_path: server_key_path.into(),
            hostname,
            http_port,
            threshold: Duration::days(31),
            service: AuthorityPolicy {
                crt_life_time: Duration::days(93),
                max_csr_amount: 50,
                auto_approve_count: 0,
            },
            user: AuthorityPolicy {
                crt_life_time: Duration::days(93),
                max_csr_amount: 50,
                auto_approve_count: 1,
            },
            lock_auto_approve_count: false,
            backup_directory: None,
            backup_period: Duration::days(1),
        })
    }

    /// HTTPS port: 443 next to port 80, otherwise the HTTP port plus one.
    pub fn https_port(&self) -> anyhow::Result<u16> {
        match self.http_port {
            0 => Ok(0),
            80 => Ok(443),
            port => port
                .checked_add(1)
                .context("no room for the HTTPS port above the HTTP port"),
        }
    }

    /// Base URL of the plain HTTP listener.
    pub fn base_url(&self, http_port: u16) -> String {
        let host = if self.hostname.contains(':') {
            format!("[{}]", self.hostname)
        } else {
            self.hostname.clone()
        };
        match http_port {
            80 => format!("http://{host}"),
            port => format!("http://{host}:{port}"),
        }
    }

    /// Policy of the user authority.
    pub fn user_authority(&self, base_url: &str) -> AuthorityConfig {
        AuthorityConfig::new(format!("Caucase CAU at {base_url}/cau"), self.user.crt_life_time)
            .with_auto_sign_csr_amount(self.user.auto_approve_count)
            .with_locked_auto_sign(self.lock_auto_approve_count)
    }

    /// Policy of the service authority.
    pub fn service_authority(&self, base_url: &str) -> AuthorityConfig {
        AuthorityConfig::new(format!("Caucase CAS at {base_url}/cas"), self.service.crt_life_time)
            .with_auto_sign_csr_amount(self.service.auto_approve_count)
            .with_locked_auto_sign(self.lock_auto_approve_count)
            .with_crl_url(format!("{base_url}/cas/crl"))
    }

    /// Storage namespace of the user authority.
    pub fn user_storage(&self) -> SqliteStorageConfig {
        SqliteStorageConfig::new("cau", self.user.max_csr_amount)
    }

    /// Storage namespace of the service authority.
    pub fn service_storage(&self) -> SqliteStorageConfig {
        SqliteStorageConfig::new("cas", self.service.max_csr_amount)
    }

    /// Validates the config.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hostname.is_empty() {
            bail!("hostname cannot be empty");
        }
        for (name, policy) in [("service", &self.service), ("user", &self.user)] {
            if policy.crt_life_time <= Duration::ZERO {
                bail!("{name} certificate validity must be positive");
            }
            if policy.max_csr_amount == 0 {
                bail!("{name} pending CSR amount must be positive");
            }
        }
        if self.threshold <= Duration::ZERO || self.threshold >= self.service.crt_life_time {
            bail!("renewal threshold must be shorter than the service certificate validity");
        }
        if self.backup_period <= Duration::ZERO {
            bail!("backup period must be positive");
        }
        self.https_port()?;
        Ok(())
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn parse_netloc(netloc: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = netloc
        .rsplit_once(':')
        .with_context(|| format!("network location {netloc:?} has no port"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        bail!("network location {netloc:?} has no host");
    }
    let port = port
        .parse()
        .with_context(|| format!("invalid port in {netloc:?}"))?;
    Ok((host.to_owned(), port))
}
