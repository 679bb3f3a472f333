//! Caucase daemon - Main entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use caucase_server::{backup, Daemon, DaemonConfig};

#[derive(Parser)]
#[command(name = "caucased")]
#[command(about = "Caucase - certificate authority for users and services")]
#[command(version)]
struct Cli {
    /// Database path
    #[arg(long, default_value = "caucase.sqlite", env = "CAUCASE_DB")]
    db: PathBuf,

    /// Server key and certificate file
    #[arg(long, default_value = "server.key.pem", env = "CAUCASE_SERVER_KEY")]
    server_key: PathBuf,

    /// Host and plain HTTP port; HTTPS listens on the next port (443 for 80)
    #[arg(long, default_value = "localhost:8000", env = "CAUCASE_NETLOC")]
    netloc: String,

    /// Days before expiry at which the server certificate is renewed
    #[arg(long, default_value_t = 31, env = "CAUCASE_THRESHOLD")]
    threshold: u32,

    /// Service certificate validity, in days
    #[arg(long, default_value_t = 93, env = "CAUCASE_SERVICE_CRT_VALIDITY")]
    service_crt_validity: u32,

    /// Maximum pending service CSRs
    #[arg(long, default_value_t = 50, env = "CAUCASE_SERVICE_MAX_CSR")]
    service_max_csr: u64,

    /// Service CSRs approved without operator action
    #[arg(long, default_value_t = 0, env = "CAUCASE_SERVICE_AUTO_APPROVE_COUNT")]
    service_auto_approve_count: u64,

    /// User certificate validity, in days
    #[arg(long, default_value_t = 93, env = "CAUCASE_USER_CRT_VALIDITY")]
    user_crt_validity: u32,

    /// Maximum pending user CSRs
    #[arg(long, default_value_t = 50, env = "CAUCASE_USER_MAX_CSR")]
    user_max_csr: u64,

    /// User CSRs approved without operator action
    #[arg(long, default_value_t = 1, env = "CAUCASE_USER_AUTO_APPROVE_COUNT")]
    user_auto_approve_count: u64,

    /// Make the current auto-approve counts permanent
    #[arg(long, env = "CAUCASE_LOCK_AUTO_APPROVE_COUNT")]
    lock_auto_approve_count: bool,

    /// Backup directory; backups are disabled when unset
    #[arg(long, env = "CAUCASE_BACKUP_DIRECTORY")]
    backup_directory: Option<PathBuf>,

    /// Days between backups
    #[arg(long, default_value_t = 1, env = "CAUCASE_BACKUP_PERIOD")]
    backup_period: u32,

    /// Restore a backup into an empty database, then exit
    #[arg(long, num_args = 4, value_names = ["BACKUP", "KEY", "CSR", "CRT"])]
    restore_backup: Option<Vec<PathBuf>>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", env = "CAUCASE_LOG_LEVEL")]
    log_level: String,
}

impl Cli {
    fn daemon_config(&self) -> anyhow::Result<DaemonConfig> {
        let mut config = DaemonConfig::new(&self.db, &self.server_key, &self.netloc)?;
        config.threshold = Duration::days(self.threshold.into());
        config.service.crt_life_time = Duration::days(self.service_crt_validity.into());
        config.service.max_csr_amount = self.service_max_csr;
        config.service.auto_approve_count = self.service_auto_approve_count;
        config.user.crt_life_time = Duration::days(self.user_crt_validity.into());
        config.user.max_csr_amount = self.user_max_csr;
        config.user.auto_approve_count = self.user_auto_approve_count;
        config.lock_auto_approve_count = self.lock_auto_approve_count;
        config.backup_directory = self.backup_directory.clone();
        config.backup_period = Duration::days(self.backup_period.into());
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log level")?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let config = cli.daemon_config().context("invalid configuration")?;

    if let Some([backup_path, key, csr, crt]) = cli.restore_backup.as_deref() {
        return backup::restore(&config, backup_path, key, csr, crt).await;
    }

    tracing::info!("Starting caucased...");
    let daemon = Daemon::bind(config).await.context("startup failed")?;

    let (stop, shutdown) = watch::channel(false);
    let mut running = tokio::spawn(daemon.run(shutdown));

    tokio::select! {
        result = &mut running => {
            return result.context("daemon panicked")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
        }
    }

    tracing::info!("Shutting down...");
    stop.send_replace(true);
    running.await.context("daemon panicked")??;

    Ok(())
}
