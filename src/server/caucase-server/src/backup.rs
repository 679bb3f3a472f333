//! Periodic backup files and restoration.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use time::{Duration, OffsetDateTime};
use tracing::info;

use caucase_ca::CertificateAuthority;
use caucase_storage_sqlite::SqliteDatabase;

use crate::config::DaemonConfig;

/// Suffix of backup file names.
pub const BACKUP_SUFFIX: &str = ".sql.caucased";

/// Delay before retrying a failed or skipped backup.
pub const BACKUP_RETRY: Duration = Duration::hours(1);

/// When the first backup is due: one period after the newest existing
/// backup, or immediately when there is none.
pub fn first_due(
    directory: &Path,
    period: Duration,
    now: OffsetDateTime,
) -> anyhow::Result<OffsetDateTime> {
    let mut newest: Option<OffsetDateTime> = None;
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(now),
        Err(e) => {
            return Err(e).with_context(|| format!("cannot list {}", directory.display()));
        }
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().ends_with(BACKUP_SUFFIX) {
            continue;
        }
        let modified = OffsetDateTime::from(entry.metadata()?.modified()?);
        newest = Some(newest.map_or(modified, |n| n.max(modified)));
    }
    Ok(newest.map_or(now, |n| n + period))
}

/// File name of a backup taken at `at`.
pub fn backup_name(at: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}{BACKUP_SUFFIX}",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

/// Writes a backup into `directory`. Returns `None` when there was nobody
/// to encrypt it for.
pub async fn write_backup(
    cau: &CertificateAuthority,
    directory: &Path,
    now: OffsetDateTime,
) -> anyhow::Result<Option<PathBuf>> {
    let mut envelope = Vec::new();
    if !cau.do_backup(&mut envelope).await? {
        return Ok(None);
    }

    let directory = directory.to_path_buf();
    let target = directory.join(backup_name(now));
    let written = target.clone();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        std::fs::create_dir_all(&directory)
            .with_context(|| format!("cannot create {}", directory.display()))?;
        let mut file = tempfile::NamedTempFile::new_in(&directory)?;
        file.write_all(&envelope)?;
        file.as_file().sync_all()?;
        file.persist(&target)
            .with_context(|| format!("cannot write {}", target.display()))?;
        Ok(())
    })
    .await??;

    info!(path = %written.display(), "Backup stored");
    Ok(Some(written))
}

/// Restores `backup` into a new database at the configured path, then
/// writes the operator's new certificate to `crt_out`.
///
/// The database is built in a staging directory next to the target and only
/// moved into place once restoration succeeded, so a failed attempt leaves
/// nothing behind.
pub async fn restore(
    config: &DaemonConfig,
    backup: &Path,
    key: &Path,
    csr: &Path,
    crt_out: &Path,
) -> anyhow::Result<()> {
    if config.db_path.exists() {
        bail!(
            "{} already exists, refusing to restore over it",
            config.db_path.display()
        );
    }
    let key_pem = tokio::fs::read_to_string(key)
        .await
        .with_context(|| format!("cannot read {}", key.display()))?;
    let csr_pem = tokio::fs::read_to_string(csr)
        .await
        .with_context(|| format!("cannot read {}", csr.display()))?;
    let mut reader = tokio::fs::File::open(backup)
        .await
        .with_context(|| format!("cannot open {}", backup.display()))?;

    let parent = match config.db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("cannot create {}", parent.display()))?;
    let staging = tempfile::Builder::new()
        .prefix(".caucase-restore")
        .tempdir_in(&parent)
        .with_context(|| format!("cannot create a staging directory in {}", parent.display()))?;
    let staged_db = staging.path().join("caucase.sqlite");

    let database = SqliteDatabase::open(&staged_db).await?;
    let base_url = config.base_url(config.http_port);
    let restored = async {
        let storage = Arc::new(database.namespace(config.user_storage()).await?);
        let crt_pem = CertificateAuthority::restore_backup(
            storage,
            config.user_authority(&base_url),
            &mut reader,
            &key_pem,
            &csr_pem,
        )
        .await
        .context("restoration failed")?;
        anyhow::Ok(crt_pem)
    }
    .await;
    database.close().await;
    let crt_pem = restored?;

    if config.db_path.exists() {
        bail!(
            "{} appeared during restoration, leaving it alone",
            config.db_path.display()
        );
    }
    tokio::fs::rename(&staged_db, &config.db_path)
        .await
        .with_context(|| format!("cannot move restored database to {}", config.db_path.display()))?;

    tokio::fs::write(crt_out, crt_pem)
        .await
        .with_context(|| format!("cannot write {}", crt_out.display()))?;
    info!(
        database = %config.db_path.display(),
        certificate = %crt_out.display(),
        "Backup restored"
    );
    Ok(())
}
