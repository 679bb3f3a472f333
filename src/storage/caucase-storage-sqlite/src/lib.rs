//! # Caucase Storage - SQLite Backend
//!
//! All authorities share one database file. Each authority gets its own set
//! of tables named after its namespace (`cau_csr`, `cau_crt`, `cau_ca`,
//! `cau_config`, ...), registered in `caucase_namespaces` so that a backup can
//! enumerate them.
//!
//! SQLite allows a single writer per file, so write operations of every
//! namespace queue on one lock held for the duration of their transaction.
//! Reads never take the lock.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use caucase_storage::{
    CaKeyPair, CaStorage, CertificateRecord, CsrRow, DatabaseDump, NamespaceDump, PendingCsr,
    RevokedEntry, StorageError,
};

const REGISTRY_TABLE: &str = "caucase_namespaces";
const SERIAL_KEY: &str = "next_serial";

fn query_failed(e: sqlx::Error) -> StorageError {
    StorageError::QueryFailed(e.to_string())
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Settings of one authority namespace.
#[derive(Debug, Clone)]
pub struct SqliteStorageConfig {
    /// Table prefix, `[a-z][a-z0-9_]*`.
    pub table_prefix: String,
    /// Maximum amount of pending CSRs.
    pub max_csr_amount: u64,
}

impl SqliteStorageConfig {
    /// Creates a namespace config.
    pub fn new(table_prefix: impl Into<String>, max_csr_amount: u64) -> Self {
        Self {
            table_prefix: table_prefix.into(),
            max_csr_amount,
        }
    }

    /// Validates the config.
    pub fn validate(&self) -> Result<(), StorageError> {
        validate_prefix(&self.table_prefix)?;
        if self.max_csr_amount == 0 {
            return Err(StorageError::InvalidInput(
                "max_csr_amount must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Only allows lowercase letters, digits and underscore, starting with a letter.
/// The prefix ends up in table names.
fn validate_prefix(prefix: &str) -> Result<(), StorageError> {
    if prefix.is_empty() || prefix.len() > 32 {
        return Err(StorageError::InvalidInput(
            "table prefix must be 1 to 32 characters".into(),
        ));
    }
    let mut chars = prefix.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(StorageError::InvalidInput(
            "table prefix must match [a-z][a-z0-9_]*".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Tables {
    csr: String,
    crt: String,
    ca: String,
    config: String,
}

impl Tables {
    fn new(prefix: &str) -> Self {
        Self {
            csr: format!("{prefix}_csr"),
            crt: format!("{prefix}_crt"),
            ca: format!("{prefix}_ca"),
            config: format!("{prefix}_config"),
        }
    }
}

async fn create_tables(
    conn: &mut SqliteConnection,
    prefix: &str,
    tables: &Tables,
) -> Result<(), StorageError> {
    let Tables {
        csr,
        crt,
        ca,
        config,
    } = tables;
    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS {csr} (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                csr        TEXT NOT NULL,
                pending    INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{csr}_pending ON {csr} (pending)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {crt} (
                serial     INTEGER PRIMARY KEY,
                csr_id     INTEGER NOT NULL UNIQUE,
                crt        TEXT NOT NULL,
                not_before INTEGER NOT NULL,
                not_after  INTEGER NOT NULL,
                revoked_at INTEGER
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{crt}_not_after ON {crt} (not_after)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {ca} (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                key        TEXT NOT NULL,
                crt        TEXT NOT NULL,
                not_before INTEGER NOT NULL,
                not_after  INTEGER NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {config} (
                name  TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"
        ),
    ];
    for statement in &statements {
        sqlx::query(statement)
            .execute(&mut *conn)
            .await
            .map_err(|e| StorageError::ConnectionFailed(format!("migration failed: {e}")))?;
    }
    sqlx::query(&format!(
        "INSERT OR IGNORE INTO {REGISTRY_TABLE} (prefix) VALUES (?)"
    ))
    .bind(prefix)
    .execute(&mut *conn)
    .await
    .map_err(query_failed)?;
    Ok(())
}

/// An open database file, shared by every namespace stored in it.
#[derive(Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    db_path: PathBuf,
}

impl SqliteDatabase {
    /// Opens or creates the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::ConnectionFailed(format!("failed to create directory: {e}"))
            })?;
        }

        debug!(path = %db_path.display(), "Opening SQLite database");

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {REGISTRY_TABLE} (prefix TEXT PRIMARY KEY)"
        ))
        .execute(&pool)
        .await
        .map_err(|e| StorageError::ConnectionFailed(format!("migration failed: {e}")))?;

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            db_path,
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Closes every connection of every namespace. The write-ahead log is
    /// checkpointed into the main file, which can then be moved.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!(path = %self.db_path.display(), "SQLite database closed");
    }

    /// Binds a storage instance to one namespace, creating its tables.
    pub async fn namespace(&self, config: SqliteStorageConfig) -> Result<SqliteStorage, StorageError> {
        config.validate()?;
        let tables = Tables::new(&config.table_prefix);
        {
            let _guard = self.write_lock.lock().await;
            let mut conn = self.pool.acquire().await.map_err(query_failed)?;
            create_tables(&mut *conn, &config.table_prefix, &tables).await?;
        }

        info!(namespace = %config.table_prefix, max_csr = config.max_csr_amount, "SQLite namespace ready");

        Ok(SqliteStorage {
            db: self.clone(),
            namespace: config.table_prefix,
            tables,
            max_csr_amount: config.max_csr_amount,
        })
    }

    async fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> =
            sqlx::query_as(&format!("SELECT prefix FROM {REGISTRY_TABLE} ORDER BY prefix"))
                .fetch_all(&self.pool)
                .await
                .map_err(query_failed)?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    /// Whether no namespace holds any row.
    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        for prefix in self.namespaces().await? {
            let t = Tables::new(&prefix);
            let (count,): (i64,) = sqlx::query_as(&format!(
                "SELECT (SELECT COUNT(*) FROM {}) + (SELECT COUNT(*) FROM {}) \
                 + (SELECT COUNT(*) FROM {}) + (SELECT COUNT(*) FROM {})",
                t.csr, t.crt, t.ca, t.config
            ))
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed)?;
            if count > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Reads every namespace inside one transaction, so the dump is a single
    /// snapshot even while writers keep going.
    async fn export(&self) -> Result<DatabaseDump, StorageError> {
        let mut tx = self.pool.begin().await.map_err(query_failed)?;
        let prefixes: Vec<(String,)> =
            sqlx::query_as(&format!("SELECT prefix FROM {REGISTRY_TABLE} ORDER BY prefix"))
                .fetch_all(&mut *tx)
                .await
                .map_err(query_failed)?;

        let mut dump = DatabaseDump::default();
        for (prefix,) in prefixes {
            let t = Tables::new(&prefix);

            let csr: Vec<(i64, String, bool)> =
                sqlx::query_as(&format!("SELECT id, csr, pending FROM {} ORDER BY id", t.csr))
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(query_failed)?;
            let crt: Vec<(i64, i64, String, i64, i64, Option<i64>)> = sqlx::query_as(&format!(
                "SELECT serial, csr_id, crt, not_before, not_after, revoked_at FROM {} ORDER BY serial",
                t.crt
            ))
            .fetch_all(&mut *tx)
            .await
            .map_err(query_failed)?;
            let ca: Vec<(String, String, i64, i64)> = sqlx::query_as(&format!(
                "SELECT key, crt, not_before, not_after FROM {} ORDER BY id",
                t.ca
            ))
            .fetch_all(&mut *tx)
            .await
            .map_err(query_failed)?;
            let config: Vec<(String, String)> =
                sqlx::query_as(&format!("SELECT name, value FROM {}", t.config))
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(query_failed)?;

            dump.namespaces.insert(
                prefix,
                NamespaceDump {
                    csr: csr
                        .into_iter()
                        .map(|(id, csr_pem, pending)| CsrRow {
                            id: id as u64,
                            csr_pem,
                            pending,
                        })
                        .collect(),
                    crt: crt.into_iter().map(certificate_from_row).collect(),
                    ca: ca
                        .into_iter()
                        .map(|(key_pem, crt_pem, not_before, not_after)| CaKeyPair {
                            key_pem,
                            crt_pem,
                            not_before,
                            not_after,
                        })
                        .collect(),
                    config: config.into_iter().collect::<BTreeMap<_, _>>(),
                },
            );
        }
        tx.commit().await.map_err(query_failed)?;
        Ok(dump)
    }

    async fn import(&self, dump: &DatabaseDump) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        if !self.is_empty().await? {
            return Err(StorageError::Conflict("database is not empty".into()));
        }

        let mut tx = self.pool.begin().await.map_err(query_failed)?;
        let created_at = now();
        for (prefix, namespace) in &dump.namespaces {
            validate_prefix(prefix)?;
            let t = Tables::new(prefix);
            create_tables(&mut *tx, prefix, &t).await?;

            for row in &namespace.csr {
                sqlx::query(&format!(
                    "INSERT INTO {} (id, csr, pending, created_at) VALUES (?, ?, ?, ?)",
                    t.csr
                ))
                .bind(row.id as i64)
                .bind(&row.csr_pem)
                .bind(row.pending)
                .bind(created_at)
                .execute(&mut *tx)
                .await
                .map_err(query_failed)?;
            }
            for row in &namespace.crt {
                sqlx::query(&format!(
                    "INSERT INTO {} (serial, csr_id, crt, not_before, not_after, revoked_at) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                    t.crt
                ))
                .bind(row.serial as i64)
                .bind(row.csr_id as i64)
                .bind(&row.crt_pem)
                .bind(row.not_before)
                .bind(row.not_after)
                .bind(row.revoked_at)
                .execute(&mut *tx)
                .await
                .map_err(query_failed)?;
            }
            for row in &namespace.ca {
                sqlx::query(&format!(
                    "INSERT INTO {} (key, crt, not_before, not_after) VALUES (?, ?, ?, ?)",
                    t.ca
                ))
                .bind(&row.key_pem)
                .bind(&row.crt_pem)
                .bind(row.not_before)
                .bind(row.not_after)
                .execute(&mut *tx)
                .await
                .map_err(query_failed)?;
            }
            for (name, value) in &namespace.config {
                sqlx::query(&format!(
                    "INSERT INTO {} (name, value) VALUES (?, ?)",
                    t.config
                ))
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(query_failed)?;
            }
            debug!(
                namespace = %prefix,
                csr = namespace.csr.len(),
                crt = namespace.crt.len(),
                "Imported namespace"
            );
        }
        tx.commit().await.map_err(query_failed)?;

        info!(namespaces = dump.namespaces.len(), "Database dump imported");
        Ok(())
    }
}

fn certificate_from_row(
    (serial, csr_id, crt_pem, not_before, not_after, revoked_at): (
        i64,
        i64,
        String,
        i64,
        i64,
        Option<i64>,
    ),
) -> CertificateRecord {
    CertificateRecord {
        serial: serial as u64,
        csr_id: csr_id as u64,
        crt_pem,
        not_before,
        not_after,
        revoked_at,
    }
}

/// Storage of one authority namespace.
#[derive(Clone)]
pub struct SqliteStorage {
    db: SqliteDatabase,
    namespace: String,
    tables: Tables,
    max_csr_amount: u64,
}

impl SqliteStorage {
    /// Opens the database at `path` and binds the namespace in one step.
    pub async fn open(
        path: impl AsRef<Path>,
        config: SqliteStorageConfig,
    ) -> Result<Self, StorageError> {
        SqliteDatabase::open(path).await?.namespace(config).await
    }

    /// The database this namespace lives in.
    pub fn database(&self) -> &SqliteDatabase {
        &self.db
    }
}

#[async_trait]
impl CaStorage for SqliteStorage {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn append_pending_csr(
        &self,
        csr_pem: &str,
        override_limits: bool,
    ) -> Result<u64, StorageError> {
        let _guard = self.db.write_lock.lock().await;
        let mut tx = self.db.pool.begin().await.map_err(query_failed)?;

        if !override_limits {
            let (pending,): (i64,) = sqlx::query_as(&format!(
                "SELECT COUNT(*) FROM {} WHERE pending = 1",
                self.tables.csr
            ))
            .fetch_one(&mut *tx)
            .await
            .map_err(query_failed)?;
            if pending as u64 >= self.max_csr_amount {
                return Err(StorageError::QuotaExceeded {
                    limit: self.max_csr_amount,
                });
            }
        }

        let id = sqlx::query(&format!(
            "INSERT INTO {} (csr, pending, created_at) VALUES (?, 1, ?)",
            self.tables.csr
        ))
        .bind(csr_pem)
        .bind(now())
        .execute(&mut *tx)
        .await
        .map_err(query_failed)?
        .last_insert_rowid() as u64;

        tx.commit().await.map_err(query_failed)?;

        debug!(namespace = %self.namespace, csr_id = id, "Stored pending CSR");
        Ok(id)
    }

    async fn get_pending_csr(&self, id: u64) -> Result<String, StorageError> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT csr FROM {} WHERE id = ? AND pending = 1",
            self.tables.csr
        ))
        .bind(id as i64)
        .fetch_optional(&self.db.pool)
        .await
        .map_err(query_failed)?;

        row.map(|(pem,)| pem)
            .ok_or_else(|| StorageError::NotFound(format!("csr {id}")))
    }

    async fn list_pending_csrs(&self) -> Result<Vec<PendingCsr>, StorageError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(&format!(
            "SELECT id, csr FROM {} WHERE pending = 1 ORDER BY id",
            self.tables.csr
        ))
        .fetch_all(&self.db.pool)
        .await
        .map_err(query_failed)?;

        Ok(rows
            .into_iter()
            .map(|(id, csr_pem)| PendingCsr {
                id: id as u64,
                csr_pem,
            })
            .collect())
    }

    async fn delete_pending_csr(&self, id: u64) -> Result<(), StorageError> {
        let _guard = self.db.write_lock.lock().await;
        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ? AND pending = 1",
            self.tables.csr
        ))
        .bind(id as i64)
        .execute(&self.db.pool)
        .await
        .map_err(query_failed)?
        .rows_affected();

        if deleted == 0 {
            return Err(StorageError::NotFound(format!("csr {id}")));
        }
        debug!(namespace = %self.namespace, csr_id = id, "Deleted pending CSR");
        Ok(())
    }

    async fn next_serial(&self) -> Result<u64, StorageError> {
        let _guard = self.db.write_lock.lock().await;
        let mut tx = self.db.pool.begin().await.map_err(query_failed)?;

        let current: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT value FROM {} WHERE name = ?",
            self.tables.config
        ))
        .bind(SERIAL_KEY)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_failed)?;
        let serial = match current {
            Some((value,)) => value
                .parse::<u64>()
                .map_err(|e| StorageError::InvalidInput(format!("corrupt serial counter: {e}")))?,
            None => 1,
        };

        sqlx::query(&format!(
            "INSERT INTO {} (name, value) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            self.tables.config
        ))
        .bind(SERIAL_KEY)
        .bind((serial + 1).to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_failed)?;

        tx.commit().await.map_err(query_failed)?;
        Ok(serial)
    }

    async fn store_certificate(
        &self,
        csr_id: u64,
        serial: u64,
        crt_pem: &str,
        not_before: i64,
        not_after: i64,
    ) -> Result<(), StorageError> {
        let _guard = self.db.write_lock.lock().await;
        let mut tx = self.db.pool.begin().await.map_err(query_failed)?;

        let consumed = sqlx::query(&format!(
            "UPDATE {} SET pending = 0 WHERE id = ? AND pending = 1",
            self.tables.csr
        ))
        .bind(csr_id as i64)
        .execute(&mut *tx)
        .await
        .map_err(query_failed)?
        .rows_affected();

        if consumed == 0 {
            let exists: Option<(i64,)> =
                sqlx::query_as(&format!("SELECT id FROM {} WHERE id = ?", self.tables.csr))
                    .bind(csr_id as i64)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(query_failed)?;
            return Err(match exists {
                Some(_) => StorageError::Conflict(format!("csr {csr_id} already consumed")),
                None => StorageError::NotFound(format!("csr {csr_id}")),
            });
        }

        sqlx::query(&format!(
            "INSERT INTO {} (serial, csr_id, crt, not_before, not_after) VALUES (?, ?, ?, ?, ?)",
            self.tables.crt
        ))
        .bind(serial as i64)
        .bind(csr_id as i64)
        .bind(crt_pem)
        .bind(not_before)
        .bind(not_after)
        .execute(&mut *tx)
        .await
        .map_err(query_failed)?;

        tx.commit().await.map_err(query_failed)?;

        debug!(namespace = %self.namespace, csr_id, serial, "Stored certificate");
        Ok(())
    }

    async fn get_certificate(&self, serial: u64) -> Result<CertificateRecord, StorageError> {
        let row: Option<(i64, i64, String, i64, i64, Option<i64>)> = sqlx::query_as(&format!(
            "SELECT serial, csr_id, crt, not_before, not_after, revoked_at FROM {} WHERE serial = ?",
            self.tables.crt
        ))
        .bind(serial as i64)
        .fetch_optional(&self.db.pool)
        .await
        .map_err(query_failed)?;

        row.map(certificate_from_row)
            .ok_or_else(|| StorageError::NotFound(format!("certificate {serial}")))
    }

    async fn get_certificate_by_csr(
        &self,
        csr_id: u64,
    ) -> Result<CertificateRecord, StorageError> {
        let row: Option<(i64, i64, String, i64, i64, Option<i64>)> = sqlx::query_as(&format!(
            "SELECT serial, csr_id, crt, not_before, not_after, revoked_at FROM {} WHERE csr_id = ?",
            self.tables.crt
        ))
        .bind(csr_id as i64)
        .fetch_optional(&self.db.pool)
        .await
        .map_err(query_failed)?;

        row.map(certificate_from_row)
            .ok_or_else(|| StorageError::NotFound(format!("certificate for csr {csr_id}")))
    }

    async fn list_valid_certificates(
        &self,
        at: i64,
    ) -> Result<Vec<CertificateRecord>, StorageError> {
        let rows: Vec<(i64, i64, String, i64, i64, Option<i64>)> = sqlx::query_as(&format!(
            "SELECT serial, csr_id, crt, not_before, not_after, revoked_at FROM {} \
             WHERE revoked_at IS NULL AND not_before <= ? AND not_after > ? ORDER BY serial",
            self.tables.crt
        ))
        .bind(at)
        .bind(at)
        .fetch_all(&self.db.pool)
        .await
        .map_err(query_failed)?;

        Ok(rows.into_iter().map(certificate_from_row).collect())
    }

    async fn revoke_certificate(&self, serial: u64, at: i64) -> Result<(), StorageError> {
        let _guard = self.db.write_lock.lock().await;
        let revoked = sqlx::query(&format!(
            "UPDATE {} SET revoked_at = ? WHERE serial = ? AND revoked_at IS NULL",
            self.tables.crt
        ))
        .bind(at)
        .bind(serial as i64)
        .execute(&self.db.pool)
        .await
        .map_err(query_failed)?
        .rows_affected();

        if revoked == 0 {
            let exists: Option<(i64,)> = sqlx::query_as(&format!(
                "SELECT serial FROM {} WHERE serial = ?",
                self.tables.crt
            ))
            .bind(serial as i64)
            .fetch_optional(&self.db.pool)
            .await
            .map_err(query_failed)?;
            if exists.is_none() {
                return Err(StorageError::NotFound(format!("certificate {serial}")));
            }
            return Ok(());
        }

        info!(namespace = %self.namespace, serial, "Certificate revoked");
        Ok(())
    }

    async fn list_revoked(&self, at: i64) -> Result<Vec<RevokedEntry>, StorageError> {
        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(&format!(
            "SELECT serial, revoked_at, not_after FROM {} \
             WHERE revoked_at IS NOT NULL AND not_after > ? ORDER BY serial",
            self.tables.crt
        ))
        .bind(at)
        .fetch_all(&self.db.pool)
        .await
        .map_err(query_failed)?;

        Ok(rows
            .into_iter()
            .map(|(serial, revoked_at, not_after)| RevokedEntry {
                serial: serial as u64,
                revoked_at,
                not_after,
            })
            .collect())
    }

    async fn list_ca_key_pairs(&self) -> Result<Vec<CaKeyPair>, StorageError> {
        let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(&format!(
            "SELECT key, crt, not_before, not_after FROM {} ORDER BY not_after, id",
            self.tables.ca
        ))
        .fetch_all(&self.db.pool)
        .await
        .map_err(query_failed)?;

        Ok(rows
            .into_iter()
            .map(|(key_pem, crt_pem, not_before, not_after)| CaKeyPair {
                key_pem,
                crt_pem,
                not_before,
                not_after,
            })
            .collect())
    }

    async fn append_ca_key_pair(&self, key_pair: &CaKeyPair) -> Result<(), StorageError> {
        let _guard = self.db.write_lock.lock().await;
        sqlx::query(&format!(
            "INSERT INTO {} (key, crt, not_before, not_after) VALUES (?, ?, ?, ?)",
            self.tables.ca
        ))
        .bind(&key_pair.key_pem)
        .bind(&key_pair.crt_pem)
        .bind(key_pair.not_before)
        .bind(key_pair.not_after)
        .execute(&self.db.pool)
        .await
        .map_err(query_failed)?;
        Ok(())
    }

    async fn get_config(&self, name: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT value FROM {} WHERE name = ?",
            self.tables.config
        ))
        .bind(name)
        .fetch_optional(&self.db.pool)
        .await
        .map_err(query_failed)?;
        Ok(row.map(|(value,)| value))
    }

    async fn set_config(&self, name: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.db.write_lock.lock().await;
        sqlx::query(&format!(
            "INSERT INTO {} (name, value) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            self.tables.config
        ))
        .bind(name)
        .bind(value)
        .execute(&self.db.pool)
        .await
        .map_err(query_failed)?;
        Ok(())
    }

    async fn consume_counter(&self, name: &str, limit: u64) -> Result<bool, StorageError> {
        let _guard = self.db.write_lock.lock().await;
        let mut tx = self.db.pool.begin().await.map_err(query_failed)?;

        let current: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT value FROM {} WHERE name = ?",
            self.tables.config
        ))
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_failed)?;
        let count = match current {
            Some((value,)) => value
                .parse::<u64>()
                .map_err(|e| StorageError::InvalidInput(format!("corrupt counter {name}: {e}")))?,
            None => 0,
        };
        if count >= limit {
            return Ok(false);
        }

        sqlx::query(&format!(
            "INSERT INTO {} (name, value) VALUES (?, ?) \
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            self.tables.config
        ))
        .bind(name)
        .bind((count + 1).to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_failed)?;

        tx.commit().await.map_err(query_failed)?;
        Ok(true)
    }

    async fn is_empty(&self) -> Result<bool, StorageError> {
        self.db.is_empty().await
    }

    async fn export(&self) -> Result<DatabaseDump, StorageError> {
        self.db.export().await
    }

    async fn import(&self, dump: &DatabaseDump) -> Result<(), StorageError> {
        self.db.import(dump).await
    }
}
