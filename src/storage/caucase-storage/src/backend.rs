//! Storage trait definition and row types.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// A CSR waiting for approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCsr {
    /// Monotonic per-namespace identifier.
    pub id: u64,
    /// PEM-encoded request.
    pub csr_pem: String,
}

/// An issued certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// Certificate serial number.
    pub serial: u64,
    /// CSR the certificate was issued from.
    pub csr_id: u64,
    /// PEM-encoded certificate.
    pub crt_pem: String,
    /// Start of validity, Unix seconds.
    pub not_before: i64,
    /// End of validity (exclusive), Unix seconds.
    pub not_after: i64,
    /// Revocation time, Unix seconds.
    pub revoked_at: Option<i64>,
}

impl CertificateRecord {
    /// Whether the certificate was revoked.
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// A revoked certificate that has not expired yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevokedEntry {
    /// Certificate serial number.
    pub serial: u64,
    /// Revocation time, Unix seconds.
    pub revoked_at: i64,
    /// End of validity, Unix seconds.
    pub not_after: i64,
}

/// One of the authority's own key pairs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaKeyPair {
    /// PKCS#8 PEM private key.
    pub key_pem: String,
    /// Self-signed CA certificate.
    pub crt_pem: String,
    /// Start of validity, Unix seconds.
    pub not_before: i64,
    /// End of validity, Unix seconds.
    pub not_after: i64,
}

impl std::fmt::Debug for CaKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaKeyPair")
            .field("key_pem", &"[REDACTED]")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

/// A CSR row in any state, as exported in a dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrRow {
    /// CSR identifier.
    pub id: u64,
    /// PEM-encoded request.
    pub csr_pem: String,
    /// False once a certificate was issued for it.
    pub pending: bool,
}

/// Every row of one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceDump {
    /// CSR rows, pending or consumed.
    pub csr: Vec<CsrRow>,
    /// Issued certificates.
    pub crt: Vec<CertificateRecord>,
    /// CA key pairs.
    pub ca: Vec<CaKeyPair>,
    /// Config table (counters, locked settings).
    pub config: BTreeMap<String, String>,
}

/// Every namespace of a database; the plaintext of a backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDump {
    /// Namespace contents keyed by table prefix.
    pub namespaces: BTreeMap<String, NamespaceDump>,
}

/// Persistence contract of one certificate authority.
///
/// Implementations must serialise writes within a namespace; reads may run
/// concurrently with each other.
#[async_trait]
pub trait CaStorage: Send + Sync {
    /// Namespace (table prefix) this instance is bound to.
    fn namespace(&self) -> &str;

    /// Stores a new pending CSR and returns its id.
    ///
    /// Fails with `QuotaExceeded` when the pending queue is full, unless
    /// `override_limits` is set.
    async fn append_pending_csr(
        &self,
        csr_pem: &str,
        override_limits: bool,
    ) -> Result<u64, StorageError>;

    /// Returns a pending CSR. Fails with `NotFound` if absent or consumed.
    async fn get_pending_csr(&self, id: u64) -> Result<String, StorageError>;

    /// Lists pending CSRs in insertion order.
    async fn list_pending_csrs(&self) -> Result<Vec<PendingCsr>, StorageError>;

    /// Lists pending CSR ids in insertion order.
    async fn list_pending_csr_ids(&self) -> Result<Vec<u64>, StorageError> {
        Ok(self
            .list_pending_csrs()
            .await?
            .into_iter()
            .map(|csr| csr.id)
            .collect())
    }

    /// Deletes a pending CSR. Fails with `NotFound` if absent.
    async fn delete_pending_csr(&self, id: u64) -> Result<(), StorageError>;

    /// Allocates the next serial number. Serials are never reused.
    async fn next_serial(&self) -> Result<u64, StorageError>;

    /// Stores an issued certificate and marks its CSR consumed.
    ///
    /// Fails with `Conflict` if the CSR was already consumed and with
    /// `NotFound` if it does not exist.
    async fn store_certificate(
        &self,
        csr_id: u64,
        serial: u64,
        crt_pem: &str,
        not_before: i64,
        not_after: i64,
    ) -> Result<(), StorageError>;

    /// Returns a certificate, revoked or not. Fails with `NotFound`.
    async fn get_certificate(&self, serial: u64) -> Result<CertificateRecord, StorageError>;

    /// Returns the certificate issued from CSR `csr_id`. Fails with
    /// `NotFound` while the CSR is pending, or if it was deleted or never
    /// existed.
    async fn get_certificate_by_csr(&self, csr_id: u64)
        -> Result<CertificateRecord, StorageError>;

    /// Certificates with `not_before <= at < not_after` that are not revoked.
    async fn list_valid_certificates(&self, at: i64)
        -> Result<Vec<CertificateRecord>, StorageError>;

    /// Revokes a certificate at time `at`.
    ///
    /// Revoking twice is a no-op that keeps the first revocation time.
    /// Fails with `NotFound` if the serial was never issued.
    async fn revoke_certificate(&self, serial: u64, at: i64) -> Result<(), StorageError>;

    /// Revoked certificates still within their validity at `at`.
    async fn list_revoked(&self, at: i64) -> Result<Vec<RevokedEntry>, StorageError>;

    /// CA key pairs, oldest expiry first.
    async fn list_ca_key_pairs(&self) -> Result<Vec<CaKeyPair>, StorageError>;

    /// Appends a CA key pair.
    async fn append_ca_key_pair(&self, key_pair: &CaKeyPair) -> Result<(), StorageError>;

    /// Reads a config value.
    async fn get_config(&self, name: &str) -> Result<Option<String>, StorageError>;

    /// Writes a config value.
    async fn set_config(&self, name: &str, value: &str) -> Result<(), StorageError>;

    /// Atomically increments counter `name` if it is below `limit`.
    ///
    /// Returns whether the counter was incremented.
    async fn consume_counter(&self, name: &str, limit: u64) -> Result<bool, StorageError>;

    /// Whether the whole database holds no rows at all.
    async fn is_empty(&self) -> Result<bool, StorageError>;

    /// Exports every namespace of the database.
    async fn export(&self) -> Result<DatabaseDump, StorageError>;

    /// Replays a dump into this (empty) database, preserving ids and serials.
    async fn import(&self, dump: &DatabaseDump) -> Result<(), StorageError>;
}
