//! Shared fixtures for the engine tests.

#![allow(clippy::disallowed_methods)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};

use caucase_storage::{
    CaKeyPair, CaStorage, CertificateRecord, DatabaseDump, PendingCsr, RevokedEntry, StorageError,
};
use caucase_storage_sqlite::{SqliteStorage, SqliteStorageConfig};

pub async fn open_storage(dir: &Path, prefix: &str, max_csr_amount: u64) -> Arc<dyn CaStorage> {
    Arc::new(
        SqliteStorage::open(
            dir.join("caucase.sqlite"),
            SqliteStorageConfig::new(prefix, max_csr_amount),
        )
        .await
        .unwrap(),
    )
}

pub fn new_key() -> KeyPair {
    KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap()
}

pub fn csr_for(key: &KeyPair, common_name: &str) -> String {
    let mut params = CertificateParams::new(vec![format!("{common_name}.example.com")]).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.serialize_request(key).unwrap().pem().unwrap()
}

/// Delegates to a real backend, optionally failing certificate storage.
pub struct FailingStorage {
    pub inner: Arc<dyn CaStorage>,
    pub fail_store: AtomicBool,
}

impl FailingStorage {
    pub fn new(inner: Arc<dyn CaStorage>) -> Self {
        Self {
            inner,
            fail_store: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl CaStorage for FailingStorage {
    fn namespace(&self) -> &str {
        self.inner.namespace()
    }

    async fn append_pending_csr(
        &self,
        csr_pem: &str,
        override_limits: bool,
    ) -> Result<u64, StorageError> {
        self.inner.append_pending_csr(csr_pem, override_limits).await
    }

    async fn get_pending_csr(&self, id: u64) -> Result<String, StorageError> {
        self.inner.get_pending_csr(id).await
    }

    async fn list_pending_csrs(&self) -> Result<Vec<PendingCsr>, StorageError> {
        self.inner.list_pending_csrs().await
    }

    async fn delete_pending_csr(&self, id: u64) -> Result<(), StorageError> {
        self.inner.delete_pending_csr(id).await
    }

    async fn next_serial(&self) -> Result<u64, StorageError> {
        self.inner.next_serial().await
    }

    async fn store_certificate(
        &self,
        csr_id: u64,
        serial: u64,
        crt_pem: &str,
        not_before: i64,
        not_after: i64,
    ) -> Result<(), StorageError> {
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(StorageError::QueryFailed("disk full".into()));
        }
        self.inner
            .store_certificate(csr_id, serial, crt_pem, not_before, not_after)
            .await
    }

    async fn get_certificate(&self, serial: u64) -> Result<CertificateRecord, StorageError> {
        self.inner.get_certificate(serial).await
    }

    async fn get_certificate_by_csr(
        &self,
        csr_id: u64,
    ) -> Result<CertificateRecord, StorageError> {
        self.inner.get_certificate_by_csr(csr_id).await
    }

    async fn list_valid_certificates(
        &self,
        at: i64,
    ) -> Result<Vec<CertificateRecord>, StorageError> {
        self.inner.list_valid_certificates(at).await
    }

    async fn revoke_certificate(&self, serial: u64, at: i64) -> Result<(), StorageError> {
        self.inner.revoke_certificate(serial, at).await
    }

    async fn list_revoked(&self, at: i64) -> Result<Vec<RevokedEntry>, StorageError> {
        self.inner.list_revoked(at).await
    }

    async fn list_ca_key_pairs(&self) -> Result<Vec<CaKeyPair>, StorageError> {
        self.inner.list_ca_key_pairs().await
    }

    async fn append_ca_key_pair(&self, key_pair: &CaKeyPair) -> Result<(), StorageError> {
        self.inner.append_ca_key_pair(key_pair).await
    }

    async fn get_config(&self, name: &str) -> Result<Option<String>, StorageError> {
        self.inner.get_config(name).await
    }

    async fn set_config(&self, name: &str, value: &str) -> Result<(), StorageError> {
        self.inner.set_config(name, value).await
    }

    async fn consume_counter(&self, name: &str, limit: u64) -> Result<bool, StorageError> {
        self.inner.consume_counter(name, limit).await
    }

    async fn is_empty(&self) -> Result<bool, StorageError> {
        self.inner.is_empty().await
    }

    async fn export(&self) -> Result<DatabaseDump, StorageError> {
        self.inner.export().await
    }

    async fn import(&self, dump: &DatabaseDump) -> Result<(), StorageError> {
        self.inner.import(dump).await
    }
}
