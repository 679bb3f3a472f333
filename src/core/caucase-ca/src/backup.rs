//! Encrypted backups of the whole database.
//!
//! A backup is a JSON dump of every namespace sealed in a multi-recipient
//! envelope: any holder of a currently valid certificate of the authority
//! that took the backup can open it with their private key.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};
use zeroize::Zeroizing;

use caucase_crypto::{open_envelope, seal_envelope, PrivateKey, Recipient};
use caucase_storage::{CaStorage, DatabaseDump, StorageError};

use crate::authority::CertificateAuthority;
use crate::config::AuthorityConfig;
use crate::error::CaError;
use crate::x509;

impl CertificateAuthority {
    /// Writes an encrypted backup of the database to `writer`.
    ///
    /// Returns `false` without writing anything when no valid certificate
    /// exists to encrypt the backup for.
    pub async fn do_backup<W>(&self, writer: &mut W) -> Result<bool, CaError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let now = self.now().unix_timestamp();
        let holders = self.storage.list_valid_certificates(now).await?;
        if holders.is_empty() {
            warn!(authority = %self.name(), "No valid certificate to encrypt a backup for");
            return Ok(false);
        }

        let recipients = holders
            .iter()
            .map(|record| {
                Ok(Recipient {
                    serial: record.serial,
                    public_key: x509::parse_certificate(&record.crt_pem)?.public_key()?,
                })
            })
            .collect::<Result<Vec<_>, CaError>>()?;

        let dump = self.storage.export().await?;
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&dump)
                .map_err(|e| CaError::Storage(StorageError::Serialization(e.to_string())))?,
        );
        let envelope = seal_envelope(&plaintext, &recipients)?;

        writer.write_all(&envelope).await?;
        writer.flush().await?;

        info!(
            authority = %self.name(),
            recipients = recipients.len(),
            bytes = envelope.len(),
            "Backup written"
        );
        Ok(true)
    }

    /// Restores a backup into an empty database.
    ///
    /// `key_pem` is the PKCS#8 private key of one of the backup recipients.
    /// A certificate is issued for `csr_pem` so the operator regains access,
    /// and every certificate sharing the restoring key is revoked since that
    /// key has now been handled outside of its usual holder. Returns the new
    /// certificate.
    pub async fn restore_backup<R>(
        storage: Arc<dyn CaStorage>,
        config: AuthorityConfig,
        reader: &mut R,
        key_pem: &str,
        csr_pem: &str,
    ) -> Result<String, CaError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if !storage.is_empty().await? {
            return Err(CaError::NotEmpty);
        }
        let key = PrivateKey::from_pkcs8_pem(key_pem)
            .map_err(|e| CaError::Decode(format!("restore key: {e}")))?;
        x509::parse_csr(csr_pem)?;

        let mut envelope = Vec::new();
        reader.read_to_end(&mut envelope).await?;
        let plaintext = open_envelope(&envelope, &key)?;
        let dump: DatabaseDump = serde_json::from_slice(&plaintext)
            .map_err(|e| CaError::Decode(format!("corrupt backup: {e}")))?;
        storage.import(&dump).await?;
        info!(
            authority = %storage.namespace(),
            namespaces = dump.namespaces.len(),
            "Backup imported"
        );

        let authority = Self::new(storage, config).await?;
        let csr_id = authority.submit_privileged_csr(csr_pem).await?;
        let (serial, crt_pem) = authority.issue(csr_id, csr_pem, None).await?;

        let restoring_key = key.public_key();
        let now = authority.now().unix_timestamp();
        for record in authority.storage.list_valid_certificates(now).await? {
            if record.serial == serial {
                continue;
            }
            if x509::parse_certificate(&record.crt_pem)?.public_key()? == restoring_key {
                authority.revoke_by_serial(record.serial).await?;
            }
        }

        info!(authority = %authority.name(), serial, "Backup restored");
        Ok(crt_pem)
    }
}
