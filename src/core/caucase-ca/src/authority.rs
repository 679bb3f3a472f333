//! The certificate authority engine.
//!
//! One [`CertificateAuthority`] exists per authority (`cau`, `cas`). It owns
//! the CSR and certificate lifecycle of its storage namespace:
//!
//! ```text
//! submit_csr ──> pending ──create_certificate──> issued ──revoke──> revoked
//!                   │                               │
//!                   └──delete_csr──> deleted        └──renew──> new serial, old revoked
//! ```

use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams,
    CertificateSigningRequestParams, CrlDistributionPoint, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose,
    RevokedCertParams, SanType, PKCS_ECDSA_P256_SHA256,
};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use caucase_storage::{CaKeyPair, CaStorage, CertificateRecord, PendingCsr, StorageError};

use crate::clock::{Clock, SystemClock};
use crate::config::AuthorityConfig;
use crate::error::CaError;
use crate::x509::{self, CertificateInfo, CERTIFICATE_LABEL};

/// Config table keys.
mod keys {
    pub const AUTO_SIGN_AMOUNT: &str = "auto_sign_csr_amount";
    pub const AUTO_SIGN_LOCKED: &str = "auto_sign_csr_amount_locked";
    pub const AUTO_SIGNED_COUNT: &str = "auto_signed_csr_count";
}

/// Outcome of a CSR submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Waiting for operator approval.
    Pending {
        /// Id of the stored CSR.
        csr_id: u64,
    },
    /// Approved automatically.
    Issued {
        /// Id of the consumed CSR.
        csr_id: u64,
        /// Serial of the issued certificate.
        serial: u64,
    },
}

impl Submission {
    /// Id of the submitted CSR.
    pub fn csr_id(&self) -> u64 {
        match self {
            Self::Pending { csr_id } | Self::Issued { csr_id, .. } => *csr_id,
        }
    }
}

pub(crate) fn timestamp(at: i64) -> Result<OffsetDateTime, CaError> {
    OffsetDateTime::from_unix_timestamp(at)
        .map_err(|e| CaError::Decode(format!("timestamp out of range: {e}")))
}

fn decode_rcgen(err: rcgen::Error) -> CaError {
    CaError::Decode(err.to_string())
}

/// A certificate authority bound to one storage namespace.
pub struct CertificateAuthority {
    pub(crate) storage: Arc<dyn CaStorage>,
    config: AuthorityConfig,
    clock: Arc<dyn Clock>,
    auto_sign_csr_amount: u64,
    ca_renewal: Mutex<()>,
}

impl CertificateAuthority {
    /// Opens the authority, generating its first CA key pair if needed.
    pub async fn new(storage: Arc<dyn CaStorage>, config: AuthorityConfig) -> Result<Self, CaError> {
        Self::with_clock(storage, config, Arc::new(SystemClock)).await
    }

    /// Like [`CertificateAuthority::new`] with an explicit time source.
    pub async fn with_clock(
        storage: Arc<dyn CaStorage>,
        config: AuthorityConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CaError> {
        config.validate()?;
        let auto_sign_csr_amount = Self::load_auto_sign_amount(storage.as_ref(), &config).await?;

        let authority = Self {
            storage,
            config,
            clock,
            auto_sign_csr_amount,
            ca_renewal: Mutex::new(()),
        };
        authority.current_ca().await?;

        info!(
            authority = %authority.name(),
            auto_sign = auto_sign_csr_amount,
            "Certificate authority ready"
        );
        Ok(authority)
    }

    /// Reads the locked auto-sign amount, or locks the configured one.
    async fn load_auto_sign_amount(
        storage: &dyn CaStorage,
        config: &AuthorityConfig,
    ) -> Result<u64, CaError> {
        if storage.get_config(keys::AUTO_SIGN_LOCKED).await?.is_some() {
            let locked = storage
                .get_config(keys::AUTO_SIGN_AMOUNT)
                .await?
                .ok_or_else(|| {
                    CaError::InvalidConfig("auto-sign amount locked but not stored".into())
                })?
                .parse::<u64>()
                .map_err(|e| CaError::InvalidConfig(format!("corrupt auto-sign amount: {e}")))?;
            if locked != config.auto_sign_csr_amount {
                warn!(
                    authority = %storage.namespace(),
                    locked,
                    requested = config.auto_sign_csr_amount,
                    "Auto-sign amount is locked, ignoring requested value"
                );
            }
            return Ok(locked);
        }

        if config.lock_auto_sign_csr_amount {
            storage
                .set_config(keys::AUTO_SIGN_AMOUNT, &config.auto_sign_csr_amount.to_string())
                .await?;
            storage.set_config(keys::AUTO_SIGN_LOCKED, "1").await?;
            info!(
                authority = %storage.namespace(),
                amount = config.auto_sign_csr_amount,
                "Auto-sign amount locked"
            );
        }
        Ok(config.auto_sign_csr_amount)
    }

    /// Name of the authority (its storage namespace).
    pub fn name(&self) -> &str {
        self.storage.namespace()
    }

    /// Policy of the authority.
    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Effective amount of automatically approved CSRs.
    pub fn auto_sign_csr_amount(&self) -> u64 {
        self.auto_sign_csr_amount
    }

    /// Current time, truncated to the second as certificates store it.
    pub fn now(&self) -> OffsetDateTime {
        let now = self.clock.now();
        OffsetDateTime::from_unix_timestamp(now.unix_timestamp()).unwrap_or(now)
    }

    // ------------------------------------------------------------------
    // CA key pairs
    // ------------------------------------------------------------------

    /// Returns the key pair used for issuance.
    ///
    /// A new one is generated when the newest has less than two certificate
    /// lifetimes left, so that issued certificates always get their full life.
    async fn current_ca(&self) -> Result<CaKeyPair, CaError> {
        let _guard = self.ca_renewal.lock().await;
        let now = self.now();
        let renew_before = (now + self.config.crt_life_time * 2_i32).unix_timestamp();

        let pairs = self.storage.list_ca_key_pairs().await?;
        if let Some(newest) = pairs.last() {
            if newest.not_after > renew_before {
                return Ok(newest.clone());
            }
        }

        let serial = self.storage.next_serial().await?;
        let pair = self.generate_ca(serial, now)?;
        self.storage.append_ca_key_pair(&pair).await?;

        info!(
            authority = %self.name(),
            serial,
            not_after = pair.not_after,
            "Generated CA key pair"
        );
        Ok(pair)
    }

    fn generate_ca(&self, serial: u64, now: OffsetDateTime) -> Result<CaKeyPair, CaError> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let not_after = now + self.config.crt_life_time * self.config.ca_life_period;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.config.ca_common_name.as_str());
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(x509::serial_number(serial));
        params.not_before = now;
        params.not_after = not_after;

        let cert = params.self_signed(&key)?;
        Ok(CaKeyPair {
            key_pem: key.serialize_pem(),
            crt_pem: cert.pem(),
            not_before: now.unix_timestamp(),
            not_after: not_after.unix_timestamp(),
        })
    }

    async fn valid_ca_key_pairs(&self) -> Result<Vec<CaKeyPair>, CaError> {
        self.current_ca().await?;
        let now = self.now().unix_timestamp();
        Ok(self
            .storage
            .list_ca_key_pairs()
            .await?
            .into_iter()
            .filter(|pair| pair.not_before <= now && now < pair.not_after)
            .collect())
    }

    /// The CA certificate currently used for issuance.
    pub async fn get_ca_certificate(&self) -> Result<String, CaError> {
        Ok(self.current_ca().await?.crt_pem)
    }

    /// Every unexpired CA certificate, oldest first.
    pub async fn get_valid_ca_chain(&self) -> Result<Vec<String>, CaError> {
        Ok(self
            .valid_ca_key_pairs()
            .await?
            .into_iter()
            .map(|pair| pair.crt_pem)
            .collect())
    }

    // ------------------------------------------------------------------
    // CSRs
    // ------------------------------------------------------------------

    /// Queues a CSR, approving it right away while the auto-sign counter
    /// has not reached its limit.
    pub async fn submit_csr(&self, csr_pem: &str) -> Result<Submission, CaError> {
        x509::parse_csr(csr_pem)?;
        let csr_id = self.storage.append_pending_csr(csr_pem, false).await?;
        debug!(authority = %self.name(), csr_id, "CSR queued");

        if self.auto_sign_csr_amount > 0
            && self
                .storage
                .consume_counter(keys::AUTO_SIGNED_COUNT, self.auto_sign_csr_amount)
                .await?
        {
            let (serial, _) = self.issue(csr_id, csr_pem, None).await?;
            info!(authority = %self.name(), csr_id, serial, "CSR auto-approved");
            return Ok(Submission::Issued { csr_id, serial });
        }
        Ok(Submission::Pending { csr_id })
    }

    /// Queues a CSR past the pending quota, without auto-approval.
    ///
    /// Reserved to the service itself (its own TLS identity, restores).
    pub async fn submit_privileged_csr(&self, csr_pem: &str) -> Result<u64, CaError> {
        x509::parse_csr(csr_pem)?;
        Ok(self.storage.append_pending_csr(csr_pem, true).await?)
    }

    /// Returns a pending CSR.
    pub async fn get_csr(&self, csr_id: u64) -> Result<String, CaError> {
        Ok(self.storage.get_pending_csr(csr_id).await?)
    }

    /// Lists pending CSRs in submission order.
    pub async fn list_pending_csrs(&self) -> Result<Vec<PendingCsr>, CaError> {
        Ok(self.storage.list_pending_csrs().await?)
    }

    /// Rejects a pending CSR.
    pub async fn delete_csr(&self, csr_id: u64) -> Result<(), CaError> {
        self.storage.delete_pending_csr(csr_id).await?;
        info!(authority = %self.name(), csr_id, "CSR rejected");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Certificates
    // ------------------------------------------------------------------

    /// Issues a certificate for a pending CSR.
    ///
    /// When `template_csr` is given, its subject common name and alternative
    /// names replace the requested ones.
    pub async fn create_certificate(
        &self,
        csr_id: u64,
        template_csr: Option<&str>,
    ) -> Result<u64, CaError> {
        let csr_pem = self.storage.get_pending_csr(csr_id).await?;
        let identity = match template_csr {
            Some(template) => {
                x509::parse_csr(template)?;
                Some(
                    CertificateSigningRequestParams::from_pem(template)
                        .map_err(decode_rcgen)?
                        .params,
                )
            }
            None => None,
        };
        let (serial, _) = self.issue(csr_id, &csr_pem, identity).await?;
        info!(authority = %self.name(), csr_id, serial, "CSR approved");
        Ok(serial)
    }

    /// Signs the CSR and stores the result, consuming the CSR.
    pub(crate) async fn issue(
        &self,
        csr_id: u64,
        csr_pem: &str,
        identity: Option<CertificateParams>,
    ) -> Result<(u64, String), CaError> {
        let mut request = CertificateSigningRequestParams::from_pem(csr_pem).map_err(decode_rcgen)?;
        let identity = identity.unwrap_or_else(|| request.params.clone());

        let ca = self.current_ca().await?;
        let serial = self.storage.next_serial().await?;
        let now = self.now();
        let not_after = (now + self.config.crt_life_time).min(timestamp(ca.not_after)?);
        request.params = self.leaf_params(&identity, serial, now, not_after);

        let crt_pem = {
            let key = KeyPair::from_pem(&ca.key_pem)?;
            let issuer = Issuer::from_ca_cert_pem(&ca.crt_pem, &key)?;
            request.signed_by(&issuer)?.pem()
        };

        self.storage
            .store_certificate(
                csr_id,
                serial,
                &crt_pem,
                now.unix_timestamp(),
                not_after.unix_timestamp(),
            )
            .await?;
        Ok((serial, crt_pem))
    }

    fn leaf_params(
        &self,
        identity: &CertificateParams,
        serial: u64,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> CertificateParams {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        if let Some(cn) = identity.distinguished_name.get(&DnType::CommonName) {
            dn.push(DnType::CommonName, cn.clone());
        }
        params.distinguished_name = dn;
        params.subject_alt_names = identity
            .subject_alt_names
            .iter()
            .filter(|san| matches!(san, SanType::DnsName(_) | SanType::IpAddress(_)))
            .cloned()
            .collect();

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(x509::serial_number(serial));
        params.not_before = not_before;
        params.not_after = not_after;
        if let Some(url) = &self.config.crl_url {
            params.crl_distribution_points = vec![CrlDistributionPoint {
                uris: vec![url.clone()],
            }];
        }
        params
    }

    /// Returns an issued certificate, revoked or not.
    pub async fn get_certificate(&self, serial: u64) -> Result<String, CaError> {
        Ok(self.storage.get_certificate(serial).await?.crt_pem)
    }

    /// Returns the certificate issued from CSR `csr_id`.
    ///
    /// `NotFound` while the CSR is pending, and once it was deleted.
    pub async fn get_certificate_for_csr(&self, csr_id: u64) -> Result<String, CaError> {
        Ok(self.storage.get_certificate_by_csr(csr_id).await?.crt_pem)
    }

    /// Returns an issued certificate with its state.
    pub async fn get_certificate_record(&self, serial: u64) -> Result<CertificateRecord, CaError> {
        Ok(self.storage.get_certificate(serial).await?)
    }

    /// Checks that a certificate is within its validity window and signed by
    /// one of this authority's valid CA certificates.
    async fn check_issued(&self, info: &CertificateInfo) -> Result<(), CaError> {
        let now = self.now().unix_timestamp();
        if now < info.not_before || now >= info.not_after {
            return Err(CaError::CertificateVerification(format!(
                "certificate {} is outside its validity period",
                info.serial
            )));
        }

        for ca in self.valid_ca_key_pairs().await? {
            let ca_der = x509::pem_contents(&ca.crt_pem, CERTIFICATE_LABEL)?;
            if x509::is_signed_by(&info.der, &ca_der) {
                return Ok(());
            }
        }
        Err(CaError::CertificateVerification(format!(
            "certificate {} was not issued by {}",
            info.serial,
            self.name()
        )))
    }

    /// Fully validates a PEM certificate: chain, validity window, revocation.
    pub async fn verify_certificate(&self, crt_pem: &str) -> Result<CertificateInfo, CaError> {
        self.verify_certificate_info(x509::parse_certificate(crt_pem)?)
            .await
    }

    /// Fully validates a DER certificate, as captured by a TLS handshake.
    pub async fn verify_certificate_der(&self, der: &[u8]) -> Result<CertificateInfo, CaError> {
        self.verify_certificate_info(x509::certificate_info(der.to_vec())?)
            .await
    }

    async fn verify_certificate_info(
        &self,
        info: CertificateInfo,
    ) -> Result<CertificateInfo, CaError> {
        self.check_issued(&info).await?;

        let record = match self.storage.get_certificate(info.serial).await {
            Ok(record) => record,
            Err(StorageError::NotFound(_)) => {
                return Err(CaError::CertificateVerification(format!(
                    "unknown serial {}",
                    info.serial
                )))
            }
            Err(err) => return Err(err.into()),
        };
        if record.is_revoked() {
            return Err(CaError::CertificateVerification(format!(
                "certificate {} is revoked",
                info.serial
            )));
        }
        if x509::pem_contents(&record.crt_pem, CERTIFICATE_LABEL)? != info.der {
            return Err(CaError::CertificateVerification(format!(
                "certificate {} differs from the issued one",
                info.serial
            )));
        }
        Ok(info)
    }

    /// Revokes a certificate issued by this authority.
    pub async fn revoke(&self, crt_pem: &str) -> Result<(), CaError> {
        let info = x509::parse_certificate(crt_pem)?;
        self.check_issued(&info).await?;
        self.revoke_by_serial(info.serial).await
    }

    /// Revokes a certificate by serial, for callers whose identity is proven.
    pub async fn revoke_by_serial(&self, serial: u64) -> Result<(), CaError> {
        self.storage
            .revoke_certificate(serial, self.now().unix_timestamp())
            .await?;
        info!(authority = %self.name(), serial, "Certificate revoked");
        Ok(())
    }

    /// Issues a new certificate for the key of a currently valid one, then
    /// revokes the old one.
    pub async fn renew(&self, crt_pem: &str, csr_pem: &str) -> Result<String, CaError> {
        self.reissue(crt_pem, csr_pem, true).await
    }

    /// Like [`CertificateAuthority::renew`], but the CSR may carry a new key.
    ///
    /// Not exposed over HTTP; the server uses it for its own identity.
    pub async fn rekey(&self, crt_pem: &str, csr_pem: &str) -> Result<String, CaError> {
        self.reissue(crt_pem, csr_pem, false).await
    }

    async fn reissue(
        &self,
        crt_pem: &str,
        csr_pem: &str,
        same_key: bool,
    ) -> Result<String, CaError> {
        let old = self.verify_certificate(crt_pem).await?;
        let csr = x509::parse_csr(csr_pem)?;
        if same_key && csr.public_key()? != old.public_key()? {
            return Err(CaError::CertificateVerification(
                "renewal request key does not match the certificate".into(),
            ));
        }
        let identity = CertificateParams::from_ca_cert_pem(crt_pem).map_err(decode_rcgen)?;

        let csr_id = self.storage.append_pending_csr(csr_pem, true).await?;
        let (serial, new_pem) = match self.issue(csr_id, csr_pem, Some(identity)).await {
            Ok(issued) => issued,
            Err(err) => {
                if let Err(cleanup) = self.storage.delete_pending_csr(csr_id).await {
                    warn!(authority = %self.name(), csr_id, error = %cleanup, "Could not drop renewal CSR");
                }
                return Err(err);
            }
        };

        // Both certificates are valid until here.
        if let Err(err) = self
            .storage
            .revoke_certificate(old.serial, self.now().unix_timestamp())
            .await
        {
            error!(
                authority = %self.name(),
                old_serial = old.serial,
                serial,
                error = %err,
                "Renewed certificate stored but old one not revoked"
            );
            return Err(err.into());
        }

        info!(authority = %self.name(), old_serial = old.serial, serial, "Certificate renewed");
        Ok(new_pem)
    }

    // ------------------------------------------------------------------
    // Revocation list
    // ------------------------------------------------------------------

    /// Builds and signs the CRL of every revoked, unexpired certificate.
    pub async fn get_crl(&self) -> Result<String, CaError> {
        let ca = self.current_ca().await?;
        let now = self.now();

        let revoked_certs = self
            .storage
            .list_revoked(now.unix_timestamp())
            .await?
            .into_iter()
            .map(|entry| {
                Ok(RevokedCertParams {
                    serial_number: x509::serial_number(entry.serial),
                    revocation_time: timestamp(entry.revoked_at)?,
                    reason_code: None,
                    invalidity_date: None,
                })
            })
            .collect::<Result<Vec<_>, CaError>>()?;

        let params = CertificateRevocationListParams {
            this_update: now,
            next_update: now + self.config.crl_life_time,
            crl_number: x509::serial_number(now.unix_timestamp().max(0) as u64),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        };

        let key = KeyPair::from_pem(&ca.key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&ca.crt_pem, &key)?;
        Ok(params.signed_by(&issuer)?.pem()?)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use std::sync::atomic::Ordering;

    use caucase_crypto::PublicKey;
    use rcgen::PublicKeyData;
    use tempfile::TempDir;
    use time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::testing::{csr_for, new_key, open_storage, FailingStorage};

    fn config() -> AuthorityConfig {
        AuthorityConfig::new("Caucase CAS", Duration::days(10))
    }

    async fn authority(dir: &TempDir, config: AuthorityConfig) -> CertificateAuthority {
        CertificateAuthority::new(open_storage(dir.path(), "cas", 10).await, config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_then_approve() {
        let dir = TempDir::new().unwrap();
        let cas = authority(&dir, config()).await;
        let key = new_key();
        let csr = csr_for(&key, "alice");

        let submission = cas.submit_csr(&csr).await.unwrap();
        let Submission::Pending { csr_id } = submission else {
            panic!("unexpected auto-approval: {submission:?}");
        };
        assert_eq!(cas.get_csr(csr_id).await.unwrap(), csr);
        assert_eq!(cas.list_pending_csrs().await.unwrap().len(), 1);
        assert_eq!(
            cas.get_certificate_for_csr(csr_id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );

        let serial = cas.create_certificate(csr_id, None).await.unwrap();
        let crt = cas.get_certificate(serial).await.unwrap();
        let info = cas.verify_certificate(&crt).await.unwrap();
        assert_eq!(info.serial, serial);
        assert_eq!(info.common_name.as_deref(), Some("alice"));
        assert_eq!(
            info.public_key().unwrap(),
            PublicKey::from_spki_der(&key.public_key_der()).unwrap()
        );

        // The CSR is consumed, its certificate reachable through its id.
        assert_eq!(cas.get_csr(csr_id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(cas.get_certificate_for_csr(csr_id).await.unwrap(), crt);
        assert!(cas.create_certificate(csr_id, None).await.is_err());
        assert!(cas.list_pending_csrs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_template_overrides_identity() {
        let dir = TempDir::new().unwrap();
        let cas = authority(&dir, config()).await;
        let csr_id = cas
            .submit_csr(&csr_for(&new_key(), "requested"))
            .await
            .unwrap()
            .csr_id();

        let template = csr_for(&new_key(), "granted");
        let serial = cas.create_certificate(csr_id, Some(&template)).await.unwrap();
        let info = x509::parse_certificate(&cas.get_certificate(serial).await.unwrap()).unwrap();
        assert_eq!(info.common_name.as_deref(), Some("granted"));
    }

    #[tokio::test]
    async fn test_garbage_csr_rejected() {
        let dir = TempDir::new().unwrap();
        let cas = authority(&dir, config()).await;
        let err = cas.submit_csr("not a csr").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert!(cas.list_pending_csrs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_quota() {
        let dir = TempDir::new().unwrap();
        let cas = CertificateAuthority::new(open_storage(dir.path(), "cas", 2).await, config())
            .await
            .unwrap();
        cas.submit_csr(&csr_for(&new_key(), "a")).await.unwrap();
        cas.submit_csr(&csr_for(&new_key(), "b")).await.unwrap();

        let err = cas.submit_csr(&csr_for(&new_key(), "c")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoStorage);

        // The service itself is not bound by the quota.
        cas.submit_privileged_csr(&csr_for(&new_key(), "d"))
            .await
            .unwrap();
        assert_eq!(cas.list_pending_csrs().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_auto_sign_stops_at_amount() {
        let dir = TempDir::new().unwrap();
        let cas = authority(&dir, config().with_auto_sign_csr_amount(1)).await;

        let first = cas.submit_csr(&csr_for(&new_key(), "first")).await.unwrap();
        let Submission::Issued { serial, .. } = first else {
            panic!("first CSR should be auto-approved");
        };
        cas.get_certificate(serial).await.unwrap();

        let second = cas.submit_csr(&csr_for(&new_key(), "second")).await.unwrap();
        assert!(matches!(second, Submission::Pending { .. }));
    }

    #[tokio::test]
    async fn test_locked_auto_sign_amount_survives_restart() {
        let dir = TempDir::new().unwrap();
        let locked = authority(&dir, config().with_auto_sign_csr_amount(2).with_locked_auto_sign(true)).await;
        assert_eq!(locked.auto_sign_csr_amount(), 2);
        drop(locked);

        let reopened = authority(&dir, config().with_auto_sign_csr_amount(5)).await;
        assert_eq!(reopened.auto_sign_csr_amount(), 2);
    }

    #[tokio::test]
    async fn test_revocation_shows_in_crl() {
        let dir = TempDir::new().unwrap();
        let cas = authority(&dir, config().with_auto_sign_csr_amount(1)).await;
        let Submission::Issued { serial, .. } =
            cas.submit_csr(&csr_for(&new_key(), "bob")).await.unwrap()
        else {
            panic!("expected auto-approval");
        };
        let crt = cas.get_certificate(serial).await.unwrap();
        assert!(x509::crl_serials(&cas.get_crl().await.unwrap())
            .unwrap()
            .is_empty());

        cas.revoke(&crt).await.unwrap();
        cas.revoke(&crt).await.unwrap();

        assert_eq!(
            x509::crl_serials(&cas.get_crl().await.unwrap()).unwrap(),
            vec![serial]
        );
        let err = cas.verify_certificate(&crt).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CertificateVerification);
        assert!(cas.get_certificate_record(serial).await.unwrap().is_revoked());
    }

    #[tokio::test]
    async fn test_revoke_unknown_serial() {
        let dir = TempDir::new().unwrap();
        let cas = authority(&dir, config()).await;
        let err = cas.revoke_by_serial(4242).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_foreign_certificate_rejected() {
        let dir = TempDir::new().unwrap();
        let cas = authority(&dir, config().with_auto_sign_csr_amount(1)).await;
        let cau = CertificateAuthority::new(
            open_storage(dir.path(), "cau", 10).await,
            AuthorityConfig::new("Caucase CAU", Duration::days(10)).with_auto_sign_csr_amount(1),
        )
        .await
        .unwrap();

        let Submission::Issued { serial, .. } =
            cau.submit_csr(&csr_for(&new_key(), "admin")).await.unwrap()
        else {
            panic!("expected auto-approval");
        };
        let user_crt = cau.get_certificate(serial).await.unwrap();

        let err = cas.verify_certificate(&user_crt).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CertificateVerification);
        let err = cas.revoke(&user_crt).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CertificateVerification);
    }

    #[tokio::test]
    async fn test_crl_forgets_expired_certificates() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(OffsetDateTime::now_utc()));
        let cas = CertificateAuthority::with_clock(
            open_storage(dir.path(), "cas", 10).await,
            config().with_auto_sign_csr_amount(1),
            clock.clone(),
        )
        .await
        .unwrap();

        let Submission::Issued { serial, .. } =
            cas.submit_csr(&csr_for(&new_key(), "carol")).await.unwrap()
        else {
            panic!("expected auto-approval");
        };
        cas.revoke_by_serial(serial).await.unwrap();
        assert_eq!(
            x509::crl_serials(&cas.get_crl().await.unwrap()).unwrap(),
            vec![serial]
        );

        clock.advance(Duration::days(11));
        assert!(x509::crl_serials(&cas.get_crl().await.unwrap())
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_expired_certificate_rejected() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(OffsetDateTime::now_utc()));
        let cas = CertificateAuthority::with_clock(
            open_storage(dir.path(), "cas", 10).await,
            config().with_auto_sign_csr_amount(1),
            clock.clone(),
        )
        .await
        .unwrap();
        let Submission::Issued { serial, .. } =
            cas.submit_csr(&csr_for(&new_key(), "dave")).await.unwrap()
        else {
            panic!("expected auto-approval");
        };
        let crt = cas.get_certificate(serial).await.unwrap();
        cas.verify_certificate(&crt).await.unwrap();

        clock.advance(Duration::days(10));
        let err = cas.verify_certificate(&crt).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CertificateVerification);
    }

    #[tokio::test]
    async fn test_renew_keeps_key_and_revokes_old() {
        let dir = TempDir::new().unwrap();
        let cas = authority(&dir, config().with_auto_sign_csr_amount(1)).await;
        let key = new_key();
        let Submission::Issued { serial, .. } =
            cas.submit_csr(&csr_for(&key, "erin")).await.unwrap()
        else {
            panic!("expected auto-approval");
        };
        let old = cas.get_certificate(serial).await.unwrap();

        let err = cas
            .renew(&old, &csr_for(&new_key(), "erin"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CertificateVerification);
        cas.verify_certificate(&old).await.unwrap();

        let renewed = cas.renew(&old, &csr_for(&key, "someone-else")).await.unwrap();
        let info = cas.verify_certificate(&renewed).await.unwrap();
        assert_ne!(info.serial, serial);
        // Identity comes from the old certificate, not the renewal CSR.
        assert_eq!(info.common_name.as_deref(), Some("erin"));
        assert!(cas.verify_certificate(&old).await.is_err());
        assert!(cas.list_pending_csrs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rekey_accepts_new_key() {
        let dir = TempDir::new().unwrap();
        let cas = authority(&dir, config()).await;
        let csr_id = cas
            .submit_privileged_csr(&csr_for(&new_key(), "caucased"))
            .await
            .unwrap();
        let serial = cas.create_certificate(csr_id, None).await.unwrap();
        let old = cas.get_certificate(serial).await.unwrap();

        let fresh = new_key();
        let rekeyed = cas.rekey(&old, &csr_for(&fresh, "caucased")).await.unwrap();
        let info = cas.verify_certificate(&rekeyed).await.unwrap();
        assert_eq!(
            info.public_key().unwrap(),
            PublicKey::from_spki_der(&fresh.public_key_der()).unwrap()
        );
        assert!(cas.verify_certificate(&old).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_old_certificate() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FailingStorage::new(open_storage(dir.path(), "cas", 10).await));
        let cas = CertificateAuthority::new(storage.clone(), config().with_auto_sign_csr_amount(1))
            .await
            .unwrap();
        let key = new_key();
        let Submission::Issued { serial, .. } =
            cas.submit_csr(&csr_for(&key, "frank")).await.unwrap()
        else {
            panic!("expected auto-approval");
        };
        let old = cas.get_certificate(serial).await.unwrap();

        storage.fail_store.store(true, Ordering::SeqCst);
        let err = cas.renew(&old, &csr_for(&key, "frank")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        cas.verify_certificate(&old).await.unwrap();
        assert!(cas.list_pending_csrs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ca_rollover() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(OffsetDateTime::now_utc()));
        let cas = CertificateAuthority::with_clock(
            open_storage(dir.path(), "cas", 10).await,
            config().with_auto_sign_csr_amount(10),
            clock.clone(),
        )
        .await
        .unwrap();
        let first_ca = cas.get_ca_certificate().await.unwrap();
        assert_eq!(cas.get_valid_ca_chain().await.unwrap(), vec![first_ca.clone()]);

        // 40 day CA life, renewed with less than 20 days left.
        clock.advance(Duration::days(15));
        let Submission::Issued { serial, .. } =
            cas.submit_csr(&csr_for(&new_key(), "old")).await.unwrap()
        else {
            panic!("expected auto-approval");
        };
        let old_leaf = cas.get_certificate(serial).await.unwrap();
        assert_eq!(cas.get_ca_certificate().await.unwrap(), first_ca);

        clock.advance(Duration::days(6));
        let second_ca = cas.get_ca_certificate().await.unwrap();
        assert_ne!(second_ca, first_ca);
        assert_eq!(
            cas.get_valid_ca_chain().await.unwrap(),
            vec![first_ca.clone(), second_ca.clone()]
        );
        // Leaves of the previous CA remain valid.
        cas.verify_certificate(&old_leaf).await.unwrap();

        let Submission::Issued { serial, .. } =
            cas.submit_csr(&csr_for(&new_key(), "new")).await.unwrap()
        else {
            panic!("expected auto-approval");
        };
        let new_leaf = x509::parse_certificate(&cas.get_certificate(serial).await.unwrap()).unwrap();
        let second_der = x509::pem_contents(&second_ca, CERTIFICATE_LABEL).unwrap();
        assert!(x509::is_signed_by(&new_leaf.der, &second_der));

        // First CA expires on day 40.
        clock.advance(Duration::days(19));
        assert_eq!(cas.get_valid_ca_chain().await.unwrap(), vec![second_ca]);
    }
}
