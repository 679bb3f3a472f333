//! The server's own TLS identity, issued by the service authority.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use caucase_ca::{x509, CertificateAuthority};

const CERTIFICATE_HEADER: &str = "-----BEGIN CERTIFICATE-----";

/// Private key and certificate the HTTPS listener presents.
#[derive(Clone)]
pub struct ServerIdentity {
    /// PKCS#8 private key PEM.
    pub key_pem: String,
    /// Certificate PEM.
    pub crt_pem: String,
    /// Certificate expiry.
    pub not_after: OffsetDateTime,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl ServerIdentity {
    fn new(key_pem: String, crt_pem: String) -> anyhow::Result<Self> {
        let info = x509::parse_certificate(&crt_pem).context("invalid server certificate")?;
        let not_after = OffsetDateTime::from_unix_timestamp(info.not_after)
            .context("server certificate expiry out of range")?;
        Ok(Self {
            key_pem,
            crt_pem,
            not_after,
        })
    }

    /// Reads the key-then-certificate file, if it exists.
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read {}", path.display()));
            }
        };
        let Some(split) = text.find(CERTIFICATE_HEADER) else {
            bail!("{} holds no certificate", path.display());
        };
        let (key_pem, crt_pem) = text.split_at(split);
        KeyPair::from_pem(key_pem).with_context(|| format!("invalid key in {}", path.display()))?;
        Self::new(key_pem.to_owned(), crt_pem.to_owned()).map(Some)
    }

    /// Writes the key and certificate, readable by the owner only.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("cannot write into {}", dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(self.key_pem.as_bytes())?;
        file.write_all(self.crt_pem.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(path)
            .with_context(|| format!("cannot replace {}", path.display()))?;
        Ok(())
    }

    /// When renewal should happen.
    pub fn renewal_due(&self, threshold: Duration) -> OffsetDateTime {
        self.not_after - threshold
    }
}

/// Returns a usable identity, requesting one when the stored file is missing
/// or its certificate is no longer valid for `cas`.
pub async fn ensure(
    cas: &CertificateAuthority,
    path: &Path,
    hostname: &str,
) -> anyhow::Result<ServerIdentity> {
    if let Some(identity) = ServerIdentity::load(path)? {
        match cas.verify_certificate(&identity.crt_pem).await {
            Ok(_) => return Ok(identity),
            Err(e) => warn!(error = %e, "Stored server certificate is unusable, issuing a new one"),
        }
    }

    let key = new_key()?;
    let csr_pem = request(&key, hostname)?;
    let csr_id = cas.submit_privileged_csr(&csr_pem).await?;
    let serial = cas.create_certificate(csr_id, None).await?;
    let identity = ServerIdentity::new(key.serialize_pem(), cas.get_certificate(serial).await?)?;
    identity.save(path)?;
    info!(serial, hostname, "Server certificate issued");
    Ok(identity)
}

/// Replaces the identity with a fresh key and certificate, revoking the
/// previous certificate.
pub async fn rotate(
    cas: &CertificateAuthority,
    current: &ServerIdentity,
    path: &Path,
    hostname: &str,
) -> anyhow::Result<ServerIdentity> {
    let key = new_key()?;
    let csr_pem = request(&key, hostname)?;
    let crt_pem = cas
        .rekey(&current.crt_pem, &csr_pem)
        .await
        .context("server certificate renewal failed")?;
    let identity = ServerIdentity::new(key.serialize_pem(), crt_pem)?;
    identity.save(path)?;
    info!(not_after = %identity.not_after, "Server certificate renewed");
    Ok(identity)
}

fn new_key() -> anyhow::Result<KeyPair> {
    KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).context("server key generation failed")
}

fn request(key: &KeyPair, hostname: &str) -> anyhow::Result<String> {
    let mut params = CertificateParams::new(vec![hostname.to_owned()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;
    Ok(params.serialize_request(key)?.pem()?)
}
