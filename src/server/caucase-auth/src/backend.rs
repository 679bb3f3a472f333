//! Authentication backend trait.

use async_trait::async_trait;

use crate::{AuthContext, AuthError};

/// Decides whether a TLS peer certificate identifies an operator.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Checks a DER client certificate.
    ///
    /// Rejections are [`AuthError::InvalidCredentials`]; anything that
    /// prevented a decision is [`AuthError::Backend`].
    async fn validate(&self, certificate: &[u8]) -> Result<AuthContext, AuthError>;

    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Like [`AuthBackend::validate`], for a peer that may not have presented
    /// a certificate at all.
    async fn authenticate(&self, certificate: Option<&[u8]>) -> Result<AuthContext, AuthError> {
        match certificate {
            Some(der) => self.validate(der).await,
            None => Err(AuthError::MissingCertificate),
        }
    }
}
