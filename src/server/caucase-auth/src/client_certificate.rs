//! Client certificate authentication backend.
//!
//! Accepts certificates issued by the user authority that are currently
//! within their validity window and not revoked.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use caucase_ca::{CaError, CertificateAuthority, ErrorKind};

use crate::{AuthBackend, AuthContext, AuthError, AuthMethod};

/// Authentication backend validating client certificates against an authority.
pub struct ClientCertificateBackend {
    authority: Arc<CertificateAuthority>,
}

impl ClientCertificateBackend {
    /// Creates a backend trusting certificates of `authority`.
    pub fn new(authority: Arc<CertificateAuthority>) -> Self {
        Self { authority }
    }
}

fn auth_error(err: CaError) -> AuthError {
    match err.kind() {
        ErrorKind::CertificateVerification | ErrorKind::Decode => {
            AuthError::InvalidCredentials(err.to_string())
        }
        _ => AuthError::Backend(err.to_string()),
    }
}

#[async_trait]
impl AuthBackend for ClientCertificateBackend {
    async fn validate(&self, certificate: &[u8]) -> Result<AuthContext, AuthError> {
        let info = self
            .authority
            .verify_certificate_der(certificate)
            .await
            .map_err(auth_error)?;

        debug!(serial = info.serial, authority = %self.authority.name(), "Client certificate accepted");

        Ok(AuthContext {
            serial: info.serial,
            common_name: info.common_name,
            auth_method: AuthMethod::ClientCertificate,
            expires_at: info.not_after,
        })
    }

    fn name(&self) -> &'static str {
        "client-certificate"
    }
}
