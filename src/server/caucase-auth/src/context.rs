//! Authentication context types.

use serde::{Deserialize, Serialize};

/// Method used to authenticate the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// TLS client certificate issued by the user authority.
    ClientCertificate,
}

/// Authenticated caller context.
///
/// Passed to handlers after successful authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Serial of the presented certificate.
    pub serial: u64,

    /// Subject common name, for audit purposes.
    pub common_name: Option<String>,

    /// Authentication method used.
    pub auth_method: AuthMethod,

    /// Certificate expiration timestamp (Unix seconds).
    pub expires_at: i64,
}

impl AuthContext {
    /// Name to log the caller under.
    pub fn display_name(&self) -> String {
        match &self.common_name {
            Some(cn) => format!("{cn} (serial {})", self.serial),
            None => format!("serial {}", self.serial),
        }
    }
}
