//! # Caucase Auth
//!
//! Authentication of privileged callers.
//!
//! ## Supported Methods
//!
//! - mTLS: a client certificate issued by the user authority (CAU),
//!   unexpired and not revoked

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod client_certificate;
pub mod context;
pub mod error;

pub use backend::AuthBackend;
pub use client_certificate::ClientCertificateBackend;
pub use context::{AuthContext, AuthMethod};
pub use error::AuthError;
