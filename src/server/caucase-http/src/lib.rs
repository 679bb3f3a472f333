//! # Caucase HTTP
//!
//! HTTP layer shared by the plain and TLS listeners.
//!
//! ## Endpoints
//!
//! For each authority `a` in `cau` (users) and `cas` (services):
//!
//! - `GET /a/crl` - Current revocation list
//! - `GET /a/csr` - Pending CSRs (authenticated)
//! - `GET /a/csr/{id}` - One pending CSR
//! - `PUT /a/csr` - Submit a CSR
//! - `DELETE /a/csr/{id}` - Reject a CSR (authenticated)
//! - `GET /a/crt/ca.crt.pem` - Current CA certificate
//! - `GET /a/crt/ca.crt.json` - Valid CA chain
//! - `GET /a/crt/{id}` - Certificate issued from CSR `{id}`
//! - `PUT /a/crt/{id}` - Approve a CSR (authenticated)
//! - `PUT /a/crt/renew` - Renew a certificate (signed payload)
//! - `PUT /a/crt/revoke` - Revoke a certificate (signed payload or authenticated)
//!
//! Authentication failures answer `404`, like unknown routes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod peer;
pub mod routes;
pub mod signed;

pub use error::ApiError;
pub use peer::PeerInfo;
pub use routes::Application;
pub use signed::{RenewPayload, RevokeCrtPayload, RevokeSerialPayload, SignedRequest};
