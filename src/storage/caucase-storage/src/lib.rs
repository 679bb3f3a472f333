//! # Caucase Storage
//!
//! Storage contract for certificate authorities.
//!
//! One storage instance serves one authority namespace (`cau`, `cas`). It
//! keeps pending CSRs, issued certificates with their revocation state, the
//! authority's own CA key pairs and a small config table. Writes to one
//! namespace are linearizable; namespaces are independent of each other.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;

pub use backend::{
    CaKeyPair, CaStorage, CertificateRecord, CsrRow, DatabaseDump, NamespaceDump, PendingCsr,
    RevokedEntry,
};
pub use error::StorageError;
