//! # Caucase CA
//!
//! Certificate authority engine.
//!
//! This crate provides:
//! - CSR queueing with quota and automatic approval
//! - Certificate issuance, renewal and revocation
//! - CA key pair rollover
//! - CRL generation
//! - Encrypted database backups and restoration

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authority;
pub mod backup;
pub mod clock;
pub mod config;
pub mod error;
pub mod x509;

#[cfg(test)]
mod testing;

pub use authority::{CertificateAuthority, Submission};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AuthorityConfig;
pub use error::{CaError, ErrorKind};
pub use x509::CertificateInfo;
