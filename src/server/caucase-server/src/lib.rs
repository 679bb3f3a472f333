//! # Caucase Server
//!
//! The `caucased` daemon: both authorities behind a plain HTTP listener and
//! a mutual-TLS listener, plus the background task that rotates the
//! server's own certificate and writes periodic backups.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backup;
pub mod config;
pub mod daemon;
pub mod identity;
pub mod tls;

pub use config::{AuthorityPolicy, DaemonConfig};
pub use daemon::{Daemon, ListenerState};
