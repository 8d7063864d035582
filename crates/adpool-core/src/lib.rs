//! # adpool-core
//!
//! Shared vocabulary for the adpool directory connection pool: the error
//! taxonomy with retryable/authentication/conflict classification, and the
//! validated connection configuration.
//!
//! Higher layers (the pool itself, and the directory-object managers built
//! on top of it) depend on this crate for error classification so that retry
//! and conflict policies stay consistent across the stack.

pub mod config;
pub mod error;

pub use config::{ConnectionConfig, KerberosConfig, PoolSettings, RetryPolicy, TlsOptions};
pub use error::{DirectoryError, DirectoryResult};
