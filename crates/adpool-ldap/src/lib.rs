//! # adpool-ldap
//!
//! Pooled, authenticated LDAP connections to a replicated set of directory
//! servers (Active Directory domain controllers).
//!
//! ## Features
//!
//! - SRV-based domain controller discovery with deterministic fallback
//! - Bounded connection pool with multi-server failover and exponential backoff
//! - Background health checking with re-authentication
//! - Simple, Kerberos/GSSAPI, and SASL EXTERNAL authentication strategies
//! - Paged search results
//!
//! ## Example
//!
//! ```ignore
//! use adpool_core::ConnectionConfig;
//! use adpool_ldap::{DirectoryClient, Scope};
//!
//! let config = ConnectionConfig::for_domain("corp.example.com")
//!     .with_credentials("svc-sync@corp.example.com", "secret");
//!
//! let client = DirectoryClient::connect(config).await?;
//! client.ping().await?;
//! let base = client.base_dn().await?;
//! let result = client
//!     .search(
//!         &base,
//!         Scope::Subtree,
//!         "(objectClass=user)",
//!         vec!["cn".into(), "mail".into()],
//!     )
//!     .await?;
//! ```

pub mod auth;
pub mod client;
pub mod codes;
pub mod discovery;
pub mod pool;

// Re-exports
pub use auth::{select_auth_method, AuthMethod};
pub use client::{DirectoryClient, DirectoryEntry, SearchOutcome};
pub use discovery::{ServerInfo, ServerSource};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};

// Protocol types callers need to build searches and modifications.
pub use ldap3::{Mod, Scope};
