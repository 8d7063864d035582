//! Error types for directory pool operations
//!
//! Error definitions with retryable/permanent classification. The pool's
//! retry loop, and the object managers layered on top of it, both dispatch
//! on these classifications rather than on message text.

use thiserror::Error;

/// Error that can occur while discovering, connecting to, or operating
/// against a directory server.
#[derive(Debug, Error)]
pub enum DirectoryError {
    // Connection errors (usually transient)
    /// Failed to establish a connection to a directory server.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection or operation timed out.
    #[error("connection timeout after {timeout_secs} seconds")]
    ConnectionTimeout { timeout_secs: u64 },

    /// Server reported it is busy or temporarily unavailable.
    #[error("server unavailable: {message}")]
    ServerUnavailable { message: String },

    /// Network error during communication.
    #[error("network error: {message}")]
    NetworkError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// All retry sweeps over the server list were exhausted.
    #[error("all {attempts} connection attempts failed")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // Authentication errors (permanent)
    /// Bind was rejected: invalid credentials.
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// Credentials or tickets have expired.
    #[error("authentication failed: credentials expired")]
    CredentialsExpired,

    /// Insufficient permissions for the operation.
    #[error("authorization failed: insufficient permissions for {operation}")]
    AuthorizationFailed { operation: String },

    /// Kerberos environment is unusable (missing krb5.conf, no credential
    /// source). Carries an actionable diagnostic, including a generated
    /// example configuration where that helps.
    #[error("kerberos configuration error: {message}")]
    KerberosConfig { message: String },

    // Configuration errors (permanent, fail fast at construction)
    /// Pool or connection configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    // Discovery errors
    /// Server discovery failed after exhausting every source and the
    /// fallback. Fatal to pool construction.
    #[error("server discovery failed for domain '{domain}': {message}")]
    DiscoveryFailed { domain: String, message: String },

    // Operation errors
    /// A directory operation failed.
    #[error("operation failed: {message}")]
    OperationFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Entry already exists in the directory (create conflict).
    #[error("entry already exists: {identifier}")]
    AlreadyExists { identifier: String },

    /// Entry not found in the directory.
    #[error("entry not found: {identifier}")]
    NotFound { identifier: String },

    // Pool lifecycle
    /// The pool has been closed; no further connections are handed out.
    #[error("connection pool is closed")]
    PoolClosed,
}

impl DirectoryError {
    /// Check if this error is transient and the operation should be retried.
    ///
    /// Transient errors are temporary availability conditions: the server is
    /// busy, down, unreachable, or the attempt timed out. Credential and
    /// configuration problems are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DirectoryError::ConnectionFailed { .. }
                | DirectoryError::ConnectionTimeout { .. }
                | DirectoryError::ServerUnavailable { .. }
                | DirectoryError::NetworkError { .. }
                | DirectoryError::RetriesExhausted { .. }
        )
    }

    /// Check if this error is permanent and retry won't help.
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }

    /// Check if this is an authentication or authorization failure.
    ///
    /// The retry loop surfaces these immediately instead of sweeping the
    /// remaining servers: every replica will reject the same credentials.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            DirectoryError::AuthenticationFailed { .. }
                | DirectoryError::CredentialsExpired
                | DirectoryError::AuthorizationFailed { .. }
                | DirectoryError::KerberosConfig { .. }
        )
    }

    /// Check if this is a create conflict ("entry already exists").
    ///
    /// Membership-style helpers treat conflicts as success; they need a
    /// stable classification rather than message sniffing.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DirectoryError::AlreadyExists { .. })
    }

    /// Check if this is an entry-not-found outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DirectoryError::NotFound { .. })
    }

    /// Get an error code for classification in logs and metrics.
    pub fn error_code(&self) -> &'static str {
        match self {
            DirectoryError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            DirectoryError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            DirectoryError::ServerUnavailable { .. } => "SERVER_UNAVAILABLE",
            DirectoryError::NetworkError { .. } => "NETWORK_ERROR",
            DirectoryError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            DirectoryError::AuthenticationFailed { .. } => "AUTH_FAILED",
            DirectoryError::CredentialsExpired => "CREDENTIALS_EXPIRED",
            DirectoryError::AuthorizationFailed { .. } => "AUTHORIZATION_FAILED",
            DirectoryError::KerberosConfig { .. } => "KERBEROS_CONFIG",
            DirectoryError::InvalidConfiguration { .. } => "INVALID_CONFIG",
            DirectoryError::DiscoveryFailed { .. } => "DISCOVERY_FAILED",
            DirectoryError::OperationFailed { .. } => "OPERATION_FAILED",
            DirectoryError::AlreadyExists { .. } => "ENTRY_EXISTS",
            DirectoryError::NotFound { .. } => "ENTRY_NOT_FOUND",
            DirectoryError::PoolClosed => "POOL_CLOSED",
        }
    }

    // Convenience constructors

    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection failed error with source.
    pub fn connection_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::ConnectionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an operation failed error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        DirectoryError::OperationFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create an operation failed error with source.
    pub fn operation_failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::OperationFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a network error with source.
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DirectoryError::NetworkError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        DirectoryError::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create an authentication failed error.
    pub fn auth_failed(message: impl Into<String>) -> Self {
        DirectoryError::AuthenticationFailed {
            message: message.into(),
        }
    }

    /// Create a kerberos configuration error.
    pub fn kerberos_config(message: impl Into<String>) -> Self {
        DirectoryError::KerberosConfig {
            message: message.into(),
        }
    }
}

/// Result type for directory pool operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;
