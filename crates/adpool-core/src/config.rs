//! Connection pool configuration
//!
//! Externally supplied, process-wide configuration for the pool: discovery
//! source, TLS options, pool sizing, retry policy, and authentication
//! material. Validated once at pool construction and immutable afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DirectoryError, DirectoryResult};

/// Hard ceiling on pool capacity, independent of configuration.
pub const MAX_CONNECTIONS_CEILING: u32 = 100;

/// Pool sizing and timing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum number of pooled connections (1..=100).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Maximum time a connection may sit idle before being discarded, in seconds.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,

    /// Per-operation timeout in seconds (also used as the connect timeout).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Background health-check interval in seconds. Zero disables the checker.
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_max_idle_secs() -> u64 {
    300
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_health_check_secs() -> u64 {
    30
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_idle_secs: default_max_idle_secs(),
            timeout_secs: default_timeout_secs(),
            health_check_secs: default_health_check_secs(),
        }
    }
}

impl PoolSettings {
    /// Get the idle budget as a Duration.
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    /// Get the operation timeout as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get the health-check interval, or None when disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_secs > 0).then(|| Duration::from_secs(self.health_check_secs))
    }
}

/// Retry policy for connection creation sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries after the first sweep (total sweeps = max_retries + 1).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff before the first retry sweep, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Multiplier applied to the backoff after each failed sweep. Must be > 1.0.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on the backoff, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Get the initial backoff as a Duration.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Get the backoff cap as a Duration.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Backoff to wait after the given 0-indexed failed sweep.
    ///
    /// Grows by the multiplier per sweep and is capped at `max_backoff`.
    pub fn backoff_for_sweep(&self, sweep: u32) -> Duration {
        let ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(sweep as i32);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }
}

/// TLS options for directory connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Upgrade plaintext connections with STARTTLS.
    #[serde(default)]
    pub start_tls: bool,

    /// Skip server certificate verification. Development use only.
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Path to a CA certificate bundle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<String>,

    /// Path to a client certificate (enables SASL EXTERNAL binds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert_path: Option<String>,

    /// Path to the client certificate key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key_path: Option<String>,
}

impl TlsOptions {
    /// Whether client certificate material is configured.
    pub fn has_client_cert(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    /// Log a warning when certificate verification is disabled.
    pub fn warn_if_insecure(&self) {
        if self.insecure_skip_verify {
            tracing::warn!(
                target: "security",
                "TLS certificate verification is disabled; connections are \
                 vulnerable to man-in-the-middle attacks"
            );
        }
    }
}

/// Kerberos authentication material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KerberosConfig {
    /// Kerberos realm (e.g. "EXAMPLE.COM").
    pub realm: String,

    /// Path to krb5.conf. Falls back to `KRB5_CONFIG` or /etc/krb5.conf.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,

    /// Explicit credential cache path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ccache_path: Option<String>,

    /// Explicit keytab path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keytab_path: Option<String>,

    /// Service principal name override. Defaults to `ldap/<server-host>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_principal: Option<String>,
}

impl KerberosConfig {
    /// Create a Kerberos config for the given realm.
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            config_path: None,
            ccache_path: None,
            keytab_path: None,
            service_principal: None,
        }
    }

    /// Set an explicit keytab path.
    pub fn with_keytab(mut self, path: impl Into<String>) -> Self {
        self.keytab_path = Some(path.into());
        self
    }

    /// Set an explicit credential cache path.
    pub fn with_ccache(mut self, path: impl Into<String>) -> Self {
        self.ccache_path = Some(path.into());
        self
    }

    /// Override the target service principal name.
    pub fn with_service_principal(mut self, spn: impl Into<String>) -> Self {
        self.service_principal = Some(spn.into());
        self
    }
}

/// Configuration for a directory connection pool.
///
/// Exactly one discovery source is required: either a `domain` for SRV-based
/// discovery, or an explicit list of `ldap://` / `ldaps://` server URLs.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Explicit server URLs. Mutually exclusive with `domain`.
    #[serde(default)]
    pub servers: Vec<String>,

    /// Domain name for SRV-based discovery. Mutually exclusive with `servers`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Base DN for searches. Discovered from the rootDSE when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_dn: Option<String>,

    /// Bind DN or user principal name for simple or Kerberos binds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Bind password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Kerberos authentication material. Takes precedence over simple binds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kerberos: Option<KerberosConfig>,

    /// TLS options.
    #[serde(default)]
    pub tls: TlsOptions,

    /// Pool sizing and timing.
    #[serde(default)]
    pub pool: PoolSettings,

    /// Retry policy for connection creation.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("servers", &self.servers)
            .field("domain", &self.domain)
            .field("base_dn", &self.base_dn)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***REDACTED***"))
            .field("kerberos", &self.kerberos)
            .field("tls", &self.tls)
            .field("pool", &self.pool)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ConnectionConfig {
    /// Create a configuration using SRV discovery against a domain.
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            servers: Vec::new(),
            domain: Some(domain.into()),
            base_dn: None,
            username: None,
            password: None,
            kerberos: None,
            tls: TlsOptions::default(),
            pool: PoolSettings::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Create a configuration from explicit server URLs.
    pub fn for_servers(servers: Vec<String>) -> Self {
        Self {
            servers,
            domain: None,
            base_dn: None,
            username: None,
            password: None,
            kerberos: None,
            tls: TlsOptions::default(),
            pool: PoolSettings::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Set bind credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set Kerberos authentication material.
    pub fn with_kerberos(mut self, kerberos: KerberosConfig) -> Self {
        self.kerberos = Some(kerberos);
        self
    }

    /// Set the base DN.
    pub fn with_base_dn(mut self, base_dn: impl Into<String>) -> Self {
        self.base_dn = Some(base_dn.into());
        self
    }

    /// Validate the configuration.
    ///
    /// Called once at pool construction; each violated constraint yields a
    /// descriptive error and aborts construction.
    pub fn validate(&self) -> DirectoryResult<()> {
        let has_domain = self.domain.as_deref().is_some_and(|d| !d.is_empty());
        let has_servers = !self.servers.is_empty();

        if has_domain == has_servers {
            return Err(DirectoryError::invalid_config(
                "exactly one discovery source is required: set either domain or servers",
            ));
        }

        if self.pool.max_connections == 0 {
            return Err(DirectoryError::invalid_config(
                "max_connections must be at least 1",
            ));
        }
        if self.pool.max_connections > MAX_CONNECTIONS_CEILING {
            return Err(DirectoryError::invalid_config(format!(
                "max_connections must not exceed {MAX_CONNECTIONS_CEILING}"
            )));
        }
        if self.pool.max_idle_secs == 0 {
            return Err(DirectoryError::invalid_config(
                "max_idle_secs must be positive",
            ));
        }
        if self.pool.timeout_secs == 0 {
            return Err(DirectoryError::invalid_config(
                "timeout_secs must be positive",
            ));
        }
        if self.retry.backoff_multiplier <= 1.0 {
            return Err(DirectoryError::invalid_config(
                "backoff_multiplier must be greater than 1.0",
            ));
        }

        if let Some(krb) = &self.kerberos {
            if krb.realm.is_empty() {
                return Err(DirectoryError::invalid_config(
                    "kerberos realm must not be empty",
                ));
            }
        }

        Ok(())
    }
}
