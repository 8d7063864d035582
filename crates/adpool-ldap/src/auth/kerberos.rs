//! Kerberos/GSSAPI mutual authentication.
//!
//! Before attempting a GSSAPI bind this module verifies the Kerberos
//! environment is actually usable: a reachable krb5.conf (failing with a
//! generated example configuration when it is missing) and at least one
//! credential source, resolved in strict priority order:
//!
//! 1. explicit credential-cache path from configuration
//! 2. default credential cache (`KRB5CCNAME`, or `/tmp/krb5cc_<uid>`)
//! 3. explicit keytab path from configuration
//! 4. default keytab (`KRB5_KTNAME`, or /etc/krb5.keytab)
//! 5. username/password
//!
//! Environment and filesystem access goes through the [`Krb5Env`] capability
//! so tests substitute fixed state instead of depending on the process
//! environment.

use std::path::{Path, PathBuf};

use ldap3::Ldap;
use tracing::debug;

use adpool_core::config::{ConnectionConfig, KerberosConfig};
use adpool_core::error::{DirectoryError, DirectoryResult};

use crate::discovery::ServerInfo;

const DEFAULT_KRB5_CONF: &str = "/etc/krb5.conf";
const DEFAULT_KEYTAB: &str = "/etc/krb5.keytab";

/// Environment and filesystem state consulted during credential resolution.
pub trait Krb5Env: Send + Sync {
    /// Read an environment variable.
    fn var(&self, key: &str) -> Option<String>;

    /// Check whether a file exists.
    fn file_exists(&self, path: &Path) -> bool;

    /// Effective user id, used for the per-user default credential cache.
    fn uid(&self) -> u32;
}

/// The real process environment.
pub struct SystemKrb5Env;

impl Krb5Env for SystemKrb5Env {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    #[cfg(unix)]
    fn uid(&self) -> u32 {
        // SAFETY: getuid never fails and touches no memory.
        unsafe { libc::getuid() }
    }

    #[cfg(not(unix))]
    fn uid(&self) -> u32 {
        0
    }
}

/// The credential source selected for a GSSAPI exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Explicitly configured credential cache.
    ExplicitCcache(PathBuf),
    /// Default credential cache from the environment or per-user path.
    DefaultCcache(PathBuf),
    /// Explicitly configured keytab.
    ExplicitKeytab(PathBuf),
    /// Default keytab location.
    DefaultKeytab(PathBuf),
    /// Username/password ticket acquisition.
    Password,
}

impl std::fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSource::ExplicitCcache(p) => write!(f, "credential cache {}", p.display()),
            CredentialSource::DefaultCcache(p) => {
                write!(f, "default credential cache {}", p.display())
            }
            CredentialSource::ExplicitKeytab(p) => write!(f, "keytab {}", p.display()),
            CredentialSource::DefaultKeytab(p) => write!(f, "default keytab {}", p.display()),
            CredentialSource::Password => f.write_str("password"),
        }
    }
}

/// A minimal krb5.conf for the given realm, embedded in diagnostics when the
/// real one is missing.
pub fn example_krb5_conf(realm: &str) -> String {
    let upper = realm.to_uppercase();
    let lower = realm.to_lowercase();
    format!(
        "[libdefaults]\n    default_realm = {upper}\n    dns_lookup_kdc = true\n\n\
         [realms]\n    {upper} = {{\n        kdc = {lower}\n    }}\n"
    )
}

/// The krb5.conf path to use: explicit configuration, then `KRB5_CONFIG`,
/// then the fixed default location.
pub fn krb5_conf_path(krb: &KerberosConfig, env: &dyn Krb5Env) -> PathBuf {
    krb.config_path
        .clone()
        .or_else(|| env.var("KRB5_CONFIG"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_KRB5_CONF))
}

/// Verify the realm configuration file exists.
pub fn check_krb5_conf(krb: &KerberosConfig, env: &dyn Krb5Env) -> DirectoryResult<PathBuf> {
    let path = krb5_conf_path(krb, env);
    if env.file_exists(&path) {
        Ok(path)
    } else {
        Err(DirectoryError::kerberos_config(format!(
            "krb5.conf not found at {}; create it with at least:\n{}",
            path.display(),
            example_krb5_conf(&krb.realm)
        )))
    }
}

/// The default credential cache path: `KRB5CCNAME` (with any `FILE:` prefix
/// stripped), or the per-user well-known location.
fn default_ccache_path(env: &dyn Krb5Env) -> PathBuf {
    match env.var("KRB5CCNAME") {
        Some(name) => PathBuf::from(name.strip_prefix("FILE:").unwrap_or(&name)),
        None => PathBuf::from(format!("/tmp/krb5cc_{}", env.uid())),
    }
}

/// Resolve the credential source, stopping at the first usable one.
pub fn resolve_credential_source(
    config: &ConnectionConfig,
    krb: &KerberosConfig,
    env: &dyn Krb5Env,
) -> DirectoryResult<CredentialSource> {
    if let Some(path) = &krb.ccache_path {
        let path = PathBuf::from(path);
        if env.file_exists(&path) {
            return Ok(CredentialSource::ExplicitCcache(path));
        }
    }

    let ccache = default_ccache_path(env);
    if env.file_exists(&ccache) {
        return Ok(CredentialSource::DefaultCcache(ccache));
    }

    if let Some(path) = &krb.keytab_path {
        let path = PathBuf::from(path);
        if env.file_exists(&path) {
            return Ok(CredentialSource::ExplicitKeytab(path));
        }
    }

    let keytab = env
        .var("KRB5_KTNAME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_KEYTAB));
    if env.file_exists(&keytab) {
        return Ok(CredentialSource::DefaultKeytab(keytab));
    }

    let has_password = config.username.as_deref().is_some_and(|u| !u.is_empty())
        && config.password.as_deref().is_some_and(|p| !p.is_empty());
    if has_password {
        return Ok(CredentialSource::Password);
    }

    Err(DirectoryError::kerberos_config(format!(
        "no usable kerberos credential source for realm {}: no credential cache \
         (run kinit, or set KRB5CCNAME), no keytab, and no username/password configured",
        krb.realm
    )))
}

/// The target service principal name: the configured override, or
/// `ldap/<hostname>` synthesized from the chosen server with any port
/// suffix stripped.
pub fn service_principal(krb: &KerberosConfig, server: &ServerInfo) -> String {
    match &krb.service_principal {
        Some(spn) => spn.clone(),
        None => {
            let host = server.host.split(':').next().unwrap_or(&server.host);
            format!("ldap/{host}")
        }
    }
}

/// Authenticate with GSSAPI against the chosen server.
pub async fn bind(
    ldap: &mut Ldap,
    config: &ConnectionConfig,
    server: &ServerInfo,
) -> DirectoryResult<()> {
    bind_with_env(ldap, config, server, &SystemKrb5Env).await
}

/// GSSAPI bind with an explicit environment provider.
pub async fn bind_with_env(
    ldap: &mut Ldap,
    config: &ConnectionConfig,
    server: &ServerInfo,
    env: &dyn Krb5Env,
) -> DirectoryResult<()> {
    let krb = config
        .kerberos
        .as_ref()
        .ok_or_else(|| DirectoryError::invalid_config("kerberos bind without kerberos config"))?;

    let conf_path = check_krb5_conf(krb, env)?;
    let source = resolve_credential_source(config, krb, env)?;
    let spn = service_principal(krb, server);

    debug!(
        krb5_conf = %conf_path.display(),
        credential_source = %source,
        spn = %spn,
        "performing GSSAPI bind"
    );

    // The GSSAPI layer derives ldap/<fqdn> itself; hand it the host part of
    // the principal we resolved.
    let target_host = spn.split('/').nth(1).unwrap_or(&server.host);
    gssapi_bind(ldap, target_host).await
}

#[cfg(feature = "gssapi")]
async fn gssapi_bind(ldap: &mut Ldap, server_fqdn: &str) -> DirectoryResult<()> {
    use crate::codes;

    let result = ldap
        .sasl_gssapi_bind(server_fqdn)
        .await
        .map_err(|e| codes::connect_error("GSSAPI bind", e))?;
    codes::check_result(&format!("GSSAPI bind to {server_fqdn}"), result)?;
    Ok(())
}

#[cfg(not(feature = "gssapi"))]
async fn gssapi_bind(_ldap: &mut Ldap, _server_fqdn: &str) -> DirectoryResult<()> {
    Err(DirectoryError::kerberos_config(
        "kerberos authentication requires the 'gssapi' cargo feature",
    ))
}
