//! Authentication strategies
//!
//! A closed set of mutually exclusive authentication mechanisms executed
//! against an already-open transport connection. A pure selector maps the
//! configuration shape onto the chosen mechanism, with the precedence rules
//! encoded as explicit predicates:
//!
//! 1. Kerberos, whenever a realm and (username or keytab) are present
//! 2. Simple bind, whenever a username is present
//! 3. SASL EXTERNAL, whenever client certificate material is configured
//! 4. Anonymous otherwise (no authentication attempted)

pub mod external;
pub mod kerberos;
pub mod simple;

use ldap3::Ldap;
use tracing::debug;

use adpool_core::config::ConnectionConfig;
use adpool_core::error::DirectoryResult;

use crate::discovery::ServerInfo;

/// The authentication mechanism chosen for a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Username/password simple bind.
    Simple,
    /// Kerberos/GSSAPI mutual authentication.
    Kerberos,
    /// SASL EXTERNAL, identity established by the client certificate.
    External,
    /// No authentication material configured.
    Anonymous,
}

impl AuthMethod {
    /// Stable string form for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::Simple => "simple",
            AuthMethod::Kerberos => "kerberos",
            AuthMethod::External => "external",
            AuthMethod::Anonymous => "anonymous",
        }
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn has_username(config: &ConnectionConfig) -> bool {
    config.username.as_deref().is_some_and(|u| !u.is_empty())
}

fn kerberos_usable(config: &ConnectionConfig) -> bool {
    config.kerberos.as_ref().is_some_and(|krb| {
        !krb.realm.is_empty() && (has_username(config) || krb.keytab_path.is_some())
    })
}

/// Select the authentication mechanism for a configuration.
pub fn select_auth_method(config: &ConnectionConfig) -> AuthMethod {
    if kerberos_usable(config) {
        AuthMethod::Kerberos
    } else if has_username(config) {
        AuthMethod::Simple
    } else if config.tls.has_client_cert() {
        AuthMethod::External
    } else {
        AuthMethod::Anonymous
    }
}

/// Whether an authentication mechanism can actually be attempted, not merely
/// hinted at. The pool tracks authentication state only when this is true.
pub fn has_authentication(config: &ConnectionConfig) -> bool {
    select_auth_method(config) != AuthMethod::Anonymous
}

/// Authenticate an open connection against the chosen server.
pub async fn authenticate(
    ldap: &mut Ldap,
    config: &ConnectionConfig,
    server: &ServerInfo,
) -> DirectoryResult<()> {
    let method = select_auth_method(config);
    debug!(method = %method, server = %server.host, "authenticating connection");

    match method {
        AuthMethod::Simple => simple::bind(ldap, config).await,
        AuthMethod::Kerberos => kerberos::bind(ldap, config, server).await,
        AuthMethod::External => external::bind(ldap).await,
        AuthMethod::Anonymous => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpool_core::config::KerberosConfig;

    #[test]
    fn test_kerberos_takes_precedence_over_simple() {
        let config = ConnectionConfig::for_domain("example.com")
            .with_credentials("svc@example.com", "secret")
            .with_kerberos(KerberosConfig::new("EXAMPLE.COM"));

        assert_eq!(select_auth_method(&config), AuthMethod::Kerberos);
    }

    #[test]
    fn test_kerberos_with_keytab_needs_no_username() {
        let config = ConnectionConfig::for_domain("example.com")
            .with_kerberos(KerberosConfig::new("EXAMPLE.COM").with_keytab("/etc/svc.keytab"));

        assert_eq!(select_auth_method(&config), AuthMethod::Kerberos);
    }

    #[test]
    fn test_realm_alone_is_not_usable_kerberos() {
        // A realm without username or keytab cannot be attempted; the hint
        // alone must not select Kerberos.
        let config = ConnectionConfig::for_domain("example.com")
            .with_kerberos(KerberosConfig::new("EXAMPLE.COM"));

        assert_eq!(select_auth_method(&config), AuthMethod::Anonymous);
        assert!(!has_authentication(&config));
    }

    #[test]
    fn test_username_selects_simple() {
        let config = ConnectionConfig::for_domain("example.com")
            .with_credentials("cn=admin,dc=example,dc=com", "secret");

        assert_eq!(select_auth_method(&config), AuthMethod::Simple);
        assert!(has_authentication(&config));
    }

    #[test]
    fn test_client_cert_selects_external_when_no_stronger_hint() {
        let mut config = ConnectionConfig::for_domain("example.com");
        config.tls.client_cert_path = Some("/etc/tls/client.pem".to_string());
        config.tls.client_key_path = Some("/etc/tls/client.key".to_string());

        assert_eq!(select_auth_method(&config), AuthMethod::External);

        // A username outranks the certificate.
        let with_user = config.clone().with_credentials("admin", "pw");
        assert_eq!(select_auth_method(&with_user), AuthMethod::Simple);
    }

    #[test]
    fn test_cert_without_key_is_not_external() {
        let mut config = ConnectionConfig::for_domain("example.com");
        config.tls.client_cert_path = Some("/etc/tls/client.pem".to_string());

        assert_eq!(select_auth_method(&config), AuthMethod::Anonymous);
    }

    #[test]
    fn test_no_material_is_anonymous() {
        let config = ConnectionConfig::for_domain("example.com");
        assert_eq!(select_auth_method(&config), AuthMethod::Anonymous);
        assert!(!has_authentication(&config));
    }
}
