//! Username/password simple bind.

use ldap3::Ldap;
use tracing::debug;

use adpool_core::config::ConnectionConfig;
use adpool_core::error::{DirectoryError, DirectoryResult};

use crate::codes;

/// Bind with the configured username and password.
pub async fn bind(ldap: &mut Ldap, config: &ConnectionConfig) -> DirectoryResult<()> {
    let username = config
        .username
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| {
            DirectoryError::invalid_config("simple bind requires a non-empty username")
        })?;
    let password = config.password.as_deref().unwrap_or("");

    debug!(bind_dn = %username, "performing simple bind");

    let result = ldap
        .simple_bind(username, password)
        .await
        .map_err(|e| codes::connect_error("simple bind", e))?;
    codes::check_result(&format!("simple bind as {username}"), result)?;

    Ok(())
}
