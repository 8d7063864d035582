//! SASL EXTERNAL bind.
//!
//! Performs an empty-credential bind; identity comes from the client
//! certificate presented during the TLS handshake.

use ldap3::Ldap;
use tracing::debug;

use adpool_core::error::DirectoryResult;

use crate::codes;

/// Bind using the identity established by the mutually authenticated transport.
pub async fn bind(ldap: &mut Ldap) -> DirectoryResult<()> {
    debug!("performing SASL EXTERNAL bind");

    let result = ldap
        .sasl_external_bind()
        .await
        .map_err(|e| codes::connect_error("SASL EXTERNAL bind", e))?;
    codes::check_result("SASL EXTERNAL bind", result)?;

    Ok(())
}
