//! LDAP result code classification
//!
//! Maps protocol result codes and transport-level `ldap3` errors onto the
//! shared [`DirectoryError`] taxonomy so the retry loop and the layers above
//! it dispatch on classification, not on message text.

use ldap3::{LdapError, LdapResult};

use adpool_core::error::DirectoryError;

/// invalidCredentials
pub const RC_INVALID_CREDENTIALS: u32 = 49;
/// insufficientAccessRights
pub const RC_INSUFFICIENT_ACCESS: u32 = 50;
/// busy
pub const RC_BUSY: u32 = 51;
/// unavailable
pub const RC_UNAVAILABLE: u32 = 52;
/// noSuchObject
pub const RC_NO_SUCH_OBJECT: u32 = 32;
/// timeLimitExceeded
pub const RC_TIME_LIMIT_EXCEEDED: u32 = 3;
/// entryAlreadyExists
pub const RC_ENTRY_ALREADY_EXISTS: u32 = 68;
/// serverDown (client-side)
pub const RC_SERVER_DOWN: u32 = 81;

/// Convert a non-zero LDAP result into a classified error.
///
/// `context` names the operation or target entry for diagnostics.
pub fn error_from_result(context: &str, result: LdapResult) -> DirectoryError {
    match result.rc {
        RC_INVALID_CREDENTIALS => DirectoryError::auth_failed(format!(
            "{context}: invalid credentials ({})",
            result.text
        )),
        RC_INSUFFICIENT_ACCESS => DirectoryError::AuthorizationFailed {
            operation: context.to_string(),
        },
        RC_BUSY | RC_UNAVAILABLE | RC_SERVER_DOWN => DirectoryError::ServerUnavailable {
            message: format!("{context}: rc={}, {}", result.rc, result.text),
        },
        RC_TIME_LIMIT_EXCEEDED => DirectoryError::ServerUnavailable {
            message: format!("{context}: time limit exceeded, {}", result.text),
        },
        RC_NO_SUCH_OBJECT => DirectoryError::NotFound {
            identifier: if result.matched.is_empty() {
                context.to_string()
            } else {
                result.matched.clone()
            },
        },
        RC_ENTRY_ALREADY_EXISTS => DirectoryError::AlreadyExists {
            identifier: context.to_string(),
        },
        _ => DirectoryError::operation_failed(format!(
            "{context}: rc={}, {}",
            result.rc, result.text
        )),
    }
}

/// Check an LDAP result, mapping non-success codes onto the taxonomy.
pub fn check_result(context: &str, result: LdapResult) -> Result<LdapResult, DirectoryError> {
    if result.rc == 0 {
        Ok(result)
    } else {
        Err(error_from_result(context, result))
    }
}

/// Classify an `ldap3` error raised while establishing or binding a
/// connection. Transport-level failures are retryable connection errors.
pub fn connect_error(context: &str, err: LdapError) -> DirectoryError {
    match err {
        LdapError::LdapResult { result } => error_from_result(context, result),
        other => DirectoryError::connection_failed_with_source(context.to_string(), other),
    }
}

/// Classify an `ldap3` error raised by a directory operation on an already
/// established connection.
pub fn op_error(context: &str, err: LdapError) -> DirectoryError {
    match err {
        LdapError::LdapResult { result } => error_from_result(context, result),
        other => DirectoryError::operation_failed_with_source(context.to_string(), other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(rc: u32, text: &str) -> LdapResult {
        LdapResult {
            rc,
            matched: String::new(),
            text: text.to_string(),
            refs: Vec::new(),
            ctrls: Vec::new(),
        }
    }

    #[test]
    fn test_invalid_credentials_not_retryable() {
        let err = error_from_result("bind cn=admin", result(RC_INVALID_CREDENTIALS, "data 52e"));
        assert!(err.is_authentication());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_busy_and_unavailable_retryable() {
        for rc in [RC_BUSY, RC_UNAVAILABLE, RC_SERVER_DOWN] {
            let err = error_from_result("search", result(rc, "try later"));
            assert!(err.is_retryable(), "rc={rc} should be retryable");
        }
    }

    #[test]
    fn test_time_limit_exceeded_retryable_with_server_text() {
        let err = error_from_result("search", result(RC_TIME_LIMIT_EXCEEDED, "time limit"));
        assert!(err.is_retryable());
        let message = err.to_string();
        assert!(message.contains("time limit"));
        assert!(!message.contains("0 seconds"));
    }

    #[test]
    fn test_already_exists_is_conflict() {
        let err = error_from_result(
            "add cn=grp,dc=example,dc=com",
            result(RC_ENTRY_ALREADY_EXISTS, "exists"),
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn test_no_such_object_is_not_found() {
        let err = error_from_result("delete cn=x", result(RC_NO_SUCH_OBJECT, ""));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_check_result_passes_success() {
        assert!(check_result("bind", result(0, "")).is_ok());
        assert!(check_result("bind", result(1, "operations error")).is_err());
    }
}
