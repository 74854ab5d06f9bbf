//! Error taxonomy and failure classification.
//!
//! Every operation surfaces one of these variants to the caller; the MCP tool
//! boundary flattens them to strings. A separate classifier decides which
//! connection errors are transient and worth retrying versus permanent
//! failures that should fail immediately (authentication errors are never
//! retried to avoid account lockouts).

use thiserror::Error;

use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;

/// Errors surfaced by the session orchestration layer.
#[derive(Debug, Error)]
pub enum SshMcpError {
    #[error("host '{host}' is not permitted by SSH_ALLOWED_HOSTS ({patterns})")]
    HostPolicyViolation { host: String, patterns: String },

    #[error("no usable credentials: provide a private key, key path or password")]
    AuthenticationUnavailable,

    #[error("authentication failed for {username}@{host}: {reason}")]
    AuthenticationFailed {
        username: String,
        host: String,
        reason: String,
    },

    #[error("connection to {host}:{port} timed out after {timeout_secs}s")]
    ConnectionTimeout {
        host: String,
        port: u16,
        timeout_secs: u64,
    },

    #[error("connection to {host}:{port} failed: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("no active session with ID: {0}")]
    SessionNotFound(String),

    #[error("command execution failed: {0}")]
    ExecutionFailed(String),

    #[error("command timed out: {command}")]
    CommandTimeout { command: String },

    #[error("remote file is {size} bytes, exceeding the {limit} byte read limit")]
    TransferSizeExceeded { size: u64, limit: u64 },

    #[error("remote path not found: {0}")]
    RemoteObjectNotFound(String),

    #[error("{0} exists but is not a directory")]
    NotADirectory(String),

    #[error("{0} is a directory")]
    IsADirectory(String),

    #[error("forward conflict: {0}")]
    ForwardConflict(String),

    #[error("no active tunnel with ID: {0}")]
    TunnelNotFound(String),

    #[error("invalid key parameters: {0}")]
    InvalidKeyParameters(String),

    #[error("unsupported key type '{0}' (expected ed25519, rsa or ecdsa)")]
    UnsupportedKeyType(String),

    #[error("SFTP operation on {path} failed: {reason}")]
    Sftp { path: String, reason: String },
}

impl SshMcpError {
    /// Map an SFTP-level error to the taxonomy, attaching the remote path.
    ///
    /// `NoSuchFile` becomes [`SshMcpError::RemoteObjectNotFound`]; everything
    /// else is wrapped as a transport-level SFTP failure.
    pub(crate) fn from_sftp(err: SftpError, path: &str) -> Self {
        match &err {
            SftpError::Status(status) if status.status_code == StatusCode::NoSuchFile => {
                SshMcpError::RemoteObjectNotFound(path.to_string())
            }
            _ => SshMcpError::Sftp {
                path: path.to_string(),
                reason: err.to_string(),
            },
        }
    }
}

/// Whether an SFTP error indicates the subchannel itself died (as opposed to
/// a remote filesystem status), in which case the cached session must be
/// dropped and reopened on the next file operation.
pub(crate) fn sftp_channel_terminated(err: &SftpError) -> bool {
    match err {
        SftpError::Status(status) => matches!(
            status.status_code,
            StatusCode::NoConnection | StatusCode::ConnectionLost
        ),
        // Timeouts, unexpected packets and protocol violations all leave the
        // subchannel in an unusable state.
        _ => true,
    }
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
];

/// Determines if a connection error is retryable (transient) or permanent.
///
/// Authentication failures are checked first and take precedence: an error
/// mentioning both a timeout and rejected credentials is not retried.
/// Unknown errors that look like SSH protocol failures are not retried
/// unless they also mention a timeout or connect problem.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    for auth_err in AUTH_ERRORS {
        if error_lower.contains(auth_err) {
            return false;
        }
    }

    for retryable_err in RETRYABLE_ERRORS {
        if error_lower.contains(retryable_err) {
            return true;
        }
    }

    !error_lower.contains("ssh")
        || error_lower.contains("timeout")
        || error_lower.contains("connect")
}

#[cfg(test)]
mod tests {
    use super::*;

    mod retry_classification {
        use super::*;

        #[test]
        fn test_auth_errors_not_retryable() {
            assert!(!is_retryable_error("Authentication failed"));
            assert!(!is_retryable_error("permission denied (publickey)"));
            assert!(!is_retryable_error("All authentication methods failed"));
        }

        #[test]
        fn test_connection_errors_retryable() {
            assert!(is_retryable_error("Connection refused"));
            assert!(is_retryable_error("connection reset by peer"));
            assert!(is_retryable_error("Network is unreachable"));
            assert!(is_retryable_error("No route to host"));
            assert!(is_retryable_error("broken pipe"));
        }

        #[test]
        fn test_auth_takes_precedence_over_connection() {
            assert!(!is_retryable_error(
                "Connection timeout during authentication failed"
            ));
        }

        #[test]
        fn test_ssh_protocol_errors_not_retryable() {
            assert!(!is_retryable_error("SSH protocol error"));
            assert!(!is_retryable_error("SSH version mismatch"));
        }

        #[test]
        fn test_ssh_with_timeout_or_connect_retryable() {
            assert!(is_retryable_error("SSH connection timeout"));
            assert!(is_retryable_error("SSH failed to connect"));
        }

        #[test]
        fn test_unknown_error_defaults_to_retryable() {
            assert!(is_retryable_error(""));
            assert!(is_retryable_error("Something went wrong"));
        }

        #[test]
        fn test_case_insensitivity() {
            assert!(!is_retryable_error("PERMISSION DENIED"));
            assert!(is_retryable_error("CONNECTION REFUSED"));
        }
    }

    mod error_display {
        use super::*;

        #[test]
        fn test_session_not_found_names_id() {
            let err = SshMcpError::SessionNotFound("deploy-box".to_string());
            assert!(err.to_string().contains("deploy-box"));
        }

        #[test]
        fn test_host_policy_violation_names_host_and_patterns() {
            let err = SshMcpError::HostPolicyViolation {
                host: "evil.example.org".to_string(),
                patterns: "*.internal.example.com".to_string(),
            };
            let msg = err.to_string();
            assert!(msg.contains("evil.example.org"));
            assert!(msg.contains("*.internal.example.com"));
        }

        #[test]
        fn test_transfer_size_exceeded_reports_both_sizes() {
            let err = SshMcpError::TransferSizeExceeded {
                size: 2_000_000,
                limit: 1_048_576,
            };
            let msg = err.to_string();
            assert!(msg.contains("2000000"));
            assert!(msg.contains("1048576"));
        }

        #[test]
        fn test_command_timeout_carries_command() {
            let err = SshMcpError::CommandTimeout {
                command: "sleep 600".to_string(),
            };
            assert!(err.to_string().contains("sleep 600"));
        }

        #[test]
        fn test_forward_conflict_names_tunnel() {
            let err = SshMcpError::ForwardConflict("local:127.0.0.1:8080->db:5432".to_string());
            assert!(err.to_string().contains("local:127.0.0.1:8080->db:5432"));
        }
    }
}
