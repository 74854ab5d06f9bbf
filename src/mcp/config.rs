//! Configuration resolution for the SSH session MCP server.
//!
//! Values are resolved with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided function parameter (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_DEFAULT_USERNAME` | `$USER` / `root` | Username when a request omits one |
//! | `SSH_DEFAULT_KEY_PATH` | none | Private key probed before the standard locations |
//! | `SSH_IDLE_TIMEOUT_MS` | 1800000 | Idle session eviction threshold |
//! | `SSH_COMMAND_TIMEOUT_MS` | 30000 | Default command execution timeout |
//! | `SSH_STRICT_HOST_KEY` | false | Reject unknown server host keys |
//! | `SSH_ALLOWED_HOSTS` | unset | Comma-separated host allow-list patterns |
//! | `SSH_MAX_READ_SIZE` | 1048576 | read_file size cap in bytes |
//! | `SSH_CONNECT_RETRIES` | 2 | Retry attempts for transient connect failures |

use std::env;
use std::time::Duration;

/// Fixed connection timeout per attempt.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for the liveness probe issued before reusing a cached session.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between idle-sweep passes.
pub(crate) const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum retry delay cap for connect backoff.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Default idle session eviction threshold in milliseconds (30 minutes).
pub(crate) const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1_800_000;

/// Default command execution timeout in milliseconds.
pub(crate) const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Default maximum read_file size in bytes (1 MiB).
pub(crate) const DEFAULT_MAX_READ_SIZE: u64 = 1_048_576;

/// Default retry attempts for transient connection failures.
pub(crate) const DEFAULT_CONNECT_RETRIES: u32 = 2;

pub(crate) const DEFAULT_USERNAME_ENV_VAR: &str = "SSH_DEFAULT_USERNAME";
pub(crate) const DEFAULT_KEY_PATH_ENV_VAR: &str = "SSH_DEFAULT_KEY_PATH";
pub(crate) const IDLE_TIMEOUT_ENV_VAR: &str = "SSH_IDLE_TIMEOUT_MS";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "SSH_COMMAND_TIMEOUT_MS";
pub(crate) const STRICT_HOST_KEY_ENV_VAR: &str = "SSH_STRICT_HOST_KEY";
pub(crate) const ALLOWED_HOSTS_ENV_VAR: &str = "SSH_ALLOWED_HOSTS";
pub(crate) const MAX_READ_SIZE_ENV_VAR: &str = "SSH_MAX_READ_SIZE";
pub(crate) const CONNECT_RETRIES_ENV_VAR: &str = "SSH_CONNECT_RETRIES";

/// Process-wide defaults, loaded once at startup and injected into the
/// registry so tests can construct their own.
#[derive(Debug, Clone)]
pub struct Settings {
    pub default_username: String,
    pub default_key_path: Option<String>,
    pub idle_timeout: Duration,
    pub command_timeout: Duration,
    pub strict_host_key: bool,
    pub allowed_hosts: Option<String>,
    pub max_read_size: u64,
    pub connect_retries: u32,
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Self {
        Self {
            default_username: resolve_default_username(None),
            default_key_path: env::var(DEFAULT_KEY_PATH_ENV_VAR).ok(),
            idle_timeout: Duration::from_millis(resolve_idle_timeout_ms(None)),
            command_timeout: Duration::from_millis(resolve_command_timeout_ms(None)),
            strict_host_key: resolve_strict_host_key(None),
            allowed_hosts: env::var(ALLOWED_HOSTS_ENV_VAR).ok().filter(|v| !v.is_empty()),
            max_read_size: resolve_max_read_size(None),
            connect_retries: resolve_connect_retries(None),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_username: "root".to_string(),
            default_key_path: None,
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            strict_host_key: false,
            allowed_hosts: None,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            connect_retries: DEFAULT_CONNECT_RETRIES,
        }
    }
}

/// Resolve the default username with priority: parameter -> env var -> $USER -> "root"
pub(crate) fn resolve_default_username(username_param: Option<String>) -> String {
    if let Some(username) = username_param {
        return username;
    }

    if let Ok(username) = env::var(DEFAULT_USERNAME_ENV_VAR)
        && !username.is_empty()
    {
        return username;
    }

    env::var("USER").unwrap_or_else(|_| "root".to_string())
}

/// Resolve the idle timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_idle_timeout_ms(timeout_param: Option<u64>) -> u64 {
    if let Some(timeout) = timeout_param {
        return timeout;
    }

    if let Ok(env_timeout) = env::var(IDLE_TIMEOUT_ENV_VAR)
        && let Ok(timeout) = env_timeout.parse::<u64>()
    {
        return timeout;
    }

    DEFAULT_IDLE_TIMEOUT_MS
}

/// Resolve the command execution timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_command_timeout_ms(timeout_param: Option<u64>) -> u64 {
    if let Some(timeout) = timeout_param {
        return timeout;
    }

    if let Ok(env_timeout) = env::var(COMMAND_TIMEOUT_ENV_VAR)
        && let Ok(timeout) = env_timeout.parse::<u64>()
    {
        return timeout;
    }

    DEFAULT_COMMAND_TIMEOUT_MS
}

/// Resolve the strict host key flag with priority: parameter -> env var -> default (off)
pub(crate) fn resolve_strict_host_key(strict_param: Option<bool>) -> bool {
    if let Some(strict) = strict_param {
        return strict;
    }

    if let Ok(env_strict) = env::var(STRICT_HOST_KEY_ENV_VAR) {
        return env_strict.eq_ignore_ascii_case("true") || env_strict == "1";
    }

    false
}

/// Resolve the read_file size cap with priority: parameter -> env var -> default
pub(crate) fn resolve_max_read_size(size_param: Option<u64>) -> u64 {
    if let Some(size) = size_param {
        return size;
    }

    if let Ok(env_size) = env::var(MAX_READ_SIZE_ENV_VAR)
        && let Ok(size) = env_size.parse::<u64>()
    {
        return size;
    }

    DEFAULT_MAX_READ_SIZE
}

/// Resolve connect retry attempts with priority: parameter -> env var -> default
pub(crate) fn resolve_connect_retries(retries_param: Option<u32>) -> u32 {
    if let Some(retries) = retries_param {
        return retries;
    }

    if let Ok(env_retries) = env::var(CONNECT_RETRIES_ENV_VAR)
        && let Ok(retries) = env_retries.parse::<u32>()
    {
        return retries;
    }

    DEFAULT_CONNECT_RETRIES
}
