//! SSH session state and connection establishment.
//!
//! A [`SshSession`] owns the russh handle for one authenticated connection
//! plus its lazily opened SFTP subchannel and the forward-target table used
//! by remote tunnels. The handle sits behind a `tokio::sync::Mutex`; the
//! lock is held only across channel opens and forward requests, never
//! across command I/O.
//!
//! # Retry Strategy
//!
//! Connection attempts use exponential backoff with jitter via the `backon`
//! crate. Authentication failures are never retried to avoid account
//! lockouts; only transient transport errors are.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use russh::{Channel, Disconnect, client, keys};
use russh_sftp::client::SftpSession;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use backon::{ExponentialBuilder, Retryable};

use crate::mcp::auth::{AuthMethod, try_authenticate};
use crate::mcp::config::{CONNECT_TIMEOUT, MAX_RETRY_DELAY};
use crate::mcp::error::{SshMcpError, is_retryable_error};

/// Map of remote listener endpoints to local destinations, consulted when
/// the server opens a forwarded-tcpip channel back to us.
pub(crate) type ForwardTargets = Arc<DashMap<(String, u16), (String, u16)>>;

/// Client handler for russh.
///
/// Host key acceptance follows the session's strict flag: when off every
/// key is accepted (`StrictHostKeyChecking=no`), when on the key must be
/// present in the user's known_hosts file.
pub struct ClientHandler {
    host: String,
    port: u16,
    strict_host_key: bool,
    forward_targets: ForwardTargets,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.strict_host_key {
            return Ok(true);
        }

        match keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(known) => {
                if !known {
                    warn!(
                        host = %self.host,
                        port = self.port,
                        "server host key not found in known_hosts, rejecting"
                    );
                }
                Ok(known)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "known_hosts check failed, rejecting");
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let key = (connected_address.to_string(), connected_port as u16);
        let Some(target) = self.forward_targets.get(&key).map(|t| t.clone()) else {
            warn!(
                bind_addr = %connected_address,
                bind_port = connected_port,
                "forwarded channel for unknown listener, dropping"
            );
            return Ok(());
        };

        debug!(
            bind_addr = %connected_address,
            bind_port = connected_port,
            originator = %format!("{originator_address}:{originator_port}"),
            dest = %format!("{}:{}", target.0, target.1),
            "accepting forwarded channel"
        );

        tokio::spawn(async move {
            let mut local = match TcpStream::connect((target.0.as_str(), target.1)).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        dest = %format!("{}:{}", target.0, target.1),
                        error = %e,
                        "failed to reach forward destination"
                    );
                    return;
                }
            };

            let mut remote = channel.into_stream();
            if let Err(e) = tokio::io::copy_bidirectional(&mut remote, &mut local).await {
                debug!(error = %e, "forwarded channel relay ended with error");
            }
        });

        Ok(())
    }
}

/// One authenticated SSH connection and its associated state.
///
/// `id` is the registry key: a caller-supplied name, or the derived
/// `username@host:port` default.
pub struct SshSession {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub connected_at: DateTime<Utc>,
    pub retry_attempts: u32,
    handle: Arc<Mutex<client::Handle<ClientHandler>>>,
    /// Milliseconds since the Unix epoch; advanced with `fetch_max` so it
    /// never moves backwards under concurrent use.
    last_used_ms: AtomicI64,
    /// Cached SFTP subchannel, opened on first file operation.
    sftp: Mutex<Option<Arc<SftpSession>>>,
    forward_targets: ForwardTargets,
}

/// Default session identifier: `username@host:port`. A caller-supplied
/// name takes precedence over the derived form.
pub(crate) fn derive_session_id(
    name: Option<&str>,
    username: &str,
    host: &str,
    port: u16,
) -> String {
    match name {
        Some(name) => name.to_string(),
        None => format!("{username}@{host}:{port}"),
    }
}

impl SshSession {
    /// Record activity on the session.
    pub fn touch(&self) {
        self.last_used_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Milliseconds since the session was last used.
    pub fn idle_ms(&self) -> u64 {
        let last = self.last_used_ms.load(Ordering::Relaxed);
        Utc::now().timestamp_millis().saturating_sub(last).max(0) as u64
    }

    /// Last-used timestamp as RFC3339, for reporting.
    pub fn last_used_at(&self) -> DateTime<Utc> {
        let ms = self.last_used_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    /// Open a new session channel for command execution.
    pub async fn open_channel(&self) -> Result<Channel<client::Msg>, SshMcpError> {
        let handle = self.handle.lock().await;
        handle
            .channel_open_session()
            .await
            .map_err(|e| SshMcpError::ExecutionFailed(format!("failed to open channel: {e}")))
    }

    /// Open a direct-tcpip channel through this session.
    pub async fn open_direct_tcpip(
        &self,
        dest_addr: &str,
        dest_port: u16,
        originator_addr: &str,
        originator_port: u16,
    ) -> Result<Channel<client::Msg>, SshMcpError> {
        let handle = self.handle.lock().await;
        handle
            .channel_open_direct_tcpip(
                dest_addr,
                dest_port as u32,
                originator_addr,
                originator_port as u32,
            )
            .await
            .map_err(|e| {
                SshMcpError::ExecutionFailed(format!(
                    "failed to open direct-tcpip channel to {dest_addr}:{dest_port}: {e}"
                ))
            })
    }

    /// Request a remote listener and register its local destination.
    ///
    /// Returns the port the server actually bound, which differs from the
    /// request when port 0 was asked for.
    pub async fn request_remote_forward(
        &self,
        bind_addr: &str,
        bind_port: u16,
        dest_addr: &str,
        dest_port: u16,
    ) -> Result<u16, SshMcpError> {
        let bound_port = {
            let mut handle = self.handle.lock().await;
            handle
                .tcpip_forward(bind_addr, bind_port as u32)
                .await
                .map_err(|e| {
                    SshMcpError::ExecutionFailed(format!(
                        "remote forward request for {bind_addr}:{bind_port} failed: {e}"
                    ))
                })?
        };
        let bound_port = if bound_port == 0 {
            bind_port
        } else {
            bound_port as u16
        };

        self.forward_targets.insert(
            (bind_addr.to_string(), bound_port),
            (dest_addr.to_string(), dest_port),
        );
        Ok(bound_port)
    }

    /// Cancel a remote listener and drop its destination mapping.
    pub async fn cancel_remote_forward(
        &self,
        bind_addr: &str,
        bind_port: u16,
    ) -> Result<(), SshMcpError> {
        self.forward_targets
            .remove(&(bind_addr.to_string(), bind_port));
        let handle = self.handle.lock().await;
        handle
            .cancel_tcpip_forward(bind_addr, bind_port as u32)
            .await
            .map_err(|e| {
                SshMcpError::ExecutionFailed(format!(
                    "cancelling remote forward {bind_addr}:{bind_port} failed: {e}"
                ))
            })
    }

    /// Get the SFTP subchannel, opening it on first use.
    pub async fn sftp(&self) -> Result<Arc<SftpSession>, SshMcpError> {
        let mut guard = self.sftp.lock().await;
        if let Some(sftp) = guard.as_ref() {
            return Ok(sftp.clone());
        }

        debug!(session_id = %self.id, "opening SFTP subchannel");
        let channel = {
            let handle = self.handle.lock().await;
            handle.channel_open_session().await.map_err(|e| {
                SshMcpError::ExecutionFailed(format!("failed to open SFTP channel: {e}"))
            })?
        };
        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SshMcpError::ExecutionFailed(format!("SFTP subsystem request failed: {e}"))
        })?;

        let sftp = SftpSession::new(channel.into_stream()).await.map_err(|e| {
            SshMcpError::ExecutionFailed(format!("SFTP handshake failed: {e}"))
        })?;
        let sftp = Arc::new(sftp);
        *guard = Some(sftp.clone());
        Ok(sftp)
    }

    /// Drop the cached SFTP subchannel so the next file operation reopens it.
    pub async fn invalidate_sftp(&self) {
        let mut guard = self.sftp.lock().await;
        if guard.take().is_some() {
            debug!(session_id = %self.id, "SFTP subchannel invalidated");
        }
    }

    /// Send a disconnect message. Errors are logged, not propagated: the
    /// session is being dropped either way.
    pub async fn disconnect(&self) {
        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
        {
            debug!(session_id = %self.id, error = %e, "disconnect message failed");
        }
    }
}

/// Build the russh client configuration.
///
/// Inactivity timeout stays off: idle eviction is the registry's job, and a
/// transport-level timeout would race with it.
fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Establish and authenticate one connection, with the whole attempt
/// (TCP + handshake + auth) under a single deadline.
async fn connect_once(
    host: &str,
    port: u16,
    username: &str,
    methods: &[AuthMethod],
    strict_host_key: bool,
    forward_targets: ForwardTargets,
) -> Result<(client::Handle<ClientHandler>, &'static str), SshMcpError> {
    let config = build_client_config();
    let handler = ClientHandler {
        host: host.to_string(),
        port,
        strict_host_key,
        forward_targets,
    };

    let attempt = async {
        let mut handle = client::connect(config, (host, port), handler)
            .await
            .map_err(|e| SshMcpError::ConnectionFailed {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;

        let method = try_authenticate(&mut handle, username, host, methods).await?;
        Ok::<_, SshMcpError>((handle, method))
    };

    tokio::time::timeout(CONNECT_TIMEOUT, attempt)
        .await
        .map_err(|_| SshMcpError::ConnectionTimeout {
            host: host.to_string(),
            port,
            timeout_secs: CONNECT_TIMEOUT.as_secs(),
        })?
}

/// Connect with retry for transient failures, returning a ready session.
pub(crate) async fn connect_session(
    session_id: &str,
    host: &str,
    port: u16,
    username: &str,
    methods: Vec<AuthMethod>,
    strict_host_key: bool,
    max_retries: u32,
) -> Result<SshSession, SshMcpError> {
    let forward_targets: ForwardTargets = Arc::new(DashMap::new());
    let attempt_counter = AtomicU32::new(0);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
        if current_attempt > 0 {
            warn!(
                attempt = current_attempt,
                "SSH connection retry to {username}@{host}:{port}"
            );
        }

        connect_once(
            host,
            port,
            username,
            &methods,
            strict_host_key,
            forward_targets.clone(),
        )
        .await
    })
    .retry(backoff)
    .when(|e: &SshMcpError| {
        let retryable = is_retryable_error(&e.to_string());
        if !retryable {
            warn!("connection to {username}@{host}:{port} failed with non-retryable error: {e}");
        }
        retryable
    })
    .notify(|err, dur| {
        warn!("SSH connection failed: {err}. Retrying in {dur:?}");
    })
    .await;

    let total_attempts = attempt_counter.load(Ordering::SeqCst);
    let retry_attempts = total_attempts.saturating_sub(1);

    let (handle, method) = match result {
        Ok(pair) => pair,
        Err(e) => {
            error!(
                "connection to {username}@{host}:{port} failed after {total_attempts} attempt(s): {e}"
            );
            return Err(e);
        }
    };

    info!(
        method,
        retry_attempts, "established SSH session to {username}@{host}:{port}"
    );

    let now = Utc::now();
    Ok(SshSession {
        id: session_id.to_string(),
        host: host.to_string(),
        port,
        username: username.to_string(),
        connected_at: now,
        retry_attempts,
        handle: Arc::new(Mutex::new(handle)),
        last_used_ms: AtomicI64::new(now.timestamp_millis()),
        sftp: Mutex::new(None),
        forward_targets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    mod session_id {
        use super::*;

        #[test]
        fn test_standard_port() {
            assert_eq!(
                derive_session_id(None, "deploy", "web1.example.com", 22),
                "deploy@web1.example.com:22"
            );
        }

        #[test]
        fn test_custom_port() {
            assert_eq!(
                derive_session_id(None, "root", "10.0.0.5", 2222),
                "root@10.0.0.5:2222"
            );
        }

        #[test]
        fn test_caller_name_wins() {
            assert_eq!(
                derive_session_id(Some("bastion"), "deploy", "web1.example.com", 22),
                "bastion"
            );
        }

        #[test]
        fn test_same_inputs_same_id() {
            assert_eq!(
                derive_session_id(None, "a", "b", 22),
                derive_session_id(None, "a", "b", 22)
            );
        }
    }
}
