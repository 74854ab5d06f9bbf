//! Session registry: keyed storage, reuse, and idle eviction.
//!
//! The registry is plain injectable state (no globals): the server builds
//! one at startup and hands it to the tool layer, and tests build their
//! own. Sessions are keyed by a caller-supplied name, or
//! `username@host:port` by default; opening an identifier that already has
//! a live session reuses it after a liveness probe.
//!
//! The idle sweeper is a background task that runs only while sessions
//! exist: it is started when a session is opened and exits on its own once
//! the registry drains.

use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mcp::auth::resolve_auth_methods;
use crate::mcp::config::{IDLE_SWEEP_INTERVAL, PROBE_TIMEOUT, Settings};
use crate::mcp::error::SshMcpError;
use crate::mcp::exec::execute_command;
use crate::mcp::policy::HostPolicy;
use crate::mcp::session::{SshSession, connect_session, derive_session_id};
use crate::mcp::tunnel::TunnelRegistry;
use crate::mcp::types::{OpenSessionResponse, SessionInfo};

/// Connection request, as carried by the `ssh_open_session` tool.
#[derive(Debug, Default)]
pub struct OpenSessionParams {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    /// Caller-supplied session identifier; defaults to `username@host:port`.
    pub name: Option<String>,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub key_path: Option<String>,
    pub key_passphrase: Option<String>,
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SessionRegistry {
    settings: Settings,
    policy: HostPolicy,
    tunnels: Arc<TunnelRegistry>,
    sessions: DashMap<String, Arc<SshSession>>,
    sweeper: StdMutex<Option<Sweeper>>,
}

impl SessionRegistry {
    pub fn new(settings: Settings) -> Arc<Self> {
        let policy = HostPolicy::from_optional(settings.allowed_hosts.as_deref());
        Arc::new(Self {
            settings,
            policy,
            tunnels: Arc::new(TunnelRegistry::new()),
            sessions: DashMap::new(),
            sweeper: StdMutex::new(None),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn tunnels(&self) -> &Arc<TunnelRegistry> {
        &self.tunnels
    }

    /// Open a session, reusing a live one for the same endpoint.
    pub async fn open(
        self: &Arc<Self>,
        params: OpenSessionParams,
    ) -> Result<OpenSessionResponse, SshMcpError> {
        self.policy.check(&params.host)?;

        let username = params
            .username
            .unwrap_or_else(|| self.settings.default_username.clone());
        let port = params.port.unwrap_or(22);
        let session_id = derive_session_id(params.name.as_deref(), &username, &params.host, port);

        if let Some(existing) = self.sessions.get(&session_id).map(|e| e.clone()) {
            let probe = execute_command(&existing, "echo ok", PROBE_TIMEOUT).await;
            if matches!(probe, Ok(ref r) if r.exit_code == 0) {
                existing.touch();
                self.ensure_sweeper();
                debug!(session_id = %session_id, "reusing live session");
                return Ok(OpenSessionResponse {
                    session_id,
                    message: format!("Reusing existing session to {}@{}:{port}", username, params.host),
                    reused: true,
                    retry_attempts: existing.retry_attempts,
                });
            }
            warn!(session_id = %session_id, "cached session is dead, evicting before reconnect");
            self.drop_session(&session_id, false).await;
        }

        let methods = resolve_auth_methods(
            params.private_key,
            params.key_path,
            params.key_passphrase,
            params.password,
            self.settings.default_key_path.as_deref(),
        )?;

        let session = connect_session(
            &session_id,
            &params.host,
            port,
            &username,
            methods,
            self.settings.strict_host_key,
            self.settings.connect_retries,
        )
        .await?;

        let retry_attempts = session.retry_attempts;
        self.sessions.insert(session_id.clone(), Arc::new(session));
        self.ensure_sweeper();

        Ok(OpenSessionResponse {
            session_id,
            message: format!("Connected to {}@{}:{port}", username, params.host),
            reused: false,
            retry_attempts,
        })
    }

    /// Look up a session by id, marking it used.
    pub fn get(&self, session_id: &str) -> Result<Arc<SshSession>, SshMcpError> {
        let session = self
            .sessions
            .get(session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| SshMcpError::SessionNotFound(session_id.to_string()))?;
        session.touch();
        Ok(session)
    }

    /// Close a session, its tunnels, and its SFTP subchannel.
    ///
    /// Closing an unknown identifier is a no-op; the returned count says
    /// whether anything was actually closed.
    pub async fn close(&self, session_id: &str) -> usize {
        match self.drop_session(session_id, true).await {
            Some(_) => {
                info!(session_id, "session closed");
                1
            }
            None => {
                debug!(session_id, "close of unknown session, nothing to do");
                0
            }
        }
    }

    /// Close every session. Returns the number closed.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for id in &ids {
            if self.drop_session(id, true).await.is_some() {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, "closed all sessions");
        }
        closed
    }

    /// Snapshot of active sessions, sorted by id.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                SessionInfo {
                    session_id: session.id.clone(),
                    host: session.host.clone(),
                    port: session.port,
                    username: session.username.clone(),
                    connected_at: session.connected_at.to_rfc3339(),
                    last_used_at: session.last_used_at().to_rfc3339(),
                    idle_ms: session.idle_ms(),
                    retry_attempts: session.retry_attempts,
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close everything. Called on server shutdown.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.take_sweeper() {
            sweeper.cancel.cancel();
            sweeper.handle.abort();
        }

        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        join_all(ids.iter().map(|id| self.drop_session(id, true))).await;
        info!("session registry shut down");
    }

    async fn drop_session(&self, session_id: &str, disconnect: bool) -> Option<Arc<SshSession>> {
        let (_, session) = self.sessions.remove(session_id)?;
        self.tunnels.close_for_session(session_id).await;
        session.invalidate_sftp().await;
        if disconnect {
            session.disconnect().await;
        }
        Some(session)
    }

    /// Evict sessions idle beyond the configured threshold.
    async fn sweep_idle(&self) {
        let threshold_ms = self.settings.idle_timeout.as_millis() as u64;
        let idle_ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_ms() > threshold_ms)
            .map(|entry| entry.key().clone())
            .collect();

        for id in idle_ids {
            info!(session_id = %id, "evicting idle session");
            self.drop_session(&id, true).await;
        }
    }

    fn take_sweeper(&self) -> Option<Sweeper> {
        self.sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Start the idle sweeper unless one is already running.
    fn ensure_sweeper(self: &Arc<Self>) {
        let mut guard = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            // The first tick fires immediately; consume it so the first
            // sweep happens one full interval after startup.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let Some(registry) = weak.upgrade() else { break };
                registry.sweep_idle().await;

                // Self-disable once the registry drains; reopening a
                // session restarts the sweeper.
                if registry.sessions.is_empty() {
                    debug!("no sessions left, idle sweeper stopping");
                    break;
                }
            }
        });

        *guard = Some(Sweeper { cancel, handle });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restricted_registry() -> Arc<SessionRegistry> {
        let settings = Settings {
            allowed_hosts: Some("db.internal,*.example.com".to_string()),
            connect_retries: 0,
            ..Settings::default()
        };
        SessionRegistry::new(settings)
    }

    mod lookup {
        use super::*;

        #[test]
        fn test_get_unknown_session() {
            let registry = SessionRegistry::new(Settings::default());
            assert!(matches!(
                registry.get("nobody@nowhere:22"),
                Err(SshMcpError::SessionNotFound(_))
            ));
        }

        #[tokio::test]
        async fn test_close_unknown_session_is_a_noop() {
            let registry = SessionRegistry::new(Settings::default());
            assert_eq!(registry.close("nobody@nowhere:22").await, 0);
            assert!(registry.is_empty());
        }

        #[test]
        fn test_empty_registry_lists_nothing() {
            let registry = SessionRegistry::new(Settings::default());
            assert!(registry.is_empty());
            assert_eq!(registry.len(), 0);
            assert!(registry.list().is_empty());
        }
    }

    mod policy_enforcement {
        use super::*;

        #[tokio::test]
        async fn test_open_rejects_disallowed_host_before_dialing() {
            let registry = restricted_registry();
            let err = registry
                .open(OpenSessionParams {
                    host: "forbidden.host".to_string(),
                    ..OpenSessionParams::default()
                })
                .await
                .unwrap_err();

            assert!(matches!(err, SshMcpError::HostPolicyViolation { .. }));
            assert!(registry.is_empty());
        }

        #[tokio::test]
        async fn test_wildcard_pattern_passes_policy() {
            // The host matches the policy, so the failure (if any) must be
            // something other than a policy violation.
            let registry = restricted_registry();
            let result = registry
                .open(OpenSessionParams {
                    host: "invalid..example.com".to_string(),
                    password: Some("unused".to_string()),
                    ..OpenSessionParams::default()
                })
                .await;

            if let Err(e) = result {
                assert!(!matches!(e, SshMcpError::HostPolicyViolation { .. }));
            }
        }
    }

    mod shutdown {
        use super::*;

        #[tokio::test]
        async fn test_shutdown_on_empty_registry() {
            let registry = SessionRegistry::new(Settings::default());
            registry.shutdown().await;
            assert!(registry.is_empty());
        }
    }
}
