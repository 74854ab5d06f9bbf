//! TCP tunnel management.
//!
//! Local tunnels bind a TCP listener on this host and forward each accepted
//! connection through a `direct-tcpip` channel (RFC 4254) to the
//! destination. Remote tunnels ask the server for a `tcpip-forward`
//! listener; the session's client handler relays the forwarded channels
//! back to the local destination.
//!
//! Data in both directions moves with `tokio::io::copy_bidirectional` over
//! the channel's byte stream.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::mcp::error::SshMcpError;
use crate::mcp::session::SshSession;
use crate::mcp::types::{TunnelDirection, TunnelInfo};

/// Tunnel identifier, stable for a given endpoint pair.
pub(crate) fn derive_tunnel_id(
    direction: TunnelDirection,
    bind_addr: &str,
    bind_port: u16,
    dest_addr: &str,
    dest_port: u16,
) -> String {
    format!("{direction}:{bind_addr}:{bind_port}->{dest_addr}:{dest_port}")
}

enum TunnelKind {
    /// Local listener; cancelling the token stops the accept loop.
    Local { cancel: CancellationToken },
    /// Remote listener; closing requires a cancel request on the session.
    Remote { session: Arc<SshSession> },
}

struct Tunnel {
    info: TunnelInfo,
    kind: TunnelKind,
}

impl Tunnel {
    async fn shut_down(&self) {
        match &self.kind {
            TunnelKind::Local { cancel } => cancel.cancel(),
            TunnelKind::Remote { session } => {
                // The session may already be gone; the mapping is dropped
                // either way.
                if let Err(e) = session
                    .cancel_remote_forward(&self.info.bind_addr, self.info.bind_port)
                    .await
                {
                    debug!(tunnel_id = %self.info.tunnel_id, error = %e, "remote forward cancel failed");
                }
            }
        }
    }
}

/// Classify a listener bind failure: an occupied address is a forward
/// conflict, anything else (bad address, privileged port) is a plain
/// connection failure.
fn bind_error(bind_addr: &str, bind_port: u16, err: std::io::Error) -> SshMcpError {
    if err.kind() == std::io::ErrorKind::AddrInUse {
        SshMcpError::ForwardConflict(format!("{bind_addr}:{bind_port} is already in use"))
    } else {
        SshMcpError::ConnectionFailed {
            host: bind_addr.to_string(),
            port: bind_port,
            reason: format!("cannot bind listener: {err}"),
        }
    }
}

/// Registry of active tunnels across all sessions.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<Tunnel>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a local tunnel: listen on `bind_addr:bind_port`, forward each
    /// connection through `session` to `dest_addr:dest_port`.
    ///
    /// A requested port of 0 binds an ephemeral port; the resolved port is
    /// reported in the returned info.
    pub async fn open_local(
        &self,
        session: Arc<SshSession>,
        bind_addr: &str,
        bind_port: u16,
        dest_addr: &str,
        dest_port: u16,
    ) -> Result<TunnelInfo, SshMcpError> {
        // For a fixed port the id is known up front, so a duplicate is
        // caught before any socket is allocated.
        if bind_port != 0 {
            let candidate = derive_tunnel_id(
                TunnelDirection::Local,
                bind_addr,
                bind_port,
                dest_addr,
                dest_port,
            );
            if self.tunnels.contains_key(&candidate) {
                return Err(SshMcpError::ForwardConflict(format!(
                    "tunnel {candidate} already exists"
                )));
            }
        }

        let listener = TcpListener::bind((bind_addr, bind_port))
            .await
            .map_err(|e| bind_error(bind_addr, bind_port, e))?;
        let bound_port = listener
            .local_addr()
            .map_err(|e| bind_error(bind_addr, bind_port, e))?
            .port();

        let tunnel_id = derive_tunnel_id(
            TunnelDirection::Local,
            bind_addr,
            bound_port,
            dest_addr,
            dest_port,
        );
        if self.tunnels.contains_key(&tunnel_id) {
            return Err(SshMcpError::ForwardConflict(format!(
                "tunnel {tunnel_id} already exists"
            )));
        }

        let info = TunnelInfo {
            tunnel_id: tunnel_id.clone(),
            session_id: session.id.clone(),
            direction: TunnelDirection::Local,
            bind_addr: bind_addr.to_string(),
            bind_port: bound_port,
            dest_addr: dest_addr.to_string(),
            dest_port,
            created_at: Utc::now().to_rfc3339(),
        };

        let cancel = CancellationToken::new();
        let accept_cancel = cancel.clone();
        let accept_session = session.clone();
        let accept_dest = dest_addr.to_string();
        let accept_id = tunnel_id.clone();

        tokio::spawn(async move {
            debug!(tunnel_id = %accept_id, "local tunnel listening");
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                let (mut local_stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(tunnel_id = %accept_id, error = %e, "accept failed, stopping tunnel");
                        break;
                    }
                };

                debug!(tunnel_id = %accept_id, peer = %peer, "tunnel connection accepted");
                accept_session.touch();

                let session = accept_session.clone();
                let dest = accept_dest.clone();
                let id = accept_id.clone();
                tokio::spawn(async move {
                    let channel = match session
                        .open_direct_tcpip(&dest, dest_port, &peer.ip().to_string(), peer.port())
                        .await
                    {
                        Ok(channel) => channel,
                        Err(e) => {
                            debug!(tunnel_id = %id, error = %e, "failed to open tunnel channel");
                            return;
                        }
                    };

                    let mut remote = channel.into_stream();
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut local_stream, &mut remote).await
                    {
                        debug!(tunnel_id = %id, error = %e, "tunnel relay ended with error");
                    }
                });
            }
            debug!(tunnel_id = %accept_id, "local tunnel stopped");
        });

        self.tunnels.insert(
            tunnel_id.clone(),
            Arc::new(Tunnel {
                info: info.clone(),
                kind: TunnelKind::Local { cancel },
            }),
        );

        info!(tunnel_id = %tunnel_id, "opened local tunnel");
        Ok(info)
    }

    /// Open a remote tunnel: the server listens on `bind_addr:bind_port`
    /// and each connection is relayed back to `dest_addr:dest_port` here.
    pub async fn open_remote(
        &self,
        session: Arc<SshSession>,
        bind_addr: &str,
        bind_port: u16,
        dest_addr: &str,
        dest_port: u16,
    ) -> Result<TunnelInfo, SshMcpError> {
        if bind_port != 0 {
            let candidate = derive_tunnel_id(
                TunnelDirection::Remote,
                bind_addr,
                bind_port,
                dest_addr,
                dest_port,
            );
            if self.tunnels.contains_key(&candidate) {
                return Err(SshMcpError::ForwardConflict(format!(
                    "tunnel {candidate} already exists"
                )));
            }
        }

        let bound_port = session
            .request_remote_forward(bind_addr, bind_port, dest_addr, dest_port)
            .await?;

        let tunnel_id = derive_tunnel_id(
            TunnelDirection::Remote,
            bind_addr,
            bound_port,
            dest_addr,
            dest_port,
        );
        if self.tunnels.contains_key(&tunnel_id) {
            let _ = session.cancel_remote_forward(bind_addr, bound_port).await;
            return Err(SshMcpError::ForwardConflict(format!(
                "tunnel {tunnel_id} already exists"
            )));
        }

        let info = TunnelInfo {
            tunnel_id: tunnel_id.clone(),
            session_id: session.id.clone(),
            direction: TunnelDirection::Remote,
            bind_addr: bind_addr.to_string(),
            bind_port: bound_port,
            dest_addr: dest_addr.to_string(),
            dest_port,
            created_at: Utc::now().to_rfc3339(),
        };

        self.tunnels.insert(
            tunnel_id.clone(),
            Arc::new(Tunnel {
                info: info.clone(),
                kind: TunnelKind::Remote { session },
            }),
        );

        info!(tunnel_id = %tunnel_id, "opened remote tunnel");
        Ok(info)
    }

    /// Close a tunnel by id.
    pub async fn close(&self, tunnel_id: &str) -> Result<TunnelInfo, SshMcpError> {
        let (_, tunnel) = self
            .tunnels
            .remove(tunnel_id)
            .ok_or_else(|| SshMcpError::TunnelNotFound(tunnel_id.to_string()))?;
        tunnel.shut_down().await;
        info!(tunnel_id, "closed tunnel");
        Ok(tunnel.info.clone())
    }

    /// Close every tunnel belonging to a session. Used when the session is
    /// closed or evicted.
    pub async fn close_for_session(&self, session_id: &str) -> usize {
        let ids: Vec<String> = self
            .tunnels
            .iter()
            .filter(|entry| entry.info.session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed = 0;
        for id in ids {
            if let Some((_, tunnel)) = self.tunnels.remove(&id) {
                tunnel.shut_down().await;
                closed += 1;
            }
        }
        if closed > 0 {
            info!(session_id, closed, "closed session tunnels");
        }
        closed
    }

    /// List active tunnels, sorted by id.
    pub fn list(&self) -> Vec<TunnelInfo> {
        let mut infos: Vec<TunnelInfo> = self
            .tunnels
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by(|a, b| a.tunnel_id.cmp(&b.tunnel_id));
        infos
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod tunnel_id {
        use super::*;

        #[test]
        fn test_local_id_format() {
            assert_eq!(
                derive_tunnel_id(TunnelDirection::Local, "127.0.0.1", 8080, "db.internal", 5432),
                "local:127.0.0.1:8080->db.internal:5432"
            );
        }

        #[test]
        fn test_remote_id_format() {
            assert_eq!(
                derive_tunnel_id(TunnelDirection::Remote, "0.0.0.0", 9000, "localhost", 3000),
                "remote:0.0.0.0:9000->localhost:3000"
            );
        }

        #[test]
        fn test_direction_distinguishes_ids() {
            let local = derive_tunnel_id(TunnelDirection::Local, "a", 1, "b", 2);
            let remote = derive_tunnel_id(TunnelDirection::Remote, "a", 1, "b", 2);
            assert_ne!(local, remote);
        }

        #[test]
        fn test_deterministic() {
            assert_eq!(
                derive_tunnel_id(TunnelDirection::Local, "h", 1, "d", 2),
                derive_tunnel_id(TunnelDirection::Local, "h", 1, "d", 2)
            );
        }
    }

    mod bind_failures {
        use super::*;
        use std::io::{Error as IoError, ErrorKind};

        #[test]
        fn test_occupied_address_is_a_conflict() {
            let err = bind_error("127.0.0.1", 8080, IoError::from(ErrorKind::AddrInUse));
            assert!(matches!(err, SshMcpError::ForwardConflict(_)));
            assert!(err.to_string().contains("127.0.0.1:8080"));
        }

        #[test]
        fn test_privileged_port_is_not_a_conflict() {
            let err = bind_error("0.0.0.0", 443, IoError::from(ErrorKind::PermissionDenied));
            assert!(matches!(err, SshMcpError::ConnectionFailed { .. }));
        }
    }

    mod registry {
        use super::*;

        #[test]
        fn test_empty_registry() {
            let registry = TunnelRegistry::new();
            assert!(registry.is_empty());
            assert_eq!(registry.len(), 0);
            assert!(registry.list().is_empty());
        }

        #[tokio::test]
        async fn test_close_unknown_tunnel() {
            let registry = TunnelRegistry::new();
            let err = registry.close("local:127.0.0.1:1->x:2").await.unwrap_err();
            assert!(matches!(err, SshMcpError::TunnelNotFound(_)));
        }

        #[tokio::test]
        async fn test_close_for_session_with_no_tunnels() {
            let registry = TunnelRegistry::new();
            assert_eq!(registry.close_for_session("nobody@nowhere:22").await, 0);
        }
    }
}
