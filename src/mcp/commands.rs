//! MCP tool implementations for SSH session orchestration.
//!
//! Tools exposed:
//!
//! - `ssh_open_session` / `ssh_close_session` / `ssh_list_sessions`: session lifecycle
//! - `ssh_execute`: run a command on a session
//! - `ssh_list_dir`, `ssh_read_file`, `ssh_write_file`, `ssh_make_dir`,
//!   `ssh_remove`, `ssh_rename`, `ssh_stat`: SFTP file operations
//! - `ssh_create_tunnel` / `ssh_close_tunnel` / `ssh_list_tunnels`: TCP tunnels
//! - `ssh_generate_keypair`: local OpenSSH key generation

use std::sync::Arc;
use std::time::Duration;

use poem_mcpserver::{Tools, tool::StructuredContent};
use tracing::info;

use super::registry::{OpenSessionParams, SessionRegistry};
use super::types::{
    CloseSessionResponse, CloseTunnelResponse, CommandResponse, ContentEncoding,
    CreateTunnelResponse, KeypairResponse, ListDirResponse, ListTunnelsResponse, MakeDirResponse,
    OpenSessionResponse, ReadFileResponse, RemoveResponse, RenameResponse, SessionListResponse,
    StatResponse, TunnelDirection, WriteFileResponse,
};
use super::{exec, files, keygen};

/// MCP tool container holding the injected session registry.
pub struct SshSessionTools {
    registry: Arc<SessionRegistry>,
}

impl SshSessionTools {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[Tools]
impl SshSessionTools {
    /// Open an SSH session, or reuse a live one under the same identifier.
    ///
    /// Returns a stable session_id (the caller-supplied name, or
    /// `username@host:port`) for use with all other tools. Credentials
    /// resolve in order: inline key, key file, then password; when none of
    /// those were given, `SSH_DEFAULT_KEY_PATH` and the standard keys under
    /// `~/.ssh` are probed.
    async fn ssh_open_session(
        &self,
        /// Hostname or IP address of the SSH server
        host: String,
        /// SSH port (default: 22)
        port: Option<u16>,
        /// Username (default: SSH_DEFAULT_USERNAME, then $USER)
        username: Option<String>,
        /// Custom session identifier (default: username@host:port)
        name: Option<String>,
        /// Password for password authentication (optional, tried last)
        password: Option<String>,
        /// Inline OpenSSH private key material (optional, takes precedence)
        private_key: Option<String>,
        /// Path to a private key file (optional)
        key_path: Option<String>,
        /// Passphrase for the private key (optional)
        key_passphrase: Option<String>,
    ) -> Result<StructuredContent<OpenSessionResponse>, String> {
        let response = self
            .registry
            .open(OpenSessionParams {
                host,
                port,
                username,
                name,
                password,
                private_key,
                key_path,
                key_passphrase,
            })
            .await
            .map_err(|e| e.to_string())?;
        Ok(StructuredContent(response))
    }

    /// Close an SSH session, along with its tunnels and SFTP channel.
    ///
    /// Without a session_id, closes every active session. Closing an
    /// unknown id is a no-op reported as zero sessions closed.
    async fn ssh_close_session(
        &self,
        /// Session ID returned by ssh_open_session; omit to close all sessions
        session_id: Option<String>,
    ) -> Result<StructuredContent<CloseSessionResponse>, String> {
        match session_id {
            Some(id) => {
                let closed_count = self.registry.close(&id).await;
                let message = if closed_count == 1 {
                    format!("Session {id} closed")
                } else {
                    format!("No active session {id}")
                };
                Ok(StructuredContent(CloseSessionResponse {
                    closed_count,
                    message,
                }))
            }
            None => {
                let closed_count = self.registry.close_all().await;
                Ok(StructuredContent(CloseSessionResponse {
                    closed_count,
                    message: format!("Closed {closed_count} session(s)"),
                }))
            }
        }
    }

    /// List all active SSH sessions with their idle times.
    async fn ssh_list_sessions(&self) -> Result<StructuredContent<SessionListResponse>, String> {
        let sessions = self.registry.list();
        let count = sessions.len();
        Ok(StructuredContent(SessionListResponse { sessions, count }))
    }

    /// Execute a command on a session and wait for it to finish.
    ///
    /// The command runs on a fresh channel; the session stays usable
    /// afterwards. A timeout aborts the command with an error and leaves
    /// the session alive.
    async fn ssh_execute(
        &self,
        /// Session ID returned by ssh_open_session
        session_id: String,
        /// Shell command to execute
        command: String,
        /// Timeout in milliseconds (default: 30000, env: SSH_COMMAND_TIMEOUT_MS)
        timeout_ms: Option<u64>,
    ) -> Result<StructuredContent<CommandResponse>, String> {
        let session = self.registry.get(&session_id).map_err(|e| e.to_string())?;
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.registry.settings().command_timeout);

        info!(session_id = %session_id, "executing command");
        let response = exec::execute_command(&session, &command, timeout)
            .await
            .map_err(|e| e.to_string())?;
        Ok(StructuredContent(response))
    }

    /// List a remote directory via SFTP, sorted by name.
    async fn ssh_list_dir(
        &self,
        /// Session ID returned by ssh_open_session
        session_id: String,
        /// Absolute remote directory path
        path: String,
    ) -> Result<StructuredContent<ListDirResponse>, String> {
        let session = self.registry.get(&session_id).map_err(|e| e.to_string())?;
        let response = files::list_dir(&session, &path)
            .await
            .map_err(|e| e.to_string())?;
        Ok(StructuredContent(response))
    }

    /// Read a remote file.
    ///
    /// By default the content comes back as text, falling back to base64
    /// when it is not valid UTF-8; requesting "base64" always returns the
    /// raw bytes encoded. Files larger than the size cap are rejected.
    async fn ssh_read_file(
        &self,
        /// Session ID returned by ssh_open_session
        session_id: String,
        /// Absolute remote file path
        path: String,
        /// Content encoding: "utf8" or "base64" (default: "utf8")
        encoding: Option<String>,
        /// Maximum size in bytes (default: 1048576, env: SSH_MAX_READ_SIZE)
        max_size: Option<u64>,
    ) -> Result<StructuredContent<ReadFileResponse>, String> {
        let session = self.registry.get(&session_id).map_err(|e| e.to_string())?;
        let encoding = match encoding.as_deref() {
            None | Some("utf8") => ContentEncoding::Utf8,
            Some("base64") => ContentEncoding::Base64,
            Some(other) => {
                return Err(format!(
                    "unknown encoding '{other}', expected \"utf8\" or \"base64\""
                ));
            }
        };
        let max_size = max_size.unwrap_or(self.registry.settings().max_read_size);
        let response = files::read_file(&session, &path, max_size, encoding)
            .await
            .map_err(|e| e.to_string())?;
        Ok(StructuredContent(response))
    }

    /// Write a remote file, creating or overwriting it.
    async fn ssh_write_file(
        &self,
        /// Session ID returned by ssh_open_session
        session_id: String,
        /// Absolute remote file path
        path: String,
        /// File content; raw text, or base64 when the flag is set
        content: String,
        /// Treat content as base64-encoded binary (default: false)
        base64: Option<bool>,
        /// Octal permissions to apply after writing, e.g. "644" (optional)
        mode: Option<String>,
    ) -> Result<StructuredContent<WriteFileResponse>, String> {
        let session = self.registry.get(&session_id).map_err(|e| e.to_string())?;
        let response = files::write_file(
            &session,
            &path,
            &content,
            base64.unwrap_or(false),
            mode.as_deref(),
        )
        .await
        .map_err(|e| e.to_string())?;
        Ok(StructuredContent(response))
    }

    /// Create a remote directory.
    ///
    /// An already existing directory is a success with `created: false`.
    async fn ssh_make_dir(
        &self,
        /// Session ID returned by ssh_open_session
        session_id: String,
        /// Absolute remote directory path
        path: String,
        /// Create missing parent directories, like mkdir -p (default: false)
        parents: Option<bool>,
    ) -> Result<StructuredContent<MakeDirResponse>, String> {
        let session = self.registry.get(&session_id).map_err(|e| e.to_string())?;
        let response = files::make_dir(&session, &path, parents.unwrap_or(false))
            .await
            .map_err(|e| e.to_string())?;
        Ok(StructuredContent(response))
    }

    /// Remove a remote file or directory.
    ///
    /// Non-empty directories require `recursive: true`.
    async fn ssh_remove(
        &self,
        /// Session ID returned by ssh_open_session
        session_id: String,
        /// Absolute remote path
        path: String,
        /// Remove directory contents recursively (default: false)
        recursive: Option<bool>,
    ) -> Result<StructuredContent<RemoveResponse>, String> {
        let session = self.registry.get(&session_id).map_err(|e| e.to_string())?;
        let response = files::remove(&session, &path, recursive.unwrap_or(false))
            .await
            .map_err(|e| e.to_string())?;
        Ok(StructuredContent(response))
    }

    /// Rename or move a remote file or directory.
    async fn ssh_rename(
        &self,
        /// Session ID returned by ssh_open_session
        session_id: String,
        /// Current absolute remote path
        from: String,
        /// New absolute remote path
        to: String,
    ) -> Result<StructuredContent<RenameResponse>, String> {
        let session = self.registry.get(&session_id).map_err(|e| e.to_string())?;
        let response = files::rename(&session, &from, &to)
            .await
            .map_err(|e| e.to_string())?;
        Ok(StructuredContent(response))
    }

    /// Stat a remote path, following symlinks.
    async fn ssh_stat(
        &self,
        /// Session ID returned by ssh_open_session
        session_id: String,
        /// Absolute remote path
        path: String,
    ) -> Result<StructuredContent<StatResponse>, String> {
        let session = self.registry.get(&session_id).map_err(|e| e.to_string())?;
        let response = files::stat(&session, &path)
            .await
            .map_err(|e| e.to_string())?;
        Ok(StructuredContent(response))
    }

    /// Create a TCP tunnel through a session.
    ///
    /// Direction "local" listens on this host and forwards to
    /// `dest_addr:dest_port` on the remote network; "remote" asks the
    /// server to listen and forwards back here. A bind_port of 0 picks an
    /// ephemeral port, reported in the response.
    async fn ssh_create_tunnel(
        &self,
        /// Session ID returned by ssh_open_session
        session_id: String,
        /// Tunnel direction: "local" or "remote" (default: "local")
        direction: Option<String>,
        /// Listener bind address (default: "127.0.0.1")
        bind_addr: Option<String>,
        /// Listener port; 0 picks an ephemeral port (default: 0)
        bind_port: Option<u16>,
        /// Destination host to forward to
        dest_addr: String,
        /// Destination port to forward to
        dest_port: u16,
    ) -> Result<StructuredContent<CreateTunnelResponse>, String> {
        let session = self.registry.get(&session_id).map_err(|e| e.to_string())?;

        let direction = match direction.as_deref().unwrap_or("local") {
            "local" => TunnelDirection::Local,
            "remote" => TunnelDirection::Remote,
            other => return Err(format!("unknown tunnel direction '{other}', expected \"local\" or \"remote\"")),
        };
        let bind_addr = bind_addr.unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = bind_port.unwrap_or(0);

        let tunnels = self.registry.tunnels();
        let info = match direction {
            TunnelDirection::Local => {
                tunnels
                    .open_local(session, &bind_addr, bind_port, &dest_addr, dest_port)
                    .await
            }
            TunnelDirection::Remote => {
                tunnels
                    .open_remote(session, &bind_addr, bind_port, &dest_addr, dest_port)
                    .await
            }
        }
        .map_err(|e| e.to_string())?;

        let message = format!(
            "Opened {direction} tunnel {}:{} -> {}:{}",
            info.bind_addr, info.bind_port, info.dest_addr, info.dest_port
        );
        Ok(StructuredContent(CreateTunnelResponse {
            tunnel: info,
            message,
        }))
    }

    /// Close a tunnel by id.
    async fn ssh_close_tunnel(
        &self,
        /// Tunnel ID returned by ssh_create_tunnel
        tunnel_id: String,
    ) -> Result<StructuredContent<CloseTunnelResponse>, String> {
        self.registry
            .tunnels()
            .close(&tunnel_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(StructuredContent(CloseTunnelResponse {
            message: format!("Tunnel {tunnel_id} closed"),
            tunnel_id,
            closed: true,
        }))
    }

    /// List all active tunnels across sessions.
    async fn ssh_list_tunnels(&self) -> Result<StructuredContent<ListTunnelsResponse>, String> {
        let tunnels = self.registry.tunnels().list();
        let count = tunnels.len();
        Ok(StructuredContent(ListTunnelsResponse { tunnels, count }))
    }

    /// Generate an OpenSSH keypair locally.
    ///
    /// Nothing is sent to any remote host; the caller installs the public
    /// key where needed.
    async fn ssh_generate_keypair(
        &self,
        /// Key algorithm: "ed25519", "rsa", or "ecdsa"
        key_type: String,
        /// Key size in bits (rsa: 1024-8192, default 3072; ecdsa: 256/384/521; ed25519: fixed 256)
        bits: Option<u32>,
        /// Comment embedded in the public key (optional)
        comment: Option<String>,
        /// Passphrase to encrypt the private key with (optional)
        passphrase: Option<String>,
    ) -> Result<StructuredContent<KeypairResponse>, String> {
        let response = keygen::generate_keypair(key_type, bits, comment, passphrase)
            .await
            .map_err(|e| e.to_string())?;
        Ok(StructuredContent(response))
    }
}
