//! Remote command execution.
//!
//! Opens a fresh session channel per command, runs it, and collects stdout,
//! stderr, and the exit status. The entire message loop sits under one
//! timeout; when it fires the channel is closed (keeping the connection
//! alive) and a [`SshMcpError::CommandTimeout`] is returned instead of
//! partial output.

use std::time::Duration;

use russh::ChannelMsg;
use tracing::warn;

use crate::mcp::error::SshMcpError;
use crate::mcp::session::SshSession;
use crate::mcp::types::CommandResponse;

/// Commands longer than this are truncated in timeout error messages.
const TIMEOUT_COMMAND_PREVIEW: usize = 80;

/// Strip at most one trailing newline (`\n` or `\r\n`) from command output.
pub(crate) fn trim_trailing_newline(mut s: String) -> String {
    if s.ends_with('\n') {
        s.pop();
        if s.ends_with('\r') {
            s.pop();
        }
    }
    s
}

fn truncate_command(command: &str) -> String {
    if command.chars().count() <= TIMEOUT_COMMAND_PREVIEW {
        return command.to_string();
    }
    let prefix: String = command.chars().take(TIMEOUT_COMMAND_PREVIEW).collect();
    format!("{prefix}...")
}

/// Execute a command on the session and collect its output.
///
/// A missing exit status (server closed the channel without reporting one)
/// maps to exit code 0, since every shell failure path reports a status.
pub(crate) async fn execute_command(
    session: &SshSession,
    command: &str,
    timeout: Duration,
) -> Result<CommandResponse, SshMcpError> {
    let mut channel = session.open_channel().await?;

    channel
        .exec(true, command)
        .await
        .map_err(|e| SshMcpError::ExecutionFailed(format!("failed to execute command: {e}")))?;

    let mut stdout = Vec::with_capacity(4096);
    let mut stderr = Vec::with_capacity(1024);
    let mut exit_code: Option<u32> = None;

    let result = tokio::time::timeout(timeout, async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    stdout.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    // ext == 1 is stderr in the SSH protocol
                    if ext == 1 {
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = Some(exit_status);
                }
                Some(ChannelMsg::Eof) => {
                    if exit_code.is_some() {
                        break;
                    }
                }
                Some(ChannelMsg::Close) => {
                    break;
                }
                Some(_) => {}
                None => {
                    break;
                }
            }
        }
    })
    .await;

    // Close the channel either way so the session stays usable.
    let _ = channel.close().await;

    if result.is_err() {
        warn!(
            session_id = %session.id,
            timeout_ms = timeout.as_millis() as u64,
            "command timed out, channel closed"
        );
        return Err(SshMcpError::CommandTimeout {
            command: truncate_command(command),
        });
    }

    session.touch();

    Ok(CommandResponse {
        stdout: trim_trailing_newline(String::from_utf8_lossy(&stdout).into_owned()),
        stderr: trim_trailing_newline(String::from_utf8_lossy(&stderr).into_owned()),
        exit_code: exit_code.map(|c| c as i32).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    mod newline_trimming {
        use super::*;

        #[test]
        fn test_trims_single_newline() {
            assert_eq!(trim_trailing_newline("hello\n".to_string()), "hello");
        }

        #[test]
        fn test_trims_crlf() {
            assert_eq!(trim_trailing_newline("hello\r\n".to_string()), "hello");
        }

        #[test]
        fn test_trims_only_one_newline() {
            assert_eq!(trim_trailing_newline("hello\n\n".to_string()), "hello\n");
        }

        #[test]
        fn test_leaves_interior_newlines() {
            assert_eq!(
                trim_trailing_newline("line1\nline2\n".to_string()),
                "line1\nline2"
            );
        }

        #[test]
        fn test_empty_string() {
            assert_eq!(trim_trailing_newline(String::new()), "");
        }

        #[test]
        fn test_no_trailing_newline() {
            assert_eq!(trim_trailing_newline("hello".to_string()), "hello");
        }

        #[test]
        fn test_bare_newline() {
            assert_eq!(trim_trailing_newline("\n".to_string()), "");
        }
    }

    mod command_preview {
        use super::*;

        #[test]
        fn test_short_command_unchanged() {
            assert_eq!(truncate_command("ls -la"), "ls -la");
        }

        #[test]
        fn test_long_command_truncated() {
            let long = "x".repeat(200);
            let preview = truncate_command(&long);
            assert_eq!(preview.len(), TIMEOUT_COMMAND_PREVIEW + 3);
            assert!(preview.ends_with("..."));
        }

        #[test]
        fn test_boundary_length_unchanged() {
            let exact = "y".repeat(TIMEOUT_COMMAND_PREVIEW);
            assert_eq!(truncate_command(&exact), exact);
        }

        #[test]
        fn test_multibyte_command_truncates_on_chars() {
            let long: String = "\u{4e16}".repeat(100);
            let preview = truncate_command(&long);
            assert_eq!(preview.chars().count(), TIMEOUT_COMMAND_PREVIEW + 3);
        }
    }
}
