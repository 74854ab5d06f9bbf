//! Remote file operations over the session's SFTP subchannel.
//!
//! Every operation borrows the lazily opened subchannel from the session.
//! When an operation fails in a way that indicates the subchannel itself
//! died (the transport dropped, not a per-path failure) the cached channel
//! is invalidated so the next operation reopens it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{TimeZone, Utc};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, FileType};
use tracing::debug;

use crate::mcp::error::{SshMcpError, sftp_channel_terminated};
use crate::mcp::session::SshSession;
use crate::mcp::types::{
    ContentEncoding, DirEntryInfo, ListDirResponse, MakeDirResponse, ReadFileResponse,
    RemoteFileKind, RemoveResponse, RenameResponse, StatResponse, WriteFileResponse,
};

/// Recursion cap for `remove` with `recursive: true`. Deeper trees abort
/// with an error rather than risking unbounded descent through a cycle.
const MAX_REMOVE_DEPTH: usize = 64;

type SftpResult<T> = Result<T, russh_sftp::client::error::Error>;

/// Map an SFTP result, invalidating the cached subchannel when the error
/// means the channel itself is gone.
async fn check<T>(
    session: &SshSession,
    result: SftpResult<T>,
    path: &str,
) -> Result<T, SshMcpError> {
    match result {
        Ok(value) => Ok(value),
        Err(e) => {
            if sftp_channel_terminated(&e) {
                session.invalidate_sftp().await;
            }
            Err(SshMcpError::from_sftp(e, path))
        }
    }
}

fn kind_of(file_type: FileType) -> RemoteFileKind {
    match file_type {
        FileType::File => RemoteFileKind::File,
        FileType::Dir => RemoteFileKind::Directory,
        FileType::Symlink => RemoteFileKind::Symlink,
        FileType::Other => RemoteFileKind::Other,
    }
}

fn type_char(kind: RemoteFileKind) -> char {
    match kind {
        RemoteFileKind::File => '-',
        RemoteFileKind::Directory => 'd',
        RemoteFileKind::Symlink => 'l',
        RemoteFileKind::Other => '?',
    }
}

/// Render a kind and the low 9 permission bits as "drwxr-xr-x".
pub(crate) fn mode_string(kind: RemoteFileKind, mode: u32) -> String {
    let mut out = String::with_capacity(10);
    out.push(type_char(kind));
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Render the low 12 permission bits as octal, e.g. "644" or "4755".
pub(crate) fn mode_octal(mode: u32) -> String {
    format!("{:o}", mode & 0o7777)
}

fn timestamp_rfc3339(secs: Option<u32>) -> Option<String> {
    let secs = secs?;
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .map(|t| t.to_rfc3339())
}

/// List a remote directory, sorted by name, excluding "." and "..".
pub(crate) async fn list_dir(
    session: &SshSession,
    path: &str,
) -> Result<ListDirResponse, SshMcpError> {
    let sftp = session.sftp().await?;

    let metadata = check(session, sftp.metadata(path).await, path).await?;
    if !metadata.is_dir() {
        return Err(SshMcpError::NotADirectory(path.to_string()));
    }

    let dir = check(session, sftp.read_dir(path).await, path).await?;

    let mut entries: Vec<DirEntryInfo> = dir
        .filter(|entry| {
            let name = entry.file_name();
            name != "." && name != ".."
        })
        .map(|entry| {
            let kind = kind_of(entry.file_type());
            let attrs = entry.metadata();
            DirEntryInfo {
                name: entry.file_name(),
                kind,
                size: attrs.size.unwrap_or(0),
                permissions: mode_string(kind, attrs.permissions.unwrap_or(0)),
                modified_at: timestamp_rfc3339(attrs.mtime),
                accessed_at: timestamp_rfc3339(attrs.atime),
            }
        })
        .collect();
    // Directories first, then lexicographic within each group.
    entries.sort_by(|a, b| {
        let a_dir = a.kind == RemoteFileKind::Directory;
        let b_dir = b.kind == RemoteFileKind::Directory;
        b_dir.cmp(&a_dir).then_with(|| a.name.cmp(&b.name))
    });

    session.touch();
    let count = entries.len();
    Ok(ListDirResponse {
        path: path.to_string(),
        entries,
        count,
    })
}

/// Encode file content per the requested encoding.
///
/// A UTF-8 request falls back to base64 when the bytes are not valid
/// UTF-8; a base64 request always encodes the raw bytes.
fn encode_content(data: Vec<u8>, requested: ContentEncoding) -> (ContentEncoding, String) {
    match requested {
        ContentEncoding::Base64 => (ContentEncoding::Base64, BASE64.encode(&data)),
        ContentEncoding::Utf8 => match String::from_utf8(data) {
            Ok(text) => (ContentEncoding::Utf8, text),
            Err(err) => (ContentEncoding::Base64, BASE64.encode(err.into_bytes())),
        },
    }
}

/// Read a remote file, honoring the configured size cap.
pub(crate) async fn read_file(
    session: &SshSession,
    path: &str,
    max_size: u64,
    encoding: ContentEncoding,
) -> Result<ReadFileResponse, SshMcpError> {
    let sftp = session.sftp().await?;

    let metadata = check(session, sftp.metadata(path).await, path).await?;
    if metadata.is_dir() {
        return Err(SshMcpError::IsADirectory(path.to_string()));
    }
    let size = metadata.size.unwrap_or(0);
    if size > max_size {
        return Err(SshMcpError::TransferSizeExceeded {
            size,
            limit: max_size,
        });
    }

    let data = check(session, sftp.read(path).await, path).await?;
    session.touch();

    let size = data.len() as u64;
    let (encoding, content) = encode_content(data, encoding);
    Ok(ReadFileResponse {
        path: path.to_string(),
        size,
        encoding,
        content,
    })
}

/// Write a remote file, creating or truncating it.
///
/// `content` is raw text unless `base64` is set, in which case it is
/// decoded before upload. `mode` optionally applies octal permissions
/// (e.g. "644") after the write.
pub(crate) async fn write_file(
    session: &SshSession,
    path: &str,
    content: &str,
    base64: bool,
    mode: Option<&str>,
) -> Result<WriteFileResponse, SshMcpError> {
    let data: Vec<u8> = if base64 {
        BASE64.decode(content).map_err(|e| {
            SshMcpError::ExecutionFailed(format!("invalid base64 content: {e}"))
        })?
    } else {
        content.as_bytes().to_vec()
    };

    let mode = mode
        .map(|m| {
            u32::from_str_radix(m, 8).map_err(|_| {
                SshMcpError::ExecutionFailed(format!("invalid octal mode '{m}'"))
            })
        })
        .transpose()?;

    let sftp = session.sftp().await?;
    check(session, sftp.write(path, &data).await, path).await?;

    if let Some(mode) = mode {
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        check(session, sftp.set_metadata(path, attrs).await, path).await?;
    }
    session.touch();

    let bytes_written = data.len() as u64;
    Ok(WriteFileResponse {
        path: path.to_string(),
        bytes_written,
        message: format!("Wrote {bytes_written} bytes to {path}"),
    })
}

/// Whether a path currently exists, and if so whether it is a directory.
///
/// Returns `None` when the path does not exist; other failures propagate.
async fn probe_dir(
    session: &SshSession,
    sftp: &Arc<SftpSession>,
    path: &str,
) -> Result<Option<bool>, SshMcpError> {
    match sftp.metadata(path).await {
        Ok(attrs) => Ok(Some(attrs.is_dir())),
        Err(e) => match check::<()>(session, Err(e), path).await {
            Err(SshMcpError::RemoteObjectNotFound(_)) => Ok(None),
            Err(other) => Err(other),
            Ok(()) => unreachable!(),
        },
    }
}

/// Create a remote directory.
///
/// With `parents`, every missing component along the path is created, like
/// `mkdir -p`. An already existing directory is reported as success with
/// `created: false`; existence is detected by an explicit metadata probe,
/// never by interpreting a create failure.
pub(crate) async fn make_dir(
    session: &SshSession,
    path: &str,
    parents: bool,
) -> Result<MakeDirResponse, SshMcpError> {
    let sftp = session.sftp().await?;

    match probe_dir(session, &sftp, path).await? {
        Some(true) => {
            session.touch();
            return Ok(MakeDirResponse {
                path: path.to_string(),
                created: false,
                message: format!("Directory {path} already exists"),
            });
        }
        Some(false) => return Err(SshMcpError::NotADirectory(path.to_string())),
        None => {}
    }

    if parents {
        let mut prefix = if path.starts_with('/') {
            String::from("/")
        } else {
            String::new()
        };
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !prefix.is_empty() && !prefix.ends_with('/') {
                prefix.push('/');
            }
            prefix.push_str(component);

            match probe_dir(session, &sftp, &prefix).await? {
                Some(true) => continue,
                Some(false) => return Err(SshMcpError::NotADirectory(prefix.clone())),
                None => {
                    check(session, sftp.create_dir(&prefix).await, &prefix).await?;
                }
            }
        }
    } else {
        check(session, sftp.create_dir(path).await, path).await?;
    }

    session.touch();
    Ok(MakeDirResponse {
        path: path.to_string(),
        created: true,
        message: format!("Created directory {path}"),
    })
}

/// Depth-bounded post-order removal of a directory tree.
///
/// Returns the number of objects removed, the directory itself included.
fn remove_tree<'a>(
    session: &'a SshSession,
    sftp: &'a Arc<SftpSession>,
    path: String,
    depth: usize,
) -> Pin<Box<dyn Future<Output = Result<u64, SshMcpError>> + Send + 'a>> {
    Box::pin(async move {
        if depth > MAX_REMOVE_DEPTH {
            return Err(SshMcpError::Sftp {
                path,
                reason: format!("directory tree exceeds {MAX_REMOVE_DEPTH} levels"),
            });
        }

        let mut removed = 0u64;
        let dir = check(session, sftp.read_dir(&path).await, &path).await?;

        for entry in dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let child = if path.ends_with('/') {
                format!("{path}{name}")
            } else {
                format!("{path}/{name}")
            };

            // Symlinks to directories are removed as links, not descended.
            if entry.file_type() == FileType::Dir {
                removed += remove_tree(session, sftp, child, depth + 1).await?;
            } else {
                check(session, sftp.remove_file(&child).await, &child).await?;
                removed += 1;
            }
        }

        check(session, sftp.remove_dir(&path).await, &path).await?;
        Ok(removed + 1)
    })
}

/// Remove a remote file or directory.
///
/// Directories require `recursive` unless empty; files ignore the flag.
pub(crate) async fn remove(
    session: &SshSession,
    path: &str,
    recursive: bool,
) -> Result<RemoveResponse, SshMcpError> {
    let sftp = session.sftp().await?;

    // symlink_metadata so a symlink to a directory is removed as a link
    let attrs = check(session, sftp.symlink_metadata(path).await, path).await?;

    let removed_count = if attrs.is_dir() {
        if !recursive {
            return Err(SshMcpError::IsADirectory(path.to_string()));
        }
        remove_tree(session, &sftp, path.to_string(), 0).await?
    } else {
        check(session, sftp.remove_file(path).await, path).await?;
        1
    };

    session.touch();
    debug!(session_id = %session.id, path, removed_count, "removed remote object(s)");
    Ok(RemoveResponse {
        path: path.to_string(),
        removed_count,
        message: format!("Removed {removed_count} object(s) at {path}"),
    })
}

/// Rename a remote file or directory. Fails when the target exists.
pub(crate) async fn rename(
    session: &SshSession,
    from: &str,
    to: &str,
) -> Result<RenameResponse, SshMcpError> {
    let sftp = session.sftp().await?;
    check(session, sftp.rename(from, to).await, from).await?;
    session.touch();
    Ok(RenameResponse {
        from: from.to_string(),
        to: to.to_string(),
        message: format!("Renamed {from} to {to}"),
    })
}

/// Stat a remote path, following symlinks.
pub(crate) async fn stat(session: &SshSession, path: &str) -> Result<StatResponse, SshMcpError> {
    let sftp = session.sftp().await?;
    let attrs = check(session, sftp.metadata(path).await, path).await?;
    session.touch();

    let mode = attrs.permissions.unwrap_or(0);
    let kind = kind_of(attrs.file_type());
    Ok(StatResponse {
        path: path.to_string(),
        kind,
        size: attrs.size.unwrap_or(0),
        permissions: mode_string(kind, mode),
        mode_octal: mode_octal(mode),
        uid: attrs.uid,
        gid: attrs.gid,
        modified_at: timestamp_rfc3339(attrs.mtime),
        accessed_at: timestamp_rfc3339(attrs.atime),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    mod permission_formatting {
        use super::*;

        #[test]
        fn test_full_permissions() {
            assert_eq!(mode_string(RemoteFileKind::File, 0o777), "-rwxrwxrwx");
        }

        #[test]
        fn test_typical_file() {
            assert_eq!(mode_string(RemoteFileKind::File, 0o644), "-rw-r--r--");
        }

        #[test]
        fn test_typical_directory() {
            assert_eq!(mode_string(RemoteFileKind::Directory, 0o755), "drwxr-xr-x");
        }

        #[test]
        fn test_symlink_marker() {
            assert_eq!(mode_string(RemoteFileKind::Symlink, 0o777), "lrwxrwxrwx");
        }

        #[test]
        fn test_no_permissions() {
            assert_eq!(mode_string(RemoteFileKind::File, 0), "----------");
        }

        #[test]
        fn test_ignores_file_type_bits() {
            // 0o100644 is a regular file with rw-r--r--
            assert_eq!(mode_string(RemoteFileKind::File, 0o100644), "-rw-r--r--");
        }

        #[test]
        fn test_write_only() {
            assert_eq!(mode_string(RemoteFileKind::File, 0o200), "--w-------");
        }
    }

    mod octal_formatting {
        use super::*;

        #[test]
        fn test_typical_modes() {
            assert_eq!(mode_octal(0o644), "644");
            assert_eq!(mode_octal(0o755), "755");
        }

        #[test]
        fn test_setuid_bit_preserved() {
            assert_eq!(mode_octal(0o4755), "4755");
        }

        #[test]
        fn test_file_type_bits_masked() {
            assert_eq!(mode_octal(0o100644), "644");
        }

        #[test]
        fn test_zero() {
            assert_eq!(mode_octal(0), "0");
        }
    }

    mod content_encoding {
        use super::*;

        #[test]
        fn test_utf8_request_returns_text() {
            let (encoding, content) = encode_content(b"hello\n".to_vec(), ContentEncoding::Utf8);
            assert_eq!(encoding, ContentEncoding::Utf8);
            assert_eq!(content, "hello\n");
        }

        #[test]
        fn test_utf8_request_falls_back_for_binary() {
            let (encoding, content) =
                encode_content(vec![0x00, 0xff, 0xfe], ContentEncoding::Utf8);
            assert_eq!(encoding, ContentEncoding::Base64);
            assert_eq!(content, "AP/+");
        }

        #[test]
        fn test_base64_request_wins_over_valid_utf8() {
            // A caller asking for base64 gets base64 even for plain text.
            let (encoding, content) = encode_content(b"abc".to_vec(), ContentEncoding::Base64);
            assert_eq!(encoding, ContentEncoding::Base64);
            assert_eq!(content, "YWJj");
        }
    }

    mod timestamp_formatting {
        use super::*;

        #[test]
        fn test_none_stays_none() {
            assert_eq!(timestamp_rfc3339(None), None);
        }

        #[test]
        fn test_epoch() {
            let rendered = timestamp_rfc3339(Some(0)).unwrap();
            assert!(rendered.starts_with("1970-01-01T00:00:00"));
        }

        #[test]
        fn test_known_timestamp() {
            // 2024-01-15T10:30:00Z
            let rendered = timestamp_rfc3339(Some(1_705_314_600)).unwrap();
            assert!(rendered.starts_with("2024-01-15T10:30:00"));
        }
    }

    mod kind_mapping {
        use super::*;

        #[test]
        fn test_all_file_types() {
            assert_eq!(kind_of(FileType::File), RemoteFileKind::File);
            assert_eq!(kind_of(FileType::Dir), RemoteFileKind::Directory);
            assert_eq!(kind_of(FileType::Symlink), RemoteFileKind::Symlink);
            assert_eq!(kind_of(FileType::Other), RemoteFileKind::Other);
        }
    }
}
