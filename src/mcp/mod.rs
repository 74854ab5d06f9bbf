//! MCP SSH session orchestration module.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Serializable response types for MCP tools
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy and retry classification
//! - `policy`: Compiled host allow-list
//! - `auth`: Credential resolution and authentication
//! - `session`: Per-connection state and connection establishment
//! - `registry`: Session storage, reuse, and idle eviction
//! - `exec`: Remote command execution
//! - `files`: SFTP file operations
//! - `tunnel`: Local and remote TCP tunnels
//! - `keygen`: OpenSSH keypair generation
//! - `commands`: MCP tool implementations

pub(crate) mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub(crate) mod exec;
pub(crate) mod files;
pub(crate) mod keygen;
pub mod policy;
pub mod registry;
pub mod session;
pub mod tunnel;
pub mod types;

pub use commands::SshSessionTools;
pub use config::Settings;
pub use registry::SessionRegistry;
