//! Remote execution and listener probes.
//!
//! Two seams: [`Connector`] / [`RemoteSession`] for mutating fleet hosts
//! and [`probe::ListenerProbe`] for functional checks against a service's
//! listeners. Each has a native implementation ([`ssh`], [`probe::RespProbe`])
//! and an in-memory one in [`fake`].

pub mod fake;
pub mod probe;
pub mod ssh;

use async_trait::async_trait;
use serde::Serialize;

pub use probe::{ListenerProbe, ProbeOutcome, ProbeTarget, RespProbe, TlsMaterial};
pub use ssh::SshConnector;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("authentication to {host} as {user} was rejected")]
    Auth { host: String, user: String },

    #[error("host key for {host} is not trusted")]
    HostKey { host: String },

    #[error("timed out after {secs}s connecting to {host}")]
    Timeout { host: String, secs: u64 },

    #[error("`{command}` on {host} exited with {status}: {stderr}")]
    Command {
        host: String,
        command: String,
        status: u32,
        stderr: String,
    },

    #[error("remote credential unusable: {0}")]
    Credential(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One host to open a session against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    /// Identity name; used for logs and error messages.
    pub name: String,
    pub address: String,
}

impl HostTarget {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl From<&heron_config::Identity> for HostTarget {
    fn from(identity: &heron_config::Identity) -> Self {
        Self::new(&identity.name, &identity.address)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandOutput {
    pub status: u32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Opens sessions. One session per operation, closed when the operation
/// ends; nothing is pooled.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &HostTarget) -> Result<Box<dyn RemoteSession>, RemoteError>;

    /// Confirm the remote credential exists and loads, without touching
    /// the network.
    fn preflight(&self) -> Result<(), RemoteError>;
}

/// Structured remote operations. Paths are absolute remote paths; modes are
/// octal permission bits.
#[async_trait]
pub trait RemoteSession: Send {
    fn host(&self) -> &str;

    async fn exec(&mut self, command: &str) -> Result<CommandOutput, RemoteError>;

    async fn ensure_dir(&mut self, path: &str) -> Result<(), RemoteError>;

    /// Atomically replace `path` with `contents` at permission `mode`.
    async fn write_file(&mut self, path: &str, contents: &[u8], mode: u32)
        -> Result<(), RemoteError>;

    /// Replace an existing file's contents, keeping its mode and ownership.
    async fn replace_file(&mut self, path: &str, contents: &[u8]) -> Result<(), RemoteError>;

    async fn read_file(&mut self, path: &str) -> Result<Vec<u8>, RemoteError>;

    async fn file_exists(&mut self, path: &str) -> Result<bool, RemoteError>;

    async fn file_mode(&mut self, path: &str) -> Result<u32, RemoteError>;

    async fn chown(&mut self, path: &str, owner: &str, group: &str) -> Result<(), RemoteError>;

    /// Copy preserving mode and ownership.
    async fn copy_file(&mut self, from: &str, to: &str) -> Result<(), RemoteError>;

    async fn restart_service(&mut self, unit: &str) -> Result<(), RemoteError>;

    /// Established inbound TCP connections on a local port.
    async fn established_connections(&mut self, port: u16) -> Result<u32, RemoteError>;

    async fn close(&mut self);
}
