//! # Remote Transport
//!
//! Abstraction over the two remote primitives the orchestrator relies on:
//! running a command on a host and copying files to or from it.
//!
//! ## Implementations
//!
//! | Type | Backend | Used by |
//! |------|---------|---------|
//! | [`SshTransport`] | system `ssh` / `scp` via `tokio::process` | production |
//! | [`MockTransport`] | scripted, records every call | tests, `--dry-run` |
//!
//! The transport owns per-call timeouts. Callers see a timeout as
//! [`TransportError::Timeout`] and never block past it.
//!
//! [`RemoteShell`] is the per-node convenience wrapper used by lifecycle
//! actions: it checks exit codes, handles `sudo`, and logs each command.

mod mock;
mod ssh;

pub use mock::{MockCall, MockTransport};
pub use ssh::SshTransport;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::error::NodeError;
use crate::model::{Credential, NodeSpec};

// ════════════════════════════════════════════════════════════════════════════════
// TYPES
// ════════════════════════════════════════════════════════════════════════════════

/// Where and how to log in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: Credential,
}

impl SshTarget {
    pub fn for_node(node: &NodeSpec) -> Self {
        Self {
            host: node.host.clone(),
            port: node.ssh_port,
            user: node.user.clone(),
            credential: node.credential.clone(),
        }
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: i32,
}

impl CommandOutput {
    /// Successful output with the given stdout lines.
    pub fn ok<S: AsRef<str>>(lines: &[S]) -> Self {
        Self {
            stdout: lines.iter().map(|l| l.as_ref().to_string()).collect(),
            stderr: Vec::new(),
            exit_code: 0,
        }
    }

    /// Failed output with the given exit code and stderr text.
    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.lines().map(str::to_string).collect(),
            exit_code,
        }
    }

    pub(crate) fn from_raw(stdout: &[u8], stderr: &[u8], exit_code: i32) -> Self {
        let split = |raw: &[u8]| -> Vec<String> {
            String::from_utf8_lossy(raw).lines().map(str::to_string).collect()
        };
        Self {
            stdout: split(stdout),
            stderr: split(stderr),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn first_line(&self) -> String {
        self.stdout.first().cloned().unwrap_or_default()
    }
}

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Local process failure (spawn, pipe).
    #[error("local I/O failure: {0}")]
    Io(String),
}

// ════════════════════════════════════════════════════════════════════════════════
// TRAITS
// ════════════════════════════════════════════════════════════════════════════════

/// Opens sessions to remote hosts.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, TransportError>;
}

/// An authenticated session with one host.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Runs `command`, feeding `input` on stdin when given.
    ///
    /// A non-zero exit is not an error at this level; it is reported in
    /// [`CommandOutput::exit_code`].
    async fn execute(&self, command: &str, input: Option<&str>) -> Result<CommandOutput, TransportError>;

    /// Copies a local file (or directory when `recursive`) to `remote`.
    async fn upload(&self, local: &Path, remote: &str, recursive: bool) -> Result<(), TransportError>;

    /// Copies a remote file to `local`.
    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransportError>;
}

// ════════════════════════════════════════════════════════════════════════════════
// REMOTE SHELL
// ════════════════════════════════════════════════════════════════════════════════

/// Per-node command helper built on a [`RemoteSession`].
pub struct RemoteShell {
    label: String,
    session: Box<dyn RemoteSession>,
    sudo_password: Option<String>,
}

impl RemoteShell {
    /// Connects to the node's host.
    pub async fn open(transport: &dyn RemoteTransport, node: &NodeSpec) -> Result<Self, NodeError> {
        let target = SshTarget::for_node(node);
        let session = transport.connect(&target).await?;
        Ok(Self {
            label: node.label(),
            session,
            sudo_password: node.credential.sudo_password().map(str::to_string),
        })
    }

    /// Runs a command and fails on non-zero exit.
    pub async fn run(&self, command: &str) -> Result<CommandOutput, NodeError> {
        self.run_with_input(command, None).await
    }

    /// Runs a command through `sudo`, supplying the login password on stdin
    /// for password credentials.
    pub async fn sudo(&self, command: &str) -> Result<CommandOutput, NodeError> {
        let wrapped = format!("sudo -S -p '' sh -c {}", shell_quote(command));
        let input = self.sudo_password.as_ref().map(|p| format!("{}\n", p));
        self.run_with_input(&wrapped, input.as_deref()).await
    }

    /// `cd <dir>` then a sudo command.
    pub async fn sudo_in(&self, dir: &str, command: &str) -> Result<CommandOutput, NodeError> {
        self.sudo(&format!("cd {} && {}", shell_quote(dir), command)).await
    }

    /// Runs a read-only command and returns its first stdout line.
    pub async fn query(&self, command: &str) -> Result<String, NodeError> {
        Ok(self.sudo(command).await?.first_line())
    }

    pub async fn upload(&self, local: &Path, remote: &str, recursive: bool) -> Result<(), NodeError> {
        debug!(node = %self.label, local = %local.display(), remote, "upload");
        self.session.upload(local, remote, recursive).await?;
        Ok(())
    }

    pub async fn download(&self, remote: &str, local: &Path) -> Result<(), NodeError> {
        debug!(node = %self.label, remote, local = %local.display(), "download");
        self.session.download(remote, local).await?;
        Ok(())
    }

    async fn run_with_input(&self, command: &str, input: Option<&str>) -> Result<CommandOutput, NodeError> {
        debug!(node = %self.label, command, "execute");
        let output = self.session.execute(command, input).await?;
        if !output.success() {
            return Err(NodeError::RemoteExit {
                command: command.to_string(),
                code: output.exit_code,
                stderr: output.stderr.join("\n"),
            });
        }
        Ok(output)
    }
}

/// Single-quotes an argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r#"'\''"#))
}
