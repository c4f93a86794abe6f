//! SSH transport on top of the system `ssh` and `scp` binaries.
//!
//! Password credentials go through `sshpass -e` with the password in the
//! `SSHPASS` environment variable, never on the command line. Key-file
//! credentials use `-i` with `BatchMode=yes`. New host keys are accepted on
//! first contact (`StrictHostKeyChecking=accept-new`).

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{CommandOutput, RemoteSession, RemoteTransport, SshTarget, TransportError};
use crate::model::Credential;

/// ssh reserves exit status 255 for its own failures.
const SSH_FAILURE_EXIT: i32 = 255;

/// sshpass exits with 5 when the password is rejected.
const SSHPASS_BAD_PASSWORD_EXIT: i32 = 5;

/// Production transport.
#[derive(Debug, Clone)]
pub struct SshTransport {
    timeout: Duration,
    connect_timeout_secs: u64,
}

impl SshTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            connect_timeout_secs: 10,
        }
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, TransportError> {
        let session = SshSession {
            target: target.clone(),
            timeout: self.timeout,
            connect_timeout_secs: self.connect_timeout_secs,
        };
        // probe so unreachable hosts fail before any real work
        let probe = session.execute("true", None).await?;
        if !probe.success() {
            return Err(session.probe_failure(&probe));
        }
        Ok(Box::new(session))
    }
}

struct SshSession {
    target: SshTarget,
    timeout: Duration,
    connect_timeout_secs: u64,
}

impl SshSession {
    /// Base command with authentication wiring applied.
    fn command(&self, program: &str) -> Command {
        let mut cmd = match &self.target.credential {
            Credential::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(program).env("SSHPASS", password);
                cmd
            }
            Credential::KeyFile(path) => {
                let mut cmd = Command::new(program);
                cmd.arg("-i").arg(path).args(["-o", "BatchMode=yes"]);
                cmd
            }
        };
        cmd.args(["-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            .kill_on_drop(true);
        cmd
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}@{}:{}", self.target.user, self.target.host, path)
    }

    async fn run(
        &self,
        mut cmd: Command,
        operation: &str,
        input: Option<&str>,
    ) -> Result<CommandOutput, TransportError> {
        cmd.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Io(format!("spawn {}: {}", operation, e)))?;

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(data.as_bytes())
                .await
                .map_err(|e| TransportError::Io(format!("stdin: {}", e)))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: operation.to_string(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| TransportError::Io(format!("{}: {}", operation, e)))?;

        let code = output.status.code().ok_or_else(|| {
            TransportError::Connection(format!("{} terminated by signal", operation))
        })?;
        Ok(CommandOutput::from_raw(&output.stdout, &output.stderr, code))
    }

    fn classify(&self, output: &CommandOutput) -> TransportError {
        let stderr = output.stderr.join("\n");
        if stderr.contains("Permission denied") {
            TransportError::Authentication(format!("{}@{}", self.target.user, self.target.host))
        } else {
            TransportError::Connection(format!("{}: {}", self.target.host, stderr))
        }
    }

    fn password_rejected(&self, output: &CommandOutput) -> bool {
        matches!(self.target.credential, Credential::Password(_))
            && output.exit_code == SSHPASS_BAD_PASSWORD_EXIT
    }

    /// Error for a failed `true` probe. The probe itself cannot exit with
    /// anything but 0, so any other status comes from sshpass or ssh.
    fn probe_failure(&self, probe: &CommandOutput) -> TransportError {
        if self.password_rejected(probe) {
            TransportError::Authentication(format!(
                "{}@{}: password rejected",
                self.target.user, self.target.host
            ))
        } else {
            TransportError::Connection(format!(
                "{}: probe exited with {}",
                self.target.host, probe.exit_code
            ))
        }
    }

    async fn copy(&self, from: String, to: String, recursive: bool) -> Result<(), TransportError> {
        let mut cmd = self.command("scp");
        cmd.arg("-P").arg(self.target.port.to_string());
        if recursive {
            cmd.arg("-r");
        }
        cmd.arg(&from).arg(&to);

        let output = self.run(cmd, "transfer", None).await?;
        match output.exit_code {
            0 => Ok(()),
            _ if self.password_rejected(&output) => Err(TransportError::Authentication(format!(
                "{}@{}: password rejected",
                self.target.user, self.target.host
            ))),
            _ if output.stderr.iter().any(|l| l.contains("Permission denied (")) => {
                Err(self.classify(&output))
            }
            code => Err(TransportError::Transfer(format!(
                "{} -> {} exited with {}: {}",
                from,
                to,
                code,
                output.stderr.join("\n")
            ))),
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn execute(&self, command: &str, input: Option<&str>) -> Result<CommandOutput, TransportError> {
        let mut cmd = self.command("ssh");
        cmd.arg("-p")
            .arg(self.target.port.to_string())
            .arg(format!("{}@{}", self.target.user, self.target.host))
            .arg(command);

        let output = self.run(cmd, "execute", input).await?;
        if output.exit_code == SSH_FAILURE_EXIT {
            return Err(self.classify(&output));
        }
        Ok(output)
    }

    async fn upload(&self, local: &Path, remote: &str, recursive: bool) -> Result<(), TransportError> {
        self.copy(local.display().to_string(), self.remote_spec(remote), recursive)
            .await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        self.copy(self.remote_spec(remote), local.display().to_string(), false)
            .await
    }
}
