//! Scripted in-memory transport.
//!
//! Records every call, answers commands from substring rules, and can
//! refuse connections per host. `healthy()` answers the container state
//! query with `running`, which is what `--dry-run` uses.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CommandOutput, RemoteSession, RemoteTransport, SshTarget, TransportError};

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect { host: String },
    Execute { host: String, command: String, input: Option<String> },
    Upload { host: String, local: PathBuf, remote: String, recursive: bool },
    Download { host: String, remote: String, local: PathBuf },
}

struct Rule {
    host: Option<String>,
    pattern: String,
    output: CommandOutput,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<MockCall>>,
    refused: Mutex<HashSet<String>>,
    rules: Mutex<Vec<Rule>>,
    files: Mutex<Vec<(String, String, Vec<u8>)>>,
    latency: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Test double for [`RemoteTransport`]. Cloning shares state.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    /// Every command succeeds with empty output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command succeeds and containers report `running`.
    pub fn healthy() -> Self {
        let mock = Self::new();
        mock.respond("docker inspect", CommandOutput::ok(&["running"]));
        mock
    }

    /// Refuses connections to `host`.
    pub fn fail_connect(&self, host: &str) {
        self.state.refused.lock().insert(host.to_string());
    }

    /// Answers any command containing `pattern`. Later rules win.
    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.state.rules.lock().push(Rule {
            host: None,
            pattern: pattern.to_string(),
            output,
        });
    }

    /// Like [`respond`](Self::respond) but only for one host.
    pub fn respond_on(&self, host: &str, pattern: &str, output: CommandOutput) {
        self.state.rules.lock().push(Rule {
            host: Some(host.to_string()),
            pattern: pattern.to_string(),
            output,
        });
    }

    /// Makes `remote` on `host` available for download.
    pub fn serve_file(&self, host: &str, remote: &str, contents: &[u8]) {
        self.state
            .files
            .lock()
            .push((host.to_string(), remote.to_string(), contents.to_vec()));
    }

    /// Delay applied to each execute call.
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = Some(latency);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.calls.lock().clone()
    }

    /// `(command, stdin)` pairs executed on `host`, in order.
    pub fn executions(&self, host: &str) -> Vec<(String, Option<String>)> {
        self.state
            .calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                MockCall::Execute { host: h, command, input } if h == host => {
                    Some((command.clone(), input.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// `(local, remote)` pairs uploaded to `host`, in order.
    pub fn uploads(&self, host: &str) -> Vec<(PathBuf, String)> {
        self.state
            .calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                MockCall::Upload { host: h, local, remote, .. } if h == host => {
                    Some((local.clone(), remote.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Highest number of concurrently running execute calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: MockCall) {
        self.state.calls.lock().push(call);
    }

    fn answer(&self, host: &str, command: &str) -> CommandOutput {
        self.state
            .rules
            .lock()
            .iter()
            .rev()
            .find(|r| {
                command.contains(&r.pattern) && r.host.as_deref().map_or(true, |h| h == host)
            })
            .map(|r| r.output.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, TransportError> {
        self.record(MockCall::Connect {
            host: target.host.clone(),
        });
        if self.state.refused.lock().contains(&target.host) {
            return Err(TransportError::Connection(format!(
                "{}:{} unreachable",
                target.host, target.port
            )));
        }
        Ok(Box::new(MockSession {
            host: target.host.clone(),
            mock: self.clone(),
        }))
    }
}

struct MockSession {
    host: String,
    mock: MockTransport,
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn execute(&self, command: &str, input: Option<&str>) -> Result<CommandOutput, TransportError> {
        self.mock.record(MockCall::Execute {
            host: self.host.clone(),
            command: command.to_string(),
            input: input.map(str::to_string),
        });

        let state = &self.mock.state;
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = *state.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        state.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(self.mock.answer(&self.host, command))
    }

    async fn upload(&self, local: &Path, remote: &str, recursive: bool) -> Result<(), TransportError> {
        self.mock.record(MockCall::Upload {
            host: self.host.clone(),
            local: local.to_path_buf(),
            remote: remote.to_string(),
            recursive,
        });
        if !local.exists() {
            return Err(TransportError::Transfer(format!(
                "{} does not exist",
                local.display()
            )));
        }
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        self.mock.record(MockCall::Download {
            host: self.host.clone(),
            remote: remote.to_string(),
            local: local.to_path_buf(),
        });
        let contents = self
            .mock
            .state
            .files
            .lock()
            .iter()
            .find(|(h, r, _)| h == &self.host && r == remote)
            .map(|(_, _, c)| c.clone());
        match contents {
            Some(bytes) => std::fs::write(local, bytes)
                .map_err(|e| TransportError::Io(format!("{}: {}", local.display(), e))),
            None => Err(TransportError::Transfer(format!(
                "{}:{} not found",
                self.host, remote
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Credential;

    fn target(host: &str) -> SshTarget {
        SshTarget {
            host: host.to_string(),
            port: 22,
            user: "u".into(),
            credential: Credential::Password("p".into()),
        }
    }

    #[test]
    fn mock_transport_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MockTransport>();
    }

    #[tokio::test]
    async fn host_rule_overrides_global_rule() {
        let mock = MockTransport::healthy();
        mock.respond_on("h2", "docker inspect", CommandOutput::ok(&["exited"]));

        let s1 = mock.connect(&target("h1")).await.expect("h1");
        let s2 = mock.connect(&target("h2")).await.expect("h2");
        let a = s1.execute("docker inspect x", None).await.expect("exec");
        let b = s2.execute("docker inspect x", None).await.expect("exec");
        assert_eq!(a.first_line(), "running");
        assert_eq!(b.first_line(), "exited");
    }

    #[tokio::test]
    async fn download_serves_scripted_files() {
        let mock = MockTransport::new();
        mock.serve_file("h1", "/d/docker-compose.json", b"{}");
        let tmp = tempfile::tempdir().expect("tempdir");
        let local = tmp.path().join("m.json");

        let s = mock.connect(&target("h1")).await.expect("connect");
        s.download("/d/docker-compose.json", &local).await.expect("download");
        assert_eq!(std::fs::read(&local).expect("read"), b"{}");
        assert!(s.download("/missing", &local).await.is_err());
    }

    #[tokio::test]
    async fn upload_of_missing_path_fails() {
        let mock = MockTransport::new();
        let s = mock.connect(&target("h1")).await.expect("connect");
        let err = s
            .upload(Path::new("/definitely/not/here"), "/tmp/x", false)
            .await
            .expect_err("missing");
        assert!(matches!(err, TransportError::Transfer(_)));
        assert_eq!(mock.uploads("h1").len(), 1);
    }
}
