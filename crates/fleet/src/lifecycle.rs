//! # Lifecycle Controller
//!
//! Named fleet operations built from the identity generator, the topology
//! builder, the manifest renderer and the executor.
//!
//! ## Operation Flow
//!
//! ```text
//! install(tag)
//!   ├── ensure identity (every node, sequential, fatal on error)
//!   ├── build topology + write genesis / peer lists
//!   ├── stage per-node directory (manifest, genesis, static peers, keys)
//!   ├── executor: deploy                 (transfer_parallel)
//!   ├── executor: status                 (skipped when cancelled)
//!   └── persist fleet (identities, tags of succeeded nodes, last_operation)
//!
//! update(tag)
//!   ├── executor: update manifest + swap image  (transfer_parallel)
//!   ├── executor: status
//!   └── persist fleet
//!
//! start | stop       executor, then status
//! remove | status    executor only
//! disk-usage         executor per host, then df_status.log
//! accounts           executor, then accounts.json
//! ```
//!
//! Pre-flight failures ([`FleetError`]) abort before the first remote call
//! and persist nothing. Per-node failures only show up in the report. Once
//! remote work has run, a failing local write is reported in
//! [`LifecycleOutcome::local_error`] and the report is still returned.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::actions::{self, ActionContext};
use crate::config::ClusterConfig;
use crate::error::FleetError;
use crate::executor::{CancelToken, FleetExecutor};
use crate::genesis::{self, GenesisTemplate, Topology, GENESIS_FILE, STATIC_NODES_FILE};
use crate::identity::{DefaultKeyGenerator, IdentityGenerator, KeyGenerator};
use crate::manifest;
use crate::model::{distinct_hosts, Identity, NodeSpec, OperationRecord};
use crate::report::FleetReport;
use crate::store::ConfigStore;
use crate::transport::RemoteTransport;

/// Collected `df -h` output, one section per host.
pub const DISK_USAGE_FILE: &str = "df_status.log";
/// Account address -> node, for every node that answered.
pub const ACCOUNTS_FILE: &str = "accounts.json";

/// Every operation the controller exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Install,
    Update,
    Start,
    Stop,
    Remove,
    Status,
    InstallRuntime,
    RestartRuntime,
    BlockNumber,
    Peers,
    CheckRuntime,
    DiskUsage,
    Accounts,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Install => "install",
            Operation::Update => "update",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Remove => "remove",
            Operation::Status => "status",
            Operation::InstallRuntime => "install-runtime",
            Operation::RestartRuntime => "restart-runtime",
            Operation::BlockNumber => "block-number",
            Operation::Peers => "peers",
            Operation::CheckRuntime => "check-runtime",
            Operation::DiskUsage => "disk-usage",
            Operation::Accounts => "accounts",
        }
    }

    /// Whether nodes are expected to be running once the operation is done.
    pub fn expects_running(&self) -> bool {
        matches!(self, Operation::Install | Operation::Update | Operation::Start)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one lifecycle operation.
#[derive(Debug, Clone)]
pub struct LifecycleOutcome {
    pub operation: Operation,
    pub report: FleetReport,
    /// Follow-up status query, when the operation runs one.
    pub status: Option<FleetReport>,
    /// Local file written from the results.
    pub output_file: Option<PathBuf>,
    /// Local write that failed after the remote phase.
    pub local_error: Option<String>,
}

impl LifecycleOutcome {
    fn new(operation: Operation, report: FleetReport) -> Self {
        Self {
            operation,
            report,
            status: None,
            output_file: None,
            local_error: None,
        }
    }

    fn with_status(mut self, status: Option<FleetReport>) -> Self {
        self.status = status;
        self
    }

    /// Keeps the report when a local write fails.
    fn record_local<T>(&mut self, result: Result<T, FleetError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(operation = %self.operation, error = %e, "local write failed after remote phase");
                self.local_error = Some(e.to_string());
                None
            }
        }
    }

    /// Full success: every action succeeded, where nodes should be running
    /// every status check did too, and no local write failed.
    pub fn succeeded(&self) -> bool {
        let status_ok = match (&self.status, self.operation.expects_running()) {
            (Some(status), true) => status.all_succeeded(),
            _ => true,
        };
        self.report.all_succeeded() && status_ok && self.local_error.is_none()
    }
}

/// Orchestrates the fleet stored in a [`ConfigStore`].
pub struct FleetController {
    cluster: Arc<ClusterConfig>,
    store: ConfigStore,
    transport: Arc<dyn RemoteTransport>,
    keys: Arc<dyn KeyGenerator>,
    cancel: CancelToken,
}

impl FleetController {
    pub fn new(
        cluster: ClusterConfig,
        store: ConfigStore,
        transport: Arc<dyn RemoteTransport>,
    ) -> Result<Self, FleetError> {
        cluster.validate()?;
        Ok(Self {
            cluster: Arc::new(cluster),
            store,
            transport,
            keys: Arc::new(DefaultKeyGenerator),
            cancel: CancelToken::new(),
        })
    }

    pub fn with_key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    fn context(&self) -> ActionContext {
        ActionContext {
            transport: Arc::clone(&self.transport),
            cluster: Arc::clone(&self.cluster),
        }
    }

    fn executor(&self, parallel: usize) -> FleetExecutor {
        FleetExecutor::new(parallel).with_cancel(self.cancel.clone())
    }

    fn identities(&self) -> IdentityGenerator {
        IdentityGenerator::new(&self.cluster.workdir, Arc::clone(&self.keys))
    }

    // ────────────────────────────────────────────────────────────────
    // ARTIFACTS
    // ────────────────────────────────────────────────────────────────

    /// Gives every node an identity, generating only where none exists.
    fn ensure_identities(&self, nodes: &mut [NodeSpec]) -> Result<(), FleetError> {
        let generator = self.identities();
        for node in nodes.iter_mut() {
            let identity = generator.ensure(node).map_err(|source| FleetError::Identity {
                node: node.name.clone(),
                source,
            })?;
            node.identity = Some(identity);
        }
        Ok(())
    }

    /// Builds the topology, writes cluster artifacts and stages every node.
    fn build_artifacts(&self, nodes: &[NodeSpec]) -> Result<Topology, FleetError> {
        let template = GenesisTemplate::load(&self.cluster.genesis_template)?;
        let topology = genesis::build(nodes, &template)?;
        topology.write_to(self.cluster.artifacts_dir())?;
        for node in nodes {
            self.stage(node, &topology)?;
        }
        Ok(topology)
    }

    /// Writes the files uploaded to one node into its staging directory.
    fn stage(&self, node: &NodeSpec, topology: &Topology) -> Result<(), FleetError> {
        let dir = self.cluster.node_dir(&node.name);
        let data = dir.join("data");
        fs::create_dir_all(&data).map_err(|e| FleetError::io(&data, e))?;

        let genesis_path = dir.join(GENESIS_FILE);
        fs::write(&genesis_path, topology.genesis.to_bytes()?)
            .map_err(|e| FleetError::io(&genesis_path, e))?;
        let peers_path = data.join(STATIC_NODES_FILE);
        fs::write(&peers_path, topology.static_peers_bytes()?)
            .map_err(|e| FleetError::io(&peers_path, e))?;

        manifest::render(node, topology, &self.cluster)?
            .save(&dir)
            .map_err(|source| FleetError::Manifest {
                node: node.name.clone(),
                source,
            })
    }

    /// Rebuilds topology artifacts locally from existing identities.
    /// No remote calls.
    pub fn generate_artifacts(&self) -> Result<Topology, FleetError> {
        let nodes = self.store.load()?;
        let topology = self.build_artifacts(&nodes)?;
        info!(
            dir = %self.cluster.artifacts_dir().display(),
            validators = topology.roster.len(),
            "artifacts generated"
        );
        Ok(topology)
    }

    // ────────────────────────────────────────────────────────────────
    // INSTALL / UPDATE
    // ────────────────────────────────────────────────────────────────

    /// Fresh deployment of the whole fleet. `tag` overrides each node's
    /// image tag.
    pub async fn install(&self, tag: Option<&str>) -> Result<LifecycleOutcome, FleetError> {
        let mut nodes = self.store.load()?;
        info!(nodes = nodes.len(), "install: ensuring identities");
        self.ensure_identities(&mut nodes)?;

        let mut targets = nodes.clone();
        if let Some(tag) = tag {
            for node in &mut targets {
                node.image_tag = tag.to_string();
            }
        }

        info!("install: building topology");
        self.build_artifacts(&targets)?;

        let ctx = self.context();
        let report = self
            .executor(self.cluster.transfer_parallel)
            .run_all(Operation::Install.as_str(), &targets, move |node| {
                let ctx = ctx.clone();
                async move { actions::deploy(&ctx, &node).await }
            })
            .await;

        let status = self.follow_up_status(&targets).await;
        let persisted = self.persist(&mut nodes, Operation::Install, &report, tag);
        let mut outcome = LifecycleOutcome::new(Operation::Install, report).with_status(status);
        outcome.record_local(persisted);
        Ok(outcome)
    }

    /// Moves every node to image `tag`, keeping chain data.
    pub async fn update(&self, tag: &str) -> Result<LifecycleOutcome, FleetError> {
        let mut nodes = self.store.load()?;
        let ctx = self.context();
        let target_tag = tag.to_string();

        let report = self
            .executor(self.cluster.transfer_parallel)
            .run_all(Operation::Update.as_str(), &nodes, move |node| {
                let ctx = ctx.clone();
                let tag = target_tag.clone();
                async move { actions::update(&ctx, &node, &tag).await }
            })
            .await;

        let status = self.follow_up_status(&nodes).await;
        let persisted = self.persist(&mut nodes, Operation::Update, &report, Some(tag));
        let mut outcome = LifecycleOutcome::new(Operation::Update, report).with_status(status);
        outcome.record_local(persisted);
        Ok(outcome)
    }

    /// Writes the fleet back with per-node outcomes.
    fn persist(
        &self,
        nodes: &mut [NodeSpec],
        operation: Operation,
        report: &FleetReport,
        tag: Option<&str>,
    ) -> Result<(), FleetError> {
        for node in nodes.iter_mut() {
            let Some(result) = report.get(&node.name) else {
                continue;
            };
            if result.succeeded {
                if let Some(tag) = tag {
                    node.image_tag = tag.to_string();
                }
            }
            node.last_operation = Some(OperationRecord::now(
                operation.as_str(),
                result.succeeded,
                result.error.clone(),
            ));
        }
        self.store.save(nodes)?;
        info!(path = %self.store.path().display(), "fleet persisted");
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────
    // START / STOP / REMOVE / STATUS
    // ────────────────────────────────────────────────────────────────

    pub async fn start(&self) -> Result<LifecycleOutcome, FleetError> {
        self.compose(Operation::Start, "start").await
    }

    pub async fn stop(&self) -> Result<LifecycleOutcome, FleetError> {
        self.compose(Operation::Stop, "stop").await
    }

    async fn compose(&self, operation: Operation, verb: &'static str) -> Result<LifecycleOutcome, FleetError> {
        let nodes = self.store.load()?;
        let ctx = self.context();
        let report = self
            .executor(self.cluster.parallelism(nodes.len()))
            .run_all(operation.as_str(), &nodes, move |node| {
                let ctx = ctx.clone();
                async move { actions::compose(&ctx, &node, verb).await }
            })
            .await;
        let status = self.follow_up_status(&nodes).await;
        Ok(LifecycleOutcome::new(operation, report).with_status(status))
    }

    pub async fn remove(&self) -> Result<LifecycleOutcome, FleetError> {
        let nodes = self.store.load()?;
        let ctx = self.context();
        let report = self
            .executor(self.cluster.parallelism(nodes.len()))
            .run_all(Operation::Remove.as_str(), &nodes, move |node| {
                let ctx = ctx.clone();
                async move { actions::remove(&ctx, &node).await }
            })
            .await;
        Ok(LifecycleOutcome::new(Operation::Remove, report))
    }

    pub async fn status(&self) -> Result<LifecycleOutcome, FleetError> {
        let nodes = self.store.load()?;
        let report = self.query_status(&nodes).await;
        Ok(LifecycleOutcome::new(Operation::Status, report))
    }

    async fn query_status(&self, nodes: &[NodeSpec]) -> FleetReport {
        let ctx = self.context();
        self.executor(self.cluster.parallelism(nodes.len()))
            .run_all(Operation::Status.as_str(), nodes, move |node| {
                let ctx = ctx.clone();
                async move { actions::status(&ctx, &node).await }
            })
            .await
    }

    async fn follow_up_status(&self, nodes: &[NodeSpec]) -> Option<FleetReport> {
        if self.cancel.is_cancelled() {
            warn!("cancelled, skipping status check");
            return None;
        }
        Some(self.query_status(nodes).await)
    }

    // ────────────────────────────────────────────────────────────────
    // RUNTIME / QUERIES
    // ────────────────────────────────────────────────────────────────

    /// Installs the container runtime once per distinct host.
    pub async fn install_runtime(&self) -> Result<LifecycleOutcome, FleetError> {
        let hosts = distinct_hosts(&self.store.load()?);
        let ctx = self.context();
        let report = self
            .executor(self.cluster.parallelism(hosts.len()))
            .run_all(Operation::InstallRuntime.as_str(), &hosts, move |node| {
                let ctx = ctx.clone();
                async move { actions::install_runtime(&ctx, &node).await }
            })
            .await;
        Ok(LifecycleOutcome::new(Operation::InstallRuntime, report))
    }

    pub async fn restart_runtime(&self) -> Result<LifecycleOutcome, FleetError> {
        let hosts = distinct_hosts(&self.store.load()?);
        let ctx = self.context();
        let report = self
            .executor(self.cluster.parallelism(hosts.len()))
            .run_all(Operation::RestartRuntime.as_str(), &hosts, move |node| {
                let ctx = ctx.clone();
                async move { actions::restart_runtime(&ctx, &node).await }
            })
            .await;
        Ok(LifecycleOutcome::new(Operation::RestartRuntime, report))
    }

    pub async fn block_number(&self) -> Result<LifecycleOutcome, FleetError> {
        let nodes = self.store.load()?;
        let ctx = self.context();
        let report = self
            .executor(self.cluster.parallelism(nodes.len()))
            .run_all(Operation::BlockNumber.as_str(), &nodes, move |node| {
                let ctx = ctx.clone();
                async move { actions::block_number(&ctx, &node).await }
            })
            .await;
        Ok(LifecycleOutcome::new(Operation::BlockNumber, report))
    }

    pub async fn peers(&self) -> Result<LifecycleOutcome, FleetError> {
        let nodes = self.store.load()?;
        let ctx = self.context();
        let report = self
            .executor(self.cluster.parallelism(nodes.len()))
            .run_all(Operation::Peers.as_str(), &nodes, move |node| {
                let ctx = ctx.clone();
                async move { actions::peer_count(&ctx, &node).await }
            })
            .await;
        Ok(LifecycleOutcome::new(Operation::Peers, report))
    }

    /// Runtime and compose versions once per distinct host.
    pub async fn check_runtime(&self) -> Result<LifecycleOutcome, FleetError> {
        let hosts = distinct_hosts(&self.store.load()?);
        let ctx = self.context();
        let report = self
            .executor(self.cluster.parallelism(hosts.len()))
            .run_all(Operation::CheckRuntime.as_str(), &hosts, move |node| {
                let ctx = ctx.clone();
                async move { actions::runtime_versions(&ctx, &node).await }
            })
            .await;
        Ok(LifecycleOutcome::new(Operation::CheckRuntime, report))
    }

    /// `df -h` once per distinct host, collected into [`DISK_USAGE_FILE`].
    pub async fn disk_usage(&self) -> Result<LifecycleOutcome, FleetError> {
        let hosts = distinct_hosts(&self.store.load()?);
        let ctx = self.context();
        let report = self
            .executor(self.cluster.parallelism(hosts.len()))
            .run_all(Operation::DiskUsage.as_str(), &hosts, move |node| {
                let ctx = ctx.clone();
                async move { actions::disk_usage(&ctx, &node).await }
            })
            .await;

        let mut outcome = LifecycleOutcome::new(Operation::DiskUsage, report);
        let written = self.write_output(DISK_USAGE_FILE, disk_usage_log(&outcome.report).as_bytes());
        outcome.output_file = outcome.record_local(written);
        Ok(outcome)
    }

    /// First account of every node, collected into [`ACCOUNTS_FILE`].
    pub async fn accounts(&self) -> Result<LifecycleOutcome, FleetError> {
        let nodes = self.store.load()?;
        let ctx = self.context();
        let report = self
            .executor(self.cluster.parallelism(nodes.len()))
            .run_all(Operation::Accounts.as_str(), &nodes, move |node| {
                let ctx = ctx.clone();
                async move { actions::account(&ctx, &node).await }
            })
            .await;

        let mut outcome = LifecycleOutcome::new(Operation::Accounts, report);
        let path = self.cluster.artifacts_dir().join(ACCOUNTS_FILE);
        let written = serde_json::to_vec_pretty(&accounts_by_address(&nodes, &outcome.report))
            .map_err(|e| FleetError::json(&path, e))
            .and_then(|bytes| self.write_output(ACCOUNTS_FILE, &bytes));
        outcome.output_file = outcome.record_local(written);
        Ok(outcome)
    }

    fn write_output(&self, file: &str, bytes: &[u8]) -> Result<PathBuf, FleetError> {
        let dir = self.cluster.artifacts_dir();
        fs::create_dir_all(dir).map_err(|e| FleetError::io(dir, e))?;
        let path = dir.join(file);
        fs::write(&path, bytes).map_err(|e| FleetError::io(&path, e))?;
        info!(path = %path.display(), "results written");
        Ok(path)
    }

    // ────────────────────────────────────────────────────────────────
    // IDENTITY
    // ────────────────────────────────────────────────────────────────

    /// Stored nodes with their identities, if any.
    pub fn show_identities(&self) -> Result<Vec<NodeSpec>, FleetError> {
        self.store.load()
    }

    /// Rotates one node's keys and persists the new identity.
    ///
    /// The genesis document must be rebuilt and redeployed afterwards.
    pub fn regenerate_identity(&self, name: &str) -> Result<Identity, FleetError> {
        let mut nodes = self.store.load()?;
        let node = nodes
            .iter_mut()
            .find(|n| n.name == name)
            .ok_or_else(|| FleetError::UnknownNode(name.to_string()))?;

        let identity = self
            .identities()
            .regenerate(node)
            .map_err(|source| FleetError::Identity {
                node: name.to_string(),
                source,
            })?;
        node.identity = Some(identity.clone());
        self.store.save(&nodes)?;
        warn!(node = name, "identity regenerated, genesis must be rebuilt");
        Ok(identity)
    }
}

fn disk_usage_log(report: &FleetReport) -> String {
    let mut out = String::new();
    for result in report.iter().filter(|r| r.succeeded) {
        out.push_str(&"-".repeat(65));
        out.push('\n');
        out.push_str(&format!("{}:\n{}\n", result.host, result.output));
    }
    out
}

fn accounts_by_address(nodes: &[NodeSpec], report: &FleetReport) -> Value {
    let mut map = Map::new();
    for node in nodes {
        if let Some(result) = report.get(&node.name).filter(|r| r.succeeded) {
            map.insert(
                result.output.clone(),
                json!({
                    "name": node.name,
                    "host": node.host,
                    "rpc_port": node.rpc_port,
                    "ws_port": node.ws_port,
                }),
            );
        }
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::four_node_fleet;
    use crate::transport::{CommandOutput, MockTransport};
    use std::path::Path;

    fn setup(dir: &Path, mock: &MockTransport) -> FleetController {
        let template = dir.join("genesis-template.json");
        fs::write(&template, br#"{"config":{"cbft":{}}}"#).expect("template");
        let store = ConfigStore::new(dir.join("fleet.json"));
        let mut nodes = four_node_fleet();
        for n in &mut nodes {
            n.identity = None;
        }
        store.save(&nodes).expect("save");

        let cluster = ClusterConfig {
            workdir: dir.join("deploy"),
            genesis_template: template,
            image: "img".into(),
            ..ClusterConfig::default()
        };
        FleetController::new(cluster, store, Arc::new(mock.clone())).expect("controller")
    }

    #[test]
    fn operation_names() {
        assert_eq!(Operation::InstallRuntime.to_string(), "install-runtime");
        assert!(Operation::Start.expects_running());
        assert!(!Operation::Stop.expects_running());
    }

    #[tokio::test]
    async fn install_persists_identities_and_tags() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::healthy();
        let ctl = setup(tmp.path(), &mock);

        let outcome = ctl.install(Some("v1")).await.expect("install");
        assert!(outcome.succeeded(), "{}", outcome.report.to_table());

        let stored = ctl.store().load().expect("load");
        assert!(stored.iter().all(|n| n.identity.is_some()));
        assert!(stored.iter().all(|n| n.image_tag == "v1"));
        assert!(stored
            .iter()
            .all(|n| n.last_operation.as_ref().map(|r| r.succeeded) == Some(true)));
        assert!(tmp.path().join("deploy").join("genesis.json").is_file());
        assert!(tmp.path().join("deploy").join("val-1").join("docker-compose.json").is_file());
    }

    #[tokio::test]
    async fn failed_node_keeps_old_tag() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::healthy();
        mock.fail_connect("10.0.0.2");
        let ctl = setup(tmp.path(), &mock);

        let outcome = ctl.install(Some("v1")).await.expect("install");
        assert!(!outcome.succeeded());
        assert_eq!(outcome.report.failed().len(), 1);

        let stored = ctl.store().load().expect("load");
        let val2 = stored.iter().find(|n| n.name == "val-2").expect("val-2");
        assert_eq!(val2.image_tag, "latest");
        assert!(val2.identity.is_some(), "identity persisted regardless of outcome");
        let record = val2.last_operation.as_ref().expect("record");
        assert!(!record.succeeded);
        assert!(record.error.as_deref().unwrap_or("").contains("connection"));
    }

    #[tokio::test]
    async fn missing_template_aborts_before_remote_calls() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::healthy();
        let ctl = setup(tmp.path(), &mock);
        fs::remove_file(tmp.path().join("genesis-template.json")).expect("rm");

        assert!(matches!(ctl.install(None).await, Err(FleetError::Io { .. })));
        assert!(mock.calls().is_empty());
        let stored = ctl.store().load().expect("load");
        assert!(stored.iter().all(|n| n.last_operation.is_none()));
    }

    #[tokio::test]
    async fn stop_does_not_require_running_status() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::new();
        mock.respond("docker inspect", CommandOutput::ok(&["exited"]));
        let ctl = setup(tmp.path(), &mock);

        let outcome = ctl.stop().await.expect("stop");
        assert!(outcome.succeeded());
        let status = outcome.status.expect("status ran");
        assert!(!status.all_succeeded());
    }

    #[tokio::test]
    async fn runtime_operations_run_once_per_host() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::new();
        let ctl = setup(tmp.path(), &mock);

        let store = ctl.store().clone();
        let mut nodes = store.load().expect("load");
        nodes[1].host = nodes[0].host.clone();
        nodes[1].p2p_port += 1;
        nodes[1].rpc_port += 1;
        nodes[1].ws_port += 1;
        store.save(&nodes).expect("save");

        let outcome = ctl.restart_runtime().await.expect("restart");
        assert_eq!(outcome.report.len(), 3);
    }

    #[tokio::test]
    async fn fleet_write_failure_keeps_report() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::healthy();
        let ctl = setup(tmp.path(), &mock);
        // the store's temp file path is taken, so the final save fails
        fs::create_dir(tmp.path().join("fleet.json.tmp")).expect("block temp file");

        let outcome = ctl.install(Some("v1")).await.expect("remote phase reported");
        assert_eq!(outcome.report.len(), 4);
        assert!(outcome.report.all_succeeded());
        let err = outcome.local_error.as_deref().expect("local error");
        assert!(err.contains("fleet.json"), "{}", err);
        assert!(!outcome.succeeded());
        assert!(!mock.calls().is_empty());
    }

    #[tokio::test]
    async fn disk_usage_collects_one_section_per_host() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::new();
        mock.respond("df -h", CommandOutput::ok(&["Filesystem Size Use%", "/dev/sda1 100G 42%"]));
        mock.fail_connect("10.0.0.3");
        let ctl = setup(tmp.path(), &mock);

        let outcome = ctl.disk_usage().await.expect("df");
        assert_eq!(outcome.report.len(), 4);
        assert_eq!(outcome.report.succeeded_count(), 3);
        let path = outcome.output_file.expect("log written");
        assert_eq!(path, tmp.path().join("deploy").join(DISK_USAGE_FILE));
        let log = fs::read_to_string(path).expect("read");
        assert!(log.contains("10.0.0.1:\nFilesystem Size Use%\n/dev/sda1 100G 42%"));
        assert!(!log.contains("10.0.0.3"));
        assert_eq!(log.matches("10.0.0.").count(), 3);
    }

    #[tokio::test]
    async fn accounts_are_keyed_by_address() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::new();
        mock.respond("accounts", CommandOutput::ok(&[r#"["0xaa01"]"#]));
        mock.respond_on("10.0.0.2", "accounts", CommandOutput::ok(&[r#"["0xbb02"]"#]));
        mock.respond_on("10.0.0.4", "accounts", CommandOutput::ok(&["[]"]));
        let ctl = setup(tmp.path(), &mock);

        let outcome = ctl.accounts().await.expect("accounts");
        assert_eq!(outcome.report.failed().len(), 1);
        assert_eq!(outcome.report.failed()[0].node, "boot");

        let path = outcome.output_file.expect("accounts written");
        let map: Value = serde_json::from_slice(&fs::read(path).expect("read")).expect("json");
        assert_eq!(map["0xbb02"]["name"], "val-2");
        assert_eq!(map["0xbb02"]["rpc_port"], 6789);
        // val-1 and obs-1 report the same address, the later node wins
        assert_eq!(map["0xaa01"]["name"], "obs-1");
        assert_eq!(map.as_object().map(Map::len), Some(2));
    }

    #[tokio::test]
    async fn check_runtime_runs_once_per_host() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mock = MockTransport::new();
        mock.respond("docker --version", CommandOutput::ok(&["Docker version 24.0.7"]));
        let ctl = setup(tmp.path(), &mock);

        let outcome = ctl.check_runtime().await.expect("check");
        assert!(outcome.succeeded());
        assert!(outcome.output_file.is_none());
        assert_eq!(
            outcome.report.get("val-1").map(|r| r.output.as_str()),
            Some("Docker version 24.0.7 / ")
        );
    }

    #[tokio::test]
    async fn regenerate_unknown_node_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ctl = setup(tmp.path(), &MockTransport::new());
        assert!(matches!(
            ctl.regenerate_identity("ghost"),
            Err(FleetError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn generate_artifacts_requires_identities() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let ctl = setup(tmp.path(), &MockTransport::new());
        assert!(matches!(
            ctl.generate_artifacts(),
            Err(FleetError::IncompleteIdentity(_))
        ));
    }
}
