//! # Cluster Configuration
//!
//! Cluster-wide parameters, immutable for the duration of an operation and
//! passed explicitly into the controller.
//!
//! Sources, lowest priority first:
//!
//! 1. built-in defaults
//! 2. environment (`FLEET_*`), optionally loaded from a dotenv file
//! 3. CLI flags (applied by the agent)
//!
//! ## Environment Variables
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `FLEET_WORKDIR` | `workdir` | `./deploy` |
//! | `FLEET_GENESIS_TEMPLATE` | `genesis_template` | `./tmpl/genesis.json` |
//! | `FLEET_IMAGE` | `image` | `ledger/node` |
//! | `FLEET_MAX_PARALLEL` | `max_parallel` | fleet size |
//! | `FLEET_TRANSFER_PARALLEL` | `transfer_parallel` | `10` |
//! | `FLEET_COMMAND_TIMEOUT_SECS` | `command_timeout_secs` | `300` |
//! | `FLEET_CLIENT_BINARY` | `client_binary` | `geth` |
//! | `FLEET_CHAIN_NAMESPACE` | `chain_namespace` | `eth` |
//! | `FLEET_VERBOSITY` | `verbosity` | `1` |
//! | `FLEET_MAX_PEERS` | `max_peers` | `50` |
//! | `FLEET_BOOTNODE_MAX_PEERS` | `bootnode_max_peers` | `100` |
//! | `FLEET_RUNTIME_INSTALL_URL` | `runtime_install_url` | `https://get.docker.com` |

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::FleetError;

/// Env var naming a dotenv file to load.
pub const ENV_FILE_VAR: &str = "FLEET_ENV_FILE";
const DEFAULT_ENV_FILE: &str = ".env";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Local directory for per-node identities, manifests and artifacts.
    pub workdir: PathBuf,
    pub genesis_template: PathBuf,
    /// Image repository; nodes add their own tag.
    pub image: String,
    /// Parallelism of ordinary operations. `None` means the fleet size.
    pub max_parallel: Option<usize>,
    /// Parallelism of operations that upload artifacts.
    pub transfer_parallel: usize,
    pub command_timeout_secs: u64,
    /// Client binary inside the container, used by attach queries.
    pub client_binary: String,
    /// RPC namespace of block queries (`<ns>.blockNumber`).
    pub chain_namespace: String,
    pub verbosity: u8,
    pub max_peers: u32,
    pub bootnode_max_peers: u32,
    /// Installer script fetched by `install-runtime`.
    pub runtime_install_url: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("./deploy"),
            genesis_template: PathBuf::from("./tmpl/genesis.json"),
            image: "ledger/node".to_string(),
            max_parallel: None,
            transfer_parallel: 10,
            command_timeout_secs: 300,
            client_binary: "geth".to_string(),
            chain_namespace: "eth".to_string(),
            verbosity: 1,
            max_peers: 50,
            bootnode_max_peers: 100,
            runtime_install_url: "https://get.docker.com".to_string(),
        }
    }
}

impl ClusterConfig {
    /// Reads `FLEET_*` variables from the process environment.
    pub fn from_env() -> Result<Self, FleetError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup over defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, FleetError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(v) = get("FLEET_WORKDIR") {
            cfg.workdir = PathBuf::from(v);
        }
        if let Some(v) = get("FLEET_GENESIS_TEMPLATE") {
            cfg.genesis_template = PathBuf::from(v);
        }
        if let Some(v) = get("FLEET_IMAGE") {
            cfg.image = v;
        }
        if let Some(v) = get("FLEET_MAX_PARALLEL") {
            cfg.max_parallel = Some(parse("FLEET_MAX_PARALLEL", &v)?);
        }
        if let Some(v) = get("FLEET_TRANSFER_PARALLEL") {
            cfg.transfer_parallel = parse("FLEET_TRANSFER_PARALLEL", &v)?;
        }
        if let Some(v) = get("FLEET_COMMAND_TIMEOUT_SECS") {
            cfg.command_timeout_secs = parse("FLEET_COMMAND_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("FLEET_CLIENT_BINARY") {
            cfg.client_binary = v;
        }
        if let Some(v) = get("FLEET_CHAIN_NAMESPACE") {
            cfg.chain_namespace = v;
        }
        if let Some(v) = get("FLEET_VERBOSITY") {
            cfg.verbosity = parse("FLEET_VERBOSITY", &v)?;
        }
        if let Some(v) = get("FLEET_MAX_PEERS") {
            cfg.max_peers = parse("FLEET_MAX_PEERS", &v)?;
        }
        if let Some(v) = get("FLEET_BOOTNODE_MAX_PEERS") {
            cfg.bootnode_max_peers = parse("FLEET_BOOTNODE_MAX_PEERS", &v)?;
        }
        if let Some(v) = get("FLEET_RUNTIME_INSTALL_URL") {
            cfg.runtime_install_url = v;
        }

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.image.trim().is_empty() {
            return Err(FleetError::Config("image must not be empty".to_string()));
        }
        if self.image.contains(char::is_whitespace) {
            return Err(FleetError::Config(format!("image '{}' contains whitespace", self.image)));
        }
        if self.max_parallel == Some(0) {
            return Err(FleetError::Config("max_parallel must be at least 1".to_string()));
        }
        if self.transfer_parallel == 0 {
            return Err(FleetError::Config("transfer_parallel must be at least 1".to_string()));
        }
        if self.command_timeout_secs == 0 {
            return Err(FleetError::Config("command_timeout_secs must be at least 1".to_string()));
        }
        if self.max_peers == 0 || self.bootnode_max_peers == 0 {
            return Err(FleetError::Config("peer limits must be at least 1".to_string()));
        }
        if self.client_binary.trim().is_empty() || self.chain_namespace.trim().is_empty() {
            return Err(FleetError::Config(
                "client_binary and chain_namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Parallelism for a fleet of `fleet_size` nodes.
    pub fn parallelism(&self, fleet_size: usize) -> usize {
        self.max_parallel.unwrap_or(fleet_size).max(1)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Directory holding cluster-wide artifacts (genesis, peer lists).
    pub fn artifacts_dir(&self) -> &Path {
        &self.workdir
    }

    /// Local staging directory of one node.
    pub fn node_dir(&self, node_name: &str) -> PathBuf {
        self.workdir.join(node_name)
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, FleetError> {
    raw.trim()
        .parse()
        .map_err(|_| FleetError::Config(format!("{} has invalid value '{}'", key, raw)))
}

/// Loads a dotenv file into the process environment.
///
/// Path comes from `FLEET_ENV_FILE`, falling back to `.env`. A missing file
/// is not an error. Returns the loaded path, or `None` when nothing was
/// loaded. Must run before the tokio runtime spawns worker threads.
pub fn load_env_file() -> Result<Option<PathBuf>, FleetError> {
    let file = env::var(ENV_FILE_VAR).unwrap_or_else(|_| DEFAULT_ENV_FILE.to_string());
    match dotenvy::from_filename(&file) {
        Ok(path) => Ok(Some(path)),
        Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FleetError::Config(format!("failed to load {}: {}", file, e))),
    }
}
