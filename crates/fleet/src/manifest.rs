//! # Deployment Manifest
//!
//! A compose-compatible JSON document per node, written as
//! `docker-compose.json` in the node's local directory and uploaded into
//! its `deploy_path`.
//!
//! ```text
//! services:
//!   node:     the ledger client (image, ports, bootnodes, first-run flags)
//!   staking:  optional self-staking helper, validators with staking only
//! ```
//!
//! `INIT` and `NEW_ACCOUNT` are first-run flags. [`update`] strips them so a
//! redeployed node keeps its chain data and keystore.

use std::fs;
use std::io;
use std::path::Path;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::config::ClusterConfig;
use crate::error::FleetError;
use crate::genesis::Topology;
use crate::model::NodeSpec;

pub const MANIFEST_FILE: &str = "docker-compose.json";
pub const NODE_SERVICE: &str = "node";
pub const STAKING_SERVICE: &str = "staking";

const COMPOSE_VERSION: &str = "3.7";
const CONTAINER_DATA_DIR: &str = "/data/node";
const FIRST_RUN_FLAGS: [&str; 2] = ["INIT", "NEW_ACCOUNT"];
const NODE_APIS: &str = "eth,debug,txpool,admin,net";

/// Manifest load/update failures.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// No prior manifest exists.
    #[error("manifest not found at {0}")]
    Missing(String),

    #[error("manifest I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Valid JSON without the expected structure.
    #[error("malformed manifest: {0}")]
    Malformed(String),
}

/// Rendered deployment manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest(Value);

impl Manifest {
    pub fn from_value(value: Value) -> Result<Self, ManifestError> {
        value
            .get("services")
            .and_then(|s| s.get(NODE_SERVICE))
            .filter(|s| s.is_object())
            .ok_or_else(|| ManifestError::Malformed("missing services.node".to_string()))?;
        Ok(Self(value))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Reads `<dir>/docker-compose.json`.
    pub fn load(dir: &Path) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ManifestError::Missing(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_value(serde_json::from_slice(&raw)?)
    }

    /// Writes `<dir>/docker-compose.json`, creating `dir` if needed.
    pub fn save(&self, dir: &Path) -> Result<(), ManifestError> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(&self.0)?)?;
        Ok(())
    }

    fn node_service(&self) -> Option<&Map<String, Value>> {
        self.0.get("services")?.get(NODE_SERVICE)?.as_object()
    }

    pub fn image(&self) -> Option<&str> {
        self.node_service()?.get("image")?.as_str()
    }

    pub fn env(&self, key: &str) -> Option<&Value> {
        self.node_service()?.get("environment")?.get(key)
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.0
            .get("services")
            .and_then(|s| s.get(name))
            .is_some()
    }
}

/// Renders the manifest for one node. Pure.
pub fn render(node: &NodeSpec, topology: &Topology, cluster: &ClusterConfig) -> Result<Manifest, FleetError> {
    let identity = node
        .identity
        .as_ref()
        .ok_or_else(|| FleetError::IncompleteIdentity(node.name.clone()))?;

    let mut env = json!({
        "ENABLE_DEBUG": "true",
        "ENABLE_WS": "true",
        "WSAPI": NODE_APIS,
        "ENABLE_RPC": "true",
        "RPCAPI": NODE_APIS,
        "VERBOSITY": cluster.verbosity,
        "INIT": "true",
        "NEW_ACCOUNT": "true",
        "ENABLE_DISCOVER": "true",
        "P2PPORT": node.p2p_port,
        "WSPORT": node.ws_port,
        "RPCPORT": node.rpc_port,
        "MAXPEERS": cluster.max_peers,
        "HOST": "0.0.0.0",
        "BOOTNODES": topology.bootnode_address,
    });
    if node.role.is_bootnode() {
        env["MAXPEERS"] = json!(cluster.bootnode_max_peers);
        env["ENABLE_LIGHT_SRV"] = json!("true");
    }

    let mut node_service = json!({
        "image": format!("{}:{}", cluster.image, node.image_tag),
        "container_name": node.container_name(),
        "volumes": [format!("{}:{}", node.deploy_path, CONTAINER_DATA_DIR)],
        "network_mode": "host",
        "environment": env,
    });

    let mut services = Map::new();
    if let Some(staking) = node.role.staking() {
        node_service["depends_on"] = json!({ STAKING_SERVICE: { "condition": "service_started" } });
        services.insert(
            STAKING_SERVICE.to_string(),
            json!({
                "image": format!("{}:{}", cluster.image, staking.image_tag),
                "container_name": format!("{}-staking", node.name),
                "network_mode": "host",
                "environment": {
                    "USE_CMD": "batch_staking",
                    "URL": format!("ws://127.0.0.1:{}", node.ws_port),
                    "NODENAME": node.name,
                    "BLSKEY": identity.consensus_private_key,
                    "NODEKEY": identity.network_private_key,
                    "PRIVATE_KEY": staking.private_key,
                    "PROGRAM_VERSION": staking.program_version,
                    "CHAINID": staking.chain_id,
                },
            }),
        );
    }
    services.insert(NODE_SERVICE.to_string(), node_service);

    Ok(Manifest(json!({
        "version": COMPOSE_VERSION,
        "services": services,
    })))
}

/// Update variant of a prior manifest.
///
/// Removes the first-run flags, the staking dependency (by key; a list
/// form is tolerated) and the staking service, and points the node service
/// at `<image>:<tag>`. Every other field is carried over unchanged.
pub fn update(prior: &Manifest, image: &str, tag: &str) -> Result<Manifest, ManifestError> {
    let mut doc = prior.0.clone();
    let services = doc
        .get_mut("services")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ManifestError::Malformed("missing services".to_string()))?;

    services.remove(STAKING_SERVICE);

    let node = services
        .get_mut(NODE_SERVICE)
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ManifestError::Malformed("missing services.node".to_string()))?;

    if let Some(env) = node.get_mut("environment").and_then(Value::as_object_mut) {
        for flag in FIRST_RUN_FLAGS {
            env.remove(flag);
        }
    }

    let drop_depends = match node.get_mut("depends_on") {
        Some(Value::Object(map)) => {
            map.remove(STAKING_SERVICE);
            map.is_empty()
        }
        Some(Value::Array(list)) => {
            list.retain(|v| v.as_str() != Some(STAKING_SERVICE));
            list.is_empty()
        }
        _ => false,
    };
    if drop_depends {
        node.remove("depends_on");
    }

    node.insert("image".to_string(), json!(format!("{}:{}", image, tag)));
    Ok(Manifest(doc))
}
