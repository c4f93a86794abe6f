//! # Genesis and Topology Builder
//!
//! Derives every cluster-wide artifact from the node identities:
//!
//! ```text
//! nodes + template ──► Topology
//!                        ├── genesis          → genesis.json
//!                        ├── static_peers     → static-nodes.json
//!                        ├── roster           → validator-nodes.json
//!                        └── bootnode_address   (BOOTNODES in every manifest)
//! ```
//!
//! ## Invariants
//!
//! - Validators appear in configuration order; the roster index of a
//!   validator is its position in the initial validator set.
//! - Building twice from the same input yields byte-identical artifacts.
//!   `serde_json::Value` objects are `BTreeMap`-backed, so key order is
//!   stable.
//! - On error nothing is returned and nothing is written.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::FleetError;
use crate::model::{find_bootnode, NodeSpec};

pub const GENESIS_FILE: &str = "genesis.json";
pub const STATIC_NODES_FILE: &str = "static-nodes.json";
pub const VALIDATOR_NODES_FILE: &str = "validator-nodes.json";

/// JSON path of the initial validator list inside the template.
const INITIAL_NODES_PATH: [&str; 3] = ["config", "cbft", "initialNodes"];

// ════════════════════════════════════════════════════════════════════════════════
// TEMPLATE
// ════════════════════════════════════════════════════════════════════════════════

/// Chain parameters every genesis document inherits.
#[derive(Debug, Clone, PartialEq)]
pub struct GenesisTemplate(Value);

impl GenesisTemplate {
    pub fn load(path: &Path) -> Result<Self, FleetError> {
        let raw = fs::read(path).map_err(|e| FleetError::io(path, e))?;
        let value: Value = serde_json::from_slice(&raw).map_err(|e| FleetError::json(path, e))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, FleetError> {
        if !value.is_object() {
            return Err(FleetError::Template(
                "genesis template must be a JSON object".to_string(),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// OUTPUT TYPES
// ════════════════════════════════════════════════════════════════════════════════

/// One member of the initial validator set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorEntry {
    pub consensus_public_key: String,
    /// Enode URL for static validators, otherwise the network public key.
    pub network_identity: String,
}

/// Genesis document: the template with the validator set filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct GenesisDocument {
    pub initial_validator_set: Vec<ValidatorEntry>,
    pub document: Value,
}

impl GenesisDocument {
    /// Deterministic pretty-printed bytes, identical on every host.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FleetError> {
        serde_json::to_vec_pretty(&self.document)
            .map_err(|e| FleetError::Template(format!("serialize genesis: {}", e)))
    }
}

/// Roster row written to `validator-nodes.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub index: usize,
    pub name: String,
    #[serde(rename = "nodeID")]
    pub node_id: String,
    /// `host:rpc_port`
    pub host: String,
    #[serde(rename = "blsPubKey")]
    pub consensus_public_key: String,
    pub staking: bool,
}

#[derive(Serialize)]
struct RosterFile<'a> {
    #[serde(rename = "validateNodes")]
    validate_nodes: &'a [RosterEntry],
}

/// Everything derived from the fleet's identities.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub genesis: GenesisDocument,
    pub static_peers: Vec<String>,
    pub roster: Vec<RosterEntry>,
    pub bootnode_address: String,
}

impl Topology {
    pub fn static_peers_bytes(&self) -> Result<Vec<u8>, FleetError> {
        serde_json::to_vec_pretty(&self.static_peers)
            .map_err(|e| FleetError::Template(format!("serialize static peers: {}", e)))
    }

    pub fn roster_bytes(&self) -> Result<Vec<u8>, FleetError> {
        serde_json::to_vec_pretty(&RosterFile {
            validate_nodes: &self.roster,
        })
        .map_err(|e| FleetError::Template(format!("serialize roster: {}", e)))
    }

    /// Writes the three artifact files into `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<(), FleetError> {
        fs::create_dir_all(dir).map_err(|e| FleetError::io(dir, e))?;
        for (name, bytes) in [
            (GENESIS_FILE, self.genesis.to_bytes()?),
            (STATIC_NODES_FILE, self.static_peers_bytes()?),
            (VALIDATOR_NODES_FILE, self.roster_bytes()?),
        ] {
            let path = dir.join(name);
            fs::write(&path, bytes).map_err(|e| FleetError::io(&path, e))?;
        }
        debug!(dir = %dir.display(), "topology artifacts written");
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// BUILD
// ════════════════════════════════════════════════════════════════════════════════

/// Builds the topology for `nodes`.
///
/// ## Errors
///
/// - [`FleetError::MissingBootnode`] when no node is a bootnode
/// - [`FleetError::IncompleteIdentity`] naming the first node without identity
/// - [`FleetError::Template`] when `config.cbft` is not an object
pub fn build(nodes: &[NodeSpec], template: &GenesisTemplate) -> Result<Topology, FleetError> {
    let bootnode = find_bootnode(nodes).ok_or(FleetError::MissingBootnode)?;

    if let Some(missing) = nodes.iter().find(|n| n.identity.is_none()) {
        return Err(FleetError::IncompleteIdentity(missing.name.clone()));
    }
    let bootnode_address = bootnode
        .enode()
        .ok_or_else(|| FleetError::IncompleteIdentity(bootnode.name.clone()))?;

    let mut validator_set = Vec::new();
    let mut roster = Vec::new();
    let mut static_peers = Vec::new();

    for node in nodes {
        let (identity, enode) = match (&node.identity, node.enode()) {
            (Some(identity), Some(enode)) => (identity, enode),
            _ => return Err(FleetError::IncompleteIdentity(node.name.clone())),
        };

        if node.is_static() {
            static_peers.push(enode.clone());
        }

        if node.role.is_validator() {
            let network_identity = if node.is_static() {
                enode
            } else {
                identity.network_public_key.clone()
            };
            roster.push(RosterEntry {
                index: validator_set.len(),
                name: node.name.clone(),
                node_id: identity.network_public_key.clone(),
                host: format!("{}:{}", node.host, node.rpc_port),
                consensus_public_key: identity.consensus_public_key.clone(),
                staking: node.role.staking().is_some(),
            });
            validator_set.push(ValidatorEntry {
                consensus_public_key: identity.consensus_public_key.clone(),
                network_identity,
            });
        }
    }

    let initial_nodes: Vec<Value> = validator_set
        .iter()
        .map(|v| json!({ "node": v.network_identity, "blsPubKey": v.consensus_public_key }))
        .collect();

    let mut document = template.0.clone();
    set_path(&mut document, &INITIAL_NODES_PATH, Value::Array(initial_nodes))?;

    info!(
        validators = validator_set.len(),
        static_peers = static_peers.len(),
        bootnode = %bootnode.name,
        "topology built"
    );

    Ok(Topology {
        genesis: GenesisDocument {
            initial_validator_set: validator_set,
            document,
        },
        static_peers,
        roster,
        bootnode_address,
    })
}

/// Sets `path` inside `root`, creating missing intermediate objects.
fn set_path(root: &mut Value, path: &[&str], value: Value) -> Result<(), FleetError> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(());
    };
    let mut cursor = root;
    for (depth, key) in parents.iter().enumerate() {
        let obj = cursor.as_object_mut().ok_or_else(|| {
            FleetError::Template(format!("'{}' is not an object", path[..depth].join(".")))
        })?;
        cursor = obj
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let obj = cursor.as_object_mut().ok_or_else(|| {
        FleetError::Template(format!("'{}' is not an object", parents.join(".")))
    })?;
    obj.insert(last.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{four_node_fleet, node};
    use crate::model::{Role, StakingSpec};

    fn template() -> GenesisTemplate {
        GenesisTemplate::from_value(json!({
            "config": { "chainId": 101, "cbft": { "period": 10000, "initialNodes": ["stale"] } },
            "alloc": { "0x01": { "balance": "100" } }
        }))
        .expect("template")
    }

    #[test]
    fn validators_follow_configuration_order() {
        let topo = build(&four_node_fleet(), &template()).expect("build");
        let names: Vec<_> = topo.roster.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["val-1", "val-2"]);
        assert_eq!(topo.roster[0].index, 0);
        assert_eq!(topo.roster[1].index, 1);
        assert_eq!(topo.genesis.initial_validator_set.len(), 2);
    }

    #[test]
    fn observer_becomes_static_peer() {
        let nodes = four_node_fleet();
        let topo = build(&nodes, &template()).expect("build");
        assert_eq!(topo.static_peers.len(), 1);
        assert_eq!(Some(topo.static_peers[0].clone()), nodes[2].enode());
        assert_eq!(Some(topo.bootnode_address.clone()), nodes[3].enode());
    }

    #[test]
    fn static_validator_uses_enode_identity() {
        let mut nodes = four_node_fleet();
        nodes[0].static_peer = true;
        let topo = build(&nodes, &template()).expect("build");
        let set = &topo.genesis.initial_validator_set;
        assert!(set[0].network_identity.starts_with("enode://"));
        assert!(!set[1].network_identity.starts_with("enode://"));
        assert_eq!(topo.static_peers.len(), 2);
    }

    #[test]
    fn template_parameters_are_preserved() {
        let topo = build(&four_node_fleet(), &template()).expect("build");
        let doc = &topo.genesis.document;
        assert_eq!(doc["config"]["chainId"], 101);
        assert_eq!(doc["config"]["cbft"]["period"], 10000);
        assert_eq!(doc["alloc"]["0x01"]["balance"], "100");
        let initial = doc["config"]["cbft"]["initialNodes"].as_array().expect("array");
        assert_eq!(initial.len(), 2);
        assert!(initial[0].get("node").is_some());
        assert!(initial[0].get("blsPubKey").is_some());
    }

    #[test]
    fn missing_cbft_section_is_created() {
        let tmpl = GenesisTemplate::from_value(json!({ "config": {} })).expect("tmpl");
        let topo = build(&four_node_fleet(), &tmpl).expect("build");
        assert!(topo.genesis.document["config"]["cbft"]["initialNodes"].is_array());
    }

    #[test]
    fn non_object_section_is_template_error() {
        let tmpl = GenesisTemplate::from_value(json!({ "config": { "cbft": 7 } })).expect("tmpl");
        assert!(matches!(
            build(&four_node_fleet(), &tmpl),
            Err(FleetError::Template(_))
        ));
        assert!(GenesisTemplate::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn build_is_deterministic() {
        let nodes = four_node_fleet();
        let a = build(&nodes, &template()).expect("a");
        let b = build(&nodes, &template()).expect("b");
        assert_eq!(a.genesis.to_bytes().expect("bytes"), b.genesis.to_bytes().expect("bytes"));
        assert_eq!(a.roster_bytes().expect("r"), b.roster_bytes().expect("r"));
        assert_eq!(a.static_peers_bytes().expect("s"), b.static_peers_bytes().expect("s"));
    }

    #[test]
    fn no_bootnode_fails_fast() {
        let nodes: Vec<_> = four_node_fleet()
            .into_iter()
            .filter(|n| !n.role.is_bootnode())
            .collect();
        assert!(matches!(build(&nodes, &template()), Err(FleetError::MissingBootnode)));
    }

    #[test]
    fn missing_identity_names_node() {
        let mut nodes = four_node_fleet();
        nodes[1].identity = None;
        match build(&nodes, &template()) {
            Err(FleetError::IncompleteIdentity(name)) => assert_eq!(name, "val-2"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn roster_marks_staking_validators() {
        let mut nodes = four_node_fleet();
        nodes[1].role = Role::Validator {
            staking: Some(StakingSpec {
                private_key: "aa".into(),
                program_version: 1,
                chain_id: 101,
                image_tag: "bech32".into(),
            }),
        };
        let topo = build(&nodes, &template()).expect("build");
        assert!(!topo.roster[0].staking);
        assert!(topo.roster[1].staking);
        let json: Value = serde_json::from_slice(&topo.roster_bytes().expect("bytes")).expect("parse");
        assert_eq!(json["validateNodes"][1]["staking"], true);
        assert_eq!(json["validateNodes"][1]["host"], "10.0.0.2:6789");
        assert!(json["validateNodes"][0].get("nodeID").is_some());
    }

    #[test]
    fn write_to_creates_three_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let topo = build(&four_node_fleet(), &template()).expect("build");
        topo.write_to(tmp.path()).expect("write");
        for f in [GENESIS_FILE, STATIC_NODES_FILE, VALIDATOR_NODES_FILE] {
            assert!(tmp.path().join(f).is_file(), "{} missing", f);
        }
        let peers: Vec<String> =
            serde_json::from_slice(&fs::read(tmp.path().join(STATIC_NODES_FILE)).expect("read"))
                .expect("parse");
        assert_eq!(peers, topo.static_peers);
    }

    #[test]
    fn fleet_without_validators_has_empty_set() {
        let mut boot = node("boot", "h", Role::Bootnode, 0);
        boot.identity = Some(crate::model::fixtures::identity(1));
        let topo = build(&[boot], &template()).expect("build");
        assert!(topo.roster.is_empty());
        assert!(topo.genesis.document["config"]["cbft"]["initialNodes"]
            .as_array()
            .expect("array")
            .is_empty());
    }
}
