//! # Fleet Data Model
//!
//! Typed representation of the configuration store. A fleet is an ordered
//! `Vec<NodeSpec>`; the order is the configuration order and is significant
//! (it fixes validator indices in the genesis document).
//!
//! ## JSON Shape
//!
//! ```text
//! {
//!   "name": "stress1",
//!   "host": "10.0.0.4",
//!   "ssh_port": 22,
//!   "user": "deploy",
//!   "credential": { "password": "..." } | { "key_file": "/path/id_ed25519" },
//!   "role": { "kind": "validator", "staking": { ... } } | { "kind": "bootnode" } | ...,
//!   "p2p_port": 16789, "rpc_port": 6789, "ws_port": 7789,
//!   "deploy_path": "/data/ledger/node1",
//!   "image_tag": "latest",
//!   "static": false,
//!   "identity": { ... },            (absent until generated)
//!   "last_operation": { ... }       (absent until first install/update)
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::FleetError;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default image tag for nodes that do not specify one.
pub const DEFAULT_IMAGE_TAG: &str = "latest";
/// Default image tag of the staking helper.
pub const DEFAULT_STAKING_TAG: &str = "bech32";
/// Default chain id passed to the staking helper.
pub const DEFAULT_CHAIN_ID: u64 = 101;

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_image_tag() -> String {
    DEFAULT_IMAGE_TAG.to_string()
}

fn default_staking_tag() -> String {
    DEFAULT_STAKING_TAG.to_string()
}

fn default_chain_id() -> u64 {
    DEFAULT_CHAIN_ID
}

// ════════════════════════════════════════════════════════════════════════════════
// CREDENTIAL
// ════════════════════════════════════════════════════════════════════════════════

/// How the orchestrator authenticates to a host.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Credential {
    /// Password login. The same password is fed to `sudo -S`.
    Password(String),
    /// Private key file on the control host.
    KeyFile(PathBuf),
}

impl Credential {
    /// Password to feed to `sudo -S`, if any.
    pub fn sudo_password(&self) -> Option<&str> {
        match self {
            Credential::Password(p) => Some(p.as_str()),
            Credential::KeyFile(_) => None,
        }
    }
}

// Passwords never reach logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password([REDACTED])"),
            Credential::KeyFile(p) => f.debug_tuple("KeyFile").field(p).finish(),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// ROLE
// ════════════════════════════════════════════════════════════════════════════════

/// Parameters of the self-staking helper that runs beside a validator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingSpec {
    /// Funded account key used by the helper to submit the staking tx.
    pub private_key: String,
    /// Node program version announced in the staking tx.
    pub program_version: u32,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    /// Tag of the helper image.
    #[serde(default = "default_staking_tag")]
    pub image_tag: String,
}

impl fmt::Debug for StakingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StakingSpec")
            .field("private_key", &"[REDACTED]")
            .field("program_version", &self.program_version)
            .field("chain_id", &self.chain_id)
            .field("image_tag", &self.image_tag)
            .finish()
    }
}

/// Role of a node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Role {
    /// Member of the initial validator set.
    Validator {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        staking: Option<StakingSpec>,
    },
    /// Discovery entry point. At most one per fleet.
    Bootnode,
    /// Non-voting node whose address is pre-shared as a static peer.
    Observer,
    /// Non-voting node used by delegation tooling.
    Delegate,
}

impl Role {
    /// Plain validator without staking helper.
    pub fn validator() -> Self {
        Role::Validator { staking: None }
    }

    pub fn is_validator(&self) -> bool {
        matches!(self, Role::Validator { .. })
    }

    pub fn is_bootnode(&self) -> bool {
        matches!(self, Role::Bootnode)
    }

    /// Staking parameters, only ever present on validators.
    pub fn staking(&self) -> Option<&StakingSpec> {
        match self {
            Role::Validator { staking } => staking.as_ref(),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::Validator { .. } => "validator",
            Role::Bootnode => "bootnode",
            Role::Observer => "observer",
            Role::Delegate => "delegate",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// IDENTITY
// ════════════════════════════════════════════════════════════════════════════════

/// Cryptographic material of one node, hex encoded.
///
/// Produced once by the identity generator and immutable afterwards.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub consensus_private_key: String,
    pub consensus_public_key: String,
    pub network_private_key: String,
    pub network_public_key: String,
    /// 20-byte address derived from the network public key.
    pub address: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("consensus_public_key", &self.consensus_public_key)
            .field("network_public_key", &self.network_public_key)
            .field("address", &self.address)
            .field("private_keys", &"[REDACTED]")
            .finish()
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// OPERATION RECORD
// ════════════════════════════════════════════════════════════════════════════════

/// Outcome of the last persisted operation for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix seconds.
    pub timestamp: u64,
}

impl OperationRecord {
    pub fn now(operation: &str, succeeded: bool, error: Option<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            operation: operation.to_string(),
            succeeded,
            error,
            timestamp,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// NODE SPEC
// ════════════════════════════════════════════════════════════════════════════════

/// One fleet member as stored in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub user: String,
    pub credential: Credential,
    pub role: Role,
    pub p2p_port: u16,
    pub rpc_port: u16,
    pub ws_port: u16,
    /// Remote directory holding manifest, genesis and data.
    pub deploy_path: String,
    #[serde(default = "default_image_tag")]
    pub image_tag: String,
    /// Pre-share this node's address even if its role would not.
    #[serde(default, rename = "static")]
    pub static_peer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<OperationRecord>,
}

impl NodeSpec {
    /// Whether this node's address goes into the static peer list.
    pub fn is_static(&self) -> bool {
        self.static_peer || matches!(self.role, Role::Observer)
    }

    /// `name@host`, the label used in every report line.
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.host)
    }

    /// Externally reachable network address, available once the node has
    /// an identity.
    pub fn enode(&self) -> Option<String> {
        self.identity.as_ref().map(|id| {
            format!("enode://{}@{}:{}", id.network_public_key, self.host, self.p2p_port)
        })
    }

    /// Container name on the remote host.
    pub fn container_name(&self) -> &str {
        &self.name
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// VALIDATION
// ════════════════════════════════════════════════════════════════════════════════

/// Checks the structural invariants of a fleet.
///
/// - at least one node
/// - names non-empty, unique and usable as a directory name
/// - at most one bootnode
/// - ports non-zero and not reused among nodes sharing a host
pub fn validate_fleet(nodes: &[NodeSpec]) -> Result<(), FleetError> {
    if nodes.is_empty() {
        return Err(FleetError::Config("fleet contains no nodes".to_string()));
    }

    let mut names: HashSet<&str> = HashSet::with_capacity(nodes.len());
    let mut bootnode: Option<&str> = None;
    let mut ports_by_host: HashMap<&str, HashMap<u16, &str>> = HashMap::new();

    for node in nodes {
        if node.name.trim().is_empty() {
            return Err(FleetError::Config("node with empty name".to_string()));
        }
        if node.name.contains('/') || node.name.contains('\\') || node.name.starts_with('.') {
            return Err(FleetError::Config(format!(
                "node name '{}' cannot be used as a directory name",
                node.name
            )));
        }
        if !names.insert(node.name.as_str()) {
            return Err(FleetError::DuplicateNode(node.name.clone()));
        }
        if node.host.trim().is_empty() {
            return Err(FleetError::Config(format!("node '{}' has no host", node.name)));
        }
        if node.deploy_path.trim().is_empty() {
            return Err(FleetError::Config(format!(
                "node '{}' has no deploy_path",
                node.name
            )));
        }

        if node.role.is_bootnode() {
            if let Some(first) = bootnode {
                return Err(FleetError::MultipleBootnodes(
                    first.to_string(),
                    node.name.clone(),
                ));
            }
            bootnode = Some(node.name.as_str());
        }

        let host_ports = ports_by_host.entry(node.host.as_str()).or_default();
        for (kind, port) in [("p2p", node.p2p_port), ("rpc", node.rpc_port), ("ws", node.ws_port)] {
            if port == 0 {
                return Err(FleetError::Config(format!(
                    "node '{}' has {} port 0",
                    node.name, kind
                )));
            }
            if let Some(owner) = host_ports.insert(port, node.name.as_str()) {
                return Err(FleetError::Config(format!(
                    "port {} on host {} is used by both '{}' and '{}'",
                    port, node.host, owner, node.name
                )));
            }
        }
    }

    Ok(())
}

/// Returns the designated bootnode, if any.
pub fn find_bootnode(nodes: &[NodeSpec]) -> Option<&NodeSpec> {
    nodes.iter().find(|n| n.role.is_bootnode())
}

/// Keeps the first node per distinct host, in configuration order.
pub fn distinct_hosts(nodes: &[NodeSpec]) -> Vec<NodeSpec> {
    let mut seen = HashSet::new();
    nodes
        .iter()
        .filter(|n| seen.insert(n.host.clone()))
        .cloned()
        .collect()
}

// ════════════════════════════════════════════════════════════════════════════════
// TEST FIXTURES
// ════════════════════════════════════════════════════════════════════════════════


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn role_serializes_as_tagged_object() {
        let json = serde_json::to_value(Role::Bootnode).expect("serialize");
        assert_eq!(json, serde_json::json!({ "kind": "bootnode" }));

        let staking = Role::Validator {
            staking: Some(StakingSpec {
                private_key: "ab".into(),
                program_version: 2816,
                chain_id: 101,
                image_tag: "bech32".into(),
            }),
        };
        let json = serde_json::to_value(&staking).expect("serialize");
        assert_eq!(json["kind"], "validator");
        assert_eq!(json["staking"]["program_version"], 2816);
    }

    #[test]
    fn validator_without_staking_omits_field() {
        let json = serde_json::to_value(Role::validator()).expect("serialize");
        assert_eq!(json, serde_json::json!({ "kind": "validator" }));
    }

    #[test]
    fn node_spec_defaults_apply() {
        let raw = r#"{
            "name": "n1", "host": "h", "user": "u",
            "credential": { "key_file": "/k" },
            "role": { "kind": "observer" },
            "p2p_port": 1, "rpc_port": 2, "ws_port": 3,
            "deploy_path": "/d"
        }"#;
        let node: NodeSpec = serde_json::from_str(raw).expect("parse");
        assert_eq!(node.ssh_port, 22);
        assert_eq!(node.image_tag, "latest");
        assert!(!node.static_peer);
        assert!(node.is_static(), "observers are static peers");
        assert!(node.identity.is_none());
        assert_eq!(node.credential, Credential::KeyFile(PathBuf::from("/k")));
    }

    #[test]
    fn static_flag_uses_static_key() {
        let mut n = node("v", "h", Role::validator(), 0);
        n.static_peer = true;
        let json = serde_json::to_value(&n).expect("serialize");
        assert_eq!(json["static"], true);
        assert!(json.get("identity").is_none());
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut n = node("v", "h", Role::validator(), 0);
        n.identity = Some(identity(1));
        let dbg = format!("{:?}", n);
        assert!(!dbg.contains("secret"));
        assert!(!dbg.contains(&identity(1).network_private_key));
        assert!(dbg.contains("REDACTED"));
    }

    #[test]
    fn enode_requires_identity() {
        let mut n = node("v", "10.1.1.1", Role::validator(), 0);
        assert!(n.enode().is_none());
        n.identity = Some(identity(0));
        let enode = n.enode().expect("enode");
        assert!(enode.starts_with("enode://"));
        assert!(enode.ends_with("@10.1.1.1:16789"));
    }

    #[test]
    fn validate_accepts_four_node_fleet() {
        assert!(validate_fleet(&four_node_fleet()).is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let nodes = vec![
            node("a", "h1", Role::validator(), 0),
            node("a", "h2", Role::validator(), 0),
        ];
        assert!(matches!(validate_fleet(&nodes), Err(FleetError::DuplicateNode(n)) if n == "a"));
    }

    #[test]
    fn validate_rejects_two_bootnodes() {
        let nodes = vec![
            node("b1", "h1", Role::Bootnode, 0),
            node("b2", "h2", Role::Bootnode, 0),
        ];
        assert!(matches!(
            validate_fleet(&nodes),
            Err(FleetError::MultipleBootnodes(a, b)) if a == "b1" && b == "b2"
        ));
    }

    #[test]
    fn validate_rejects_port_clash_on_same_host() {
        let nodes = vec![
            node("a", "h1", Role::validator(), 0),
            node("b", "h1", Role::validator(), 0),
        ];
        assert!(matches!(validate_fleet(&nodes), Err(FleetError::Config(_))));

        let shifted = vec![
            node("a", "h1", Role::validator(), 0),
            node("b", "h1", Role::validator(), 1),
        ];
        assert!(validate_fleet(&shifted).is_ok());
    }

    #[test]
    fn validate_rejects_empty_and_path_like_names() {
        assert!(validate_fleet(&[]).is_err());
        let nodes = vec![node("../x", "h", Role::validator(), 0)];
        assert!(validate_fleet(&nodes).is_err());
    }

    #[test]
    fn distinct_hosts_keeps_first_per_host() {
        let nodes = vec![
            node("a", "h1", Role::validator(), 0),
            node("b", "h1", Role::validator(), 1),
            node("c", "h2", Role::Bootnode, 0),
        ];
        let hosts = distinct_hosts(&nodes);
        let names: Vec<_> = hosts.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }
}
