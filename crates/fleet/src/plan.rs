//! Fleet planning: turns a list of hosts into a `NodeSpec` array.
//!
//! Nodes are laid out round-robin over the hosts. Every full pass over the
//! host list shifts all three ports by one, so co-located nodes never clash.
//! The first `validators` nodes are validators, the rest observers, and the
//! bootnode (when requested) comes last. A fleet without a bootnode marks
//! every node static so peers still find each other.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::error::FleetError;
use crate::model::{
    validate_fleet, Credential, NodeSpec, Role, DEFAULT_IMAGE_TAG, DEFAULT_SSH_PORT,
};

pub const BASE_P2P_PORT: u16 = 16789;
pub const BASE_RPC_PORT: u16 = 6789;
pub const BASE_WS_PORT: u16 = 7789;

/// Input of [`FleetPlan::generate`].
#[derive(Debug, Clone)]
pub struct FleetPlan {
    pub hosts: Vec<String>,
    /// Number of validators, taken from the front of the fleet.
    pub validators: usize,
    /// Nodes besides the bootnode.
    pub total: usize,
    pub bootnode: bool,
    pub base_name: String,
    /// Deploy path prefix; the node number is appended.
    pub base_path: String,
    pub user: String,
    pub credential: Credential,
    pub ssh_port: u16,
    pub image_tag: String,
}

impl FleetPlan {
    pub fn new(hosts: Vec<String>, validators: usize, total: usize, user: &str, credential: Credential) -> Self {
        Self {
            hosts,
            validators,
            total,
            bootnode: true,
            base_name: "node".to_string(),
            base_path: "/data/ledger/node".to_string(),
            user: user.to_string(),
            credential,
            ssh_port: DEFAULT_SSH_PORT,
            image_tag: DEFAULT_IMAGE_TAG.to_string(),
        }
    }

    pub fn generate(&self) -> Result<Vec<NodeSpec>, FleetError> {
        if self.hosts.is_empty() {
            return Err(FleetError::Config("no hosts to plan on".to_string()));
        }
        if self.validators > self.total {
            return Err(FleetError::Config(format!(
                "{} validators requested but only {} nodes",
                self.validators, self.total
            )));
        }
        let count = self.total + usize::from(self.bootnode);
        if count == 0 {
            return Err(FleetError::Config("plan contains no nodes".to_string()));
        }

        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            let host = &self.hosts[i % self.hosts.len()];
            let round = u16::try_from(i / self.hosts.len())
                .map_err(|_| FleetError::Config("too many nodes per host".to_string()))?;
            let is_boot = self.bootnode && i == count - 1;

            let (suffix, role) = if is_boot {
                ("boot".to_string(), Role::Bootnode)
            } else if i < self.validators {
                ((i + 1).to_string(), Role::validator())
            } else {
                ((i + 1).to_string(), Role::Observer)
            };

            nodes.push(NodeSpec {
                name: format!("{}{}", self.base_name, suffix),
                host: host.clone(),
                ssh_port: self.ssh_port,
                user: self.user.clone(),
                credential: self.credential.clone(),
                role,
                p2p_port: shift(BASE_P2P_PORT, round)?,
                rpc_port: shift(BASE_RPC_PORT, round)?,
                ws_port: shift(BASE_WS_PORT, round)?,
                deploy_path: format!("{}{}", self.base_path, suffix),
                image_tag: self.image_tag.clone(),
                static_peer: !self.bootnode,
                identity: None,
                last_operation: None,
            });
        }

        validate_fleet(&nodes)?;
        info!(
            nodes = nodes.len(),
            hosts = self.hosts.len(),
            validators = self.validators,
            "fleet planned"
        );
        Ok(nodes)
    }
}

fn shift(base: u16, round: u16) -> Result<u16, FleetError> {
    base.checked_add(round)
        .ok_or_else(|| FleetError::Config(format!("port {} + {} overflows", base, round)))
}

/// Reads one host per line, skipping blanks and `#` comments.
pub fn read_hosts_file(path: &Path) -> Result<Vec<String>, FleetError> {
    let raw = fs::read_to_string(path).map_err(|e| FleetError::io(path, e))?;
    Ok(parse_hosts(&raw))
}

fn parse_hosts(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}
