//! # Identity Commands
//!
//! - `identity show`: public identity of every node (private keys are never
//!   printed)
//! - `identity regenerate <name>`: rotate one node's keys and persist them
//!
//! ## Output Format
//!
//! ```text
//! NAME             ROLE        ADDRESS                                   NODE ID
//! node1            validator   3f1c...                                   9a0b1c2d...
//! node2            observer    (none)
//! ```

use anyhow::Result;
use serde_json::json;

use fleet_core::{FleetController, Identity, NodeSpec};

/// Width of the truncated public key column.
const KEY_PREVIEW: usize = 16;

fn public_json(identity: &Identity) -> serde_json::Value {
    json!({
        "address": identity.address,
        "network_public_key": identity.network_public_key,
        "consensus_public_key": identity.consensus_public_key,
    })
}

fn preview(key: &str) -> String {
    if key.len() > KEY_PREVIEW {
        format!("{}...", &key[..KEY_PREVIEW])
    } else {
        key.to_string()
    }
}

fn row(node: &NodeSpec) -> String {
    match &node.identity {
        Some(id) => format!(
            "{:<16} {:<11} {:<41} {}",
            node.name,
            node.role.label(),
            id.address,
            preview(&id.network_public_key)
        ),
        None => format!("{:<16} {:<11} (none)", node.name, node.role.label()),
    }
}

/// Handles `identity show`. Succeeds when every node has an identity.
pub fn handle_show(ctl: &FleetController, as_json: bool) -> Result<bool> {
    let nodes = ctl.show_identities()?;

    if as_json {
        let list: Vec<_> = nodes
            .iter()
            .map(|n| {
                json!({
                    "name": n.name,
                    "role": n.role.label(),
                    "identity": n.identity.as_ref().map(public_json),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else {
        println!("{:<16} {:<11} {:<41} NODE ID", "NAME", "ROLE", "ADDRESS");
        for node in &nodes {
            println!("{}", row(node));
        }
    }
    Ok(nodes.iter().all(|n| n.identity.is_some()))
}

/// Handles `identity regenerate <name>`.
pub fn handle_regenerate(ctl: &FleetController, name: &str, as_json: bool) -> Result<bool> {
    let identity = ctl.regenerate_identity(name)?;
    if as_json {
        let mut value = public_json(&identity);
        value["name"] = json!(name);
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("node:    {}", name);
        println!("address: {}", identity.address);
        println!("node_id: {}", identity.network_public_key);
        println!("bls_pub: {}", identity.consensus_public_key);
        eprintln!("genesis is now stale: run `genesis` and redeploy");
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_long_keys() {
        assert_eq!(preview("abc"), "abc");
        assert_eq!(preview(&"a".repeat(64)), format!("{}...", "a".repeat(16)));
    }
}
