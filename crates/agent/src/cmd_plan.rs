//! Handles `plan`: hosts file in, fleet configuration out.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde_json::json;

use fleet_core::plan::{read_hosts_file, FleetPlan};
use fleet_core::{ConfigStore, Credential};

pub struct PlanArgs<'a> {
    pub config: &'a Path,
    pub hosts: &'a Path,
    pub validators: usize,
    pub total: usize,
    pub bootnode: bool,
    pub base_name: &'a str,
    pub base_path: &'a str,
    pub user: &'a str,
    pub password: Option<&'a str>,
    pub key_file: Option<&'a Path>,
    pub ssh_port: u16,
    pub tag: &'a str,
    pub force: bool,
    pub json: bool,
}

fn credential(password: Option<&str>, key_file: Option<&Path>) -> Result<Credential> {
    match (password, key_file) {
        (Some(p), None) => Ok(Credential::Password(p.to_string())),
        (None, Some(k)) => Ok(Credential::KeyFile(PathBuf::from(k))),
        (Some(_), Some(_)) => bail!("use either --password or --key-file, not both"),
        (None, None) => bail!("one of --password or --key-file is required"),
    }
}

pub fn handle_plan(args: PlanArgs<'_>) -> Result<bool> {
    if args.config.exists() && !args.force {
        bail!(
            "{} already exists (use --force to overwrite)",
            args.config.display()
        );
    }

    let hosts = read_hosts_file(args.hosts)?;
    let plan = FleetPlan {
        bootnode: args.bootnode,
        base_name: args.base_name.to_string(),
        base_path: args.base_path.to_string(),
        ssh_port: args.ssh_port,
        image_tag: args.tag.to_string(),
        ..FleetPlan::new(
            hosts,
            args.validators,
            args.total,
            args.user,
            credential(args.password, args.key_file)?,
        )
    };
    let nodes = plan.generate()?;
    ConfigStore::new(args.config).save(&nodes)?;

    if args.json {
        let summary: Vec<_> = nodes
            .iter()
            .map(|n| {
                json!({
                    "name": n.name,
                    "host": n.host,
                    "role": n.role.label(),
                    "p2p_port": n.p2p_port,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{} nodes written to {}", nodes.len(), args.config.display());
        for n in &nodes {
            println!("  {:<16} {:<11} {}:{}", n.name, n.role.label(), n.host, n.p2p_port);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_requires_exactly_one_source() {
        assert!(credential(None, None).is_err());
        assert!(credential(Some("p"), Some(Path::new("/k"))).is_err());
        assert_eq!(
            credential(Some("p"), None).expect("password"),
            Credential::Password("p".into())
        );
    }
}
