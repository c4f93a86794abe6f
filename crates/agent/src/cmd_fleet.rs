//! # Fleet Operation Commands
//!
//! Runs one lifecycle operation through the controller and prints its
//! report.
//!
//! ## Output Format
//!
//! Table (default):
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ install: 4/4 succeeded                                       │
//! └──────────────────────────────────────────────────────────────┘
//! ✓ node1@10.0.0.1     deployed ledger/node:latest
//! ...
//! ```
//!
//! followed by the status table for operations that run one, the path of
//! any file written from the results, and a local write error if one
//! happened after the remote phase. With `--json` a single object
//! `{operation, succeeded, report, status, output_file, local_error}` is
//! printed instead.

use anyhow::Result;
use serde_json::json;

use fleet_core::{FleetController, LifecycleOutcome};

/// Operations dispatched through [`handle`].
#[derive(Debug, Clone)]
pub enum FleetOp {
    Install(Option<String>),
    Update(String),
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

/// Runs `op` and prints its outcome. Returns whether it fully succeeded.
pub async fn handle(ctl: &FleetController, op: FleetOp, as_json: bool) -> Result<bool> {
    let outcome = match op {
        FleetOp::Install(tag) => ctl.install(tag.as_deref()).await?,
        FleetOp::Update(tag) => ctl.update(&tag).await?,
        FleetOp::Start => ctl.start().await?,
        FleetOp::Stop => ctl.stop().await?,
        FleetOp::Remove => ctl.remove().await?,
        FleetOp::Status => ctl.status().await?,
        FleetOp::InstallRuntime => ctl.install_runtime().await?,
        FleetOp::RestartRuntime => ctl.restart_runtime().await?,
        FleetOp::BlockNumber => ctl.block_number().await?,
        FleetOp::Peers => ctl.peers().await?,
        FleetOp::CheckRuntime => ctl.check_runtime().await?,
        FleetOp::DiskUsage => ctl.disk_usage().await?,
        FleetOp::Accounts => ctl.accounts().await?,
    };
    print_outcome(&outcome, as_json)?;
    Ok(outcome.succeeded())
}

fn print_outcome(outcome: &LifecycleOutcome, as_json: bool) -> Result<()> {
    if as_json {
        let value = json!({
            "operation": outcome.operation.as_str(),
            "succeeded": outcome.succeeded(),
            "report": outcome.report,
            "status": outcome.status,
            "output_file": outcome.output_file,
            "local_error": outcome.local_error,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    print!("{}", outcome.report.to_table());
    if let Some(status) = &outcome.status {
        println!();
        print!("{}", status.to_table());
    }
    if let Some(path) = &outcome.output_file {
        println!("written: {}", path.display());
    }
    if let Some(err) = &outcome.local_error {
        eprintln!("error after remote phase: {}", err);
    }
    Ok(())
}

/// Handles `genesis`: rebuilds artifacts locally and prints a summary.
pub fn handle_genesis(ctl: &FleetController, as_json: bool) -> Result<bool> {
    let topology = ctl.generate_artifacts()?;
    let dir = ctl.cluster().artifacts_dir().display().to_string();

    if as_json {
        let value = json!({
            "dir": dir,
            "bootnode": topology.bootnode_address,
            "validators": topology.roster,
            "static_peers": topology.static_peers,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("artifacts:    {}", dir);
        println!("bootnode:     {}", topology.bootnode_address);
        println!("validators:   {}", topology.roster.len());
        for entry in &topology.roster {
            println!("  [{}] {:<16} {}", entry.index, entry.name, entry.host);
        }
        println!("static peers: {}", topology.static_peers.len());
    }
    Ok(true)
}
