//! # Fleet Agent CLI
//!
//! Command-line front end of the ledger fleet orchestrator.
//!
//! ## Commands
//!
//! ### Planning
//! - `plan`: Build the fleet configuration from a hosts file
//!
//! ### Lifecycle
//! - `install`: Generate identities and genesis, deploy every node
//! - `update <tag>`: Move every node to a new image tag, keeping chain data
//! - `start` / `stop`: Start or stop the node services, then report status
//! - `remove`: Take the services down and delete the deploy directories
//! - `status`: Report container state per node
//!
//! ### Artifacts
//! - `genesis`: Rebuild genesis and peer lists locally, no remote calls
//! - `identity show`: List node identities
//! - `identity regenerate <name>`: Rotate one node's keys
//!
//! ### Hosts
//! - `install-runtime`: Install the container runtime once per host
//! - `restart-runtime`: Restart the container runtime once per host
//!
//! - `check-runtime`: Runtime and compose versions once per host
//! - `disk-usage`: `df -h` once per host, collected into df_status.log
//!
//! ### Queries
//! - `block-number`: Current block height per node
//! - `peers`: Connected peer count per node
//! - `accounts`: First account per node, collected into accounts.json
//!
//! ## Exit Status
//!
//! `0` when every node succeeded, `1` otherwise.
//!
//! ## Environment Variables
//!
//! - `FLEET_CONFIG`: fleet configuration file (default: fleet.json)
//! - `FLEET_ENV_FILE`: dotenv file to load first (default: .env)
//! - `FLEET_*`: cluster settings, see `fleet_core::config`
//! - `RUST_LOG`: log filter (default: info)

mod cmd_fleet;
mod cmd_identity;
mod cmd_plan;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleet_core::config::{self, ClusterConfig};
use fleet_core::{ConfigStore, FleetController, MockTransport, RemoteTransport, SshTransport};

use crate::cmd_fleet::FleetOp;

#[derive(Parser)]
#[command(version, about = "Ledger fleet orchestrator")]
struct Cli {
    /// Fleet configuration file
    #[arg(long, global = true, env = "FLEET_CONFIG", default_value = "fleet.json")]
    config: PathBuf,

    /// Local working directory for keys, manifests and artifacts
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    /// Genesis template file
    #[arg(long, global = true)]
    template: Option<PathBuf>,

    /// Node image repository (without tag)
    #[arg(long, global = true)]
    image: Option<String>,

    /// Maximum number of nodes processed at once
    #[arg(long, global = true)]
    max_parallel: Option<usize>,

    /// Use a simulated transport instead of ssh
    #[arg(long, global = true)]
    dry_run: bool,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the fleet configuration from a hosts file
    Plan {
        /// One host per line, `#` starts a comment
        #[arg(long)]
        hosts: PathBuf,
        /// Number of validators
        #[arg(long, default_value_t = 4)]
        validators: usize,
        /// Number of nodes besides the bootnode
        #[arg(long, default_value_t = 8)]
        total: usize,
        /// Plan without a bootnode (every node becomes a static peer)
        #[arg(long)]
        no_bootnode: bool,
        #[arg(long, default_value = "node")]
        base_name: String,
        #[arg(long, default_value = "/data/ledger/node")]
        base_path: String,
        /// SSH login user
        #[arg(long)]
        user: String,
        /// SSH password (also used for sudo)
        #[arg(long, env = "FLEET_SSH_PASSWORD", hide_env_values = true, conflicts_with = "key_file")]
        password: Option<String>,
        /// SSH private key file
        #[arg(long)]
        key_file: Option<PathBuf>,
        #[arg(long, default_value_t = 22)]
        ssh_port: u16,
        /// Initial image tag of every node
        #[arg(long, default_value = "latest")]
        tag: String,
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Generate identities and genesis, then deploy every node
    Install {
        /// Image tag for every node (default: each node's own tag)
        #[arg(long)]
        tag: Option<String>,
    },

    /// Move every node to a new image tag, keeping chain data
    Update {
        tag: String,
    },

    /// Start node services
    Start,

    /// Stop node services
    Stop,

    /// Take services down and delete deploy directories
    Remove,

    /// Report container state per node
    Status,

    /// Rebuild genesis and peer lists locally
    Genesis,

    /// Install the container runtime once per host
    InstallRuntime,

    /// Restart the container runtime once per host
    RestartRuntime,

    /// Current block height per node
    BlockNumber,

    /// Connected peer count per node
    Peers,

    /// Runtime and compose versions once per host
    CheckRuntime,

    /// Disk usage once per host, collected into df_status.log
    DiskUsage,

    /// First account per node, collected into accounts.json
    Accounts,

    /// Node identity commands
    Identity {
        #[command(subcommand)]
        identity_cmd: IdentityCommands,
    },
}

#[derive(Subcommand)]
enum IdentityCommands {
    /// List node identities (public parts only)
    Show,

    /// Rotate one node's keys; genesis must be rebuilt afterwards
    Regenerate {
        name: String,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Defaults, then `FLEET_*` environment, then flags.
fn cluster_config(cli: &Cli) -> Result<ClusterConfig> {
    let mut cluster = ClusterConfig::from_env()?;
    if let Some(workdir) = &cli.workdir {
        cluster.workdir = workdir.clone();
    }
    if let Some(template) = &cli.template {
        cluster.genesis_template = template.clone();
    }
    if let Some(image) = &cli.image {
        cluster.image = image.clone();
    }
    if cli.max_parallel.is_some() {
        cluster.max_parallel = cli.max_parallel;
    }
    Ok(cluster)
}

fn controller(cli: &Cli) -> Result<FleetController> {
    let cluster = cluster_config(cli)?;
    let transport: Arc<dyn RemoteTransport> = if cli.dry_run {
        warn!("dry run: no remote host is contacted");
        Arc::new(MockTransport::healthy())
    } else {
        Arc::new(SshTransport::new(cluster.command_timeout()))
    };
    let controller = FleetController::new(cluster, ConfigStore::new(&cli.config), transport)
        .context("invalid cluster configuration")?;

    let cancel = controller.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight nodes");
            cancel.cancel();
        }
    });
    Ok(controller)
}

/// Loads the env file while the process is still single-threaded, then
/// hands over to the runtime.
fn main() -> Result<()> {
    let env_file = config::load_env_file()?;
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Some(path) = env_file {
        info!("loaded environment from {}", path.display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    let succeeded = runtime.block_on(dispatch(&cli))?;

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

async fn dispatch(cli: &Cli) -> Result<bool> {
    let succeeded = match &cli.cmd {
        Commands::Plan {
            hosts,
            validators,
            total,
            no_bootnode,
            base_name,
            base_path,
            user,
            password,
            key_file,
            ssh_port,
            tag,
            force,
        } => cmd_plan::handle_plan(cmd_plan::PlanArgs {
            config: &cli.config,
            hosts,
            validators: *validators,
            total: *total,
            bootnode: !*no_bootnode,
            base_name,
            base_path,
            user,
            password: password.as_deref(),
            key_file: key_file.as_deref(),
            ssh_port: *ssh_port,
            tag,
            force: *force,
            json: cli.json,
        })?,
        Commands::Genesis => cmd_fleet::handle_genesis(&controller(cli)?, cli.json)?,
        Commands::Identity { identity_cmd } => {
            let ctl = controller(cli)?;
            match identity_cmd {
                IdentityCommands::Show => cmd_identity::handle_show(&ctl, cli.json)?,
                IdentityCommands::Regenerate { name } => {
                    cmd_identity::handle_regenerate(&ctl, name, cli.json)?
                }
            }
        }
        Commands::Install { tag } => run(cli, FleetOp::Install(tag.clone())).await?,
        Commands::Update { tag } => run(cli, FleetOp::Update(tag.clone())).await?,
        Commands::Start => run(cli, FleetOp::Start).await?,
        Commands::Stop => run(cli, FleetOp::Stop).await?,
        Commands::Remove => run(cli, FleetOp::Remove).await?,
        Commands::Status => run(cli, FleetOp::Status).await?,
        Commands::InstallRuntime => run(cli, FleetOp::InstallRuntime).await?,
        Commands::RestartRuntime => run(cli, FleetOp::RestartRuntime).await?,
        Commands::CheckRuntime => run(cli, FleetOp::CheckRuntime).await?,
        Commands::DiskUsage => run(cli, FleetOp::DiskUsage).await?,
        Commands::BlockNumber => run(cli, FleetOp::BlockNumber).await?,
        Commands::Peers => run(cli, FleetOp::Peers).await?,
        Commands::Accounts => run(cli, FleetOp::Accounts).await?,
    };
    Ok(succeeded)
}

async fn run(cli: &Cli, op: FleetOp) -> Result<bool> {
    let ctl = controller(cli)?;
    cmd_fleet::handle(&ctl, op, cli.json).await
}
