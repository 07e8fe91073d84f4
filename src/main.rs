//! labctl: operational CLI for lab-sandbox.
//!
//! `provision` runs a single request end-to-end against the local LXD daemon
//! and prints the resulting connection details as JSON. Ctrl-C before the
//! container is reachable cancels the request and tears the instance down.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lab_sandbox::config::EngineConfig;
use lab_sandbox::engine::{Engine, ProvisionRequest, event_sinks};
use lab_sandbox::logging;
use lab_sandbox::model::{Demand, Requester};
use lab_sandbox::paths::LabPaths;
use lab_sandbox::vm::{LxcRuntime, boot_config, credentials};

#[derive(Parser, Debug)]
#[command(name = "labctl", version, about = "Quota-checked lab container provisioning")]
struct Args {
    /// Configuration file (default: ~/.config/labctl/labctl.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Admit, launch and wait for a new lab container
    Provision {
        /// Container name (lowercase letters, digits and '-')
        name: String,
        /// Requesting user id
        #[arg(long)]
        user: u64,
        /// Team the request is made on behalf of
        #[arg(long)]
        team: Option<u64>,
        #[arg(long, default_value_t = 1)]
        cpu: u32,
        #[arg(long, default_value_t = 1024)]
        memory_mb: u64,
        #[arg(long, default_value_t = 10240)]
        disk_mb: u64,
        /// Catalog dependencies to install, in order (comma separated)
        #[arg(short = 'd', long = "deps", value_delimiter = ',')]
        dependencies: Vec<String>,
        /// Use this OpenSSH public key instead of generating a keypair
        #[arg(long)]
        public_key_file: Option<PathBuf>,
    },

    /// List installable dependencies
    Catalog,

    /// Print the cloud-config a container would boot with
    BootConfig {
        #[arg(long)]
        public_key_file: PathBuf,
        #[arg(short = 'd', long = "deps", value_delimiter = ',')]
        dependencies: Vec<String>,
    },

    /// Load the configuration and print its effective values
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = logging::init();
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Provision {
            name,
            user,
            team,
            cpu,
            memory_mb,
            disk_mb,
            dependencies,
            public_key_file,
        } => {
            let public_key = public_key_file.as_deref().map(read_key).transpose()?;
            let request = ProvisionRequest {
                name,
                requester: Requester { user_id: user, team_id: team },
                demand: Demand::new(cpu, memory_mb, disk_mb),
                dependencies,
                public_key,
            };
            provision(&config, request).await
        }
        Command::Catalog => {
            for entry in boot_config::CATALOG {
                println!("{:<10} {}", entry.id, entry.label);
            }
            Ok(())
        }
        Command::BootConfig {
            public_key_file,
            dependencies,
        } => {
            let key = credentials::validate_public_key(&read_key(&public_key_file)?)?;
            print!(
                "{}",
                boot_config::render(&config.provisioning.admin_user, &key, &dependencies)?
            );
            Ok(())
        }
        Command::CheckConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_config(explicit: Option<&Path>) -> Result<EngineConfig> {
    match explicit {
        Some(path) => EngineConfig::load(path),
        None => match LabPaths::resolve() {
            Some(paths) => EngineConfig::load_or_default(&paths.config_file()),
            None => {
                warn!("HOME is not set; using default configuration");
                Ok(EngineConfig::default())
            }
        },
    }
}

fn read_key(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

async fn provision(config: &EngineConfig, request: ProvisionRequest) -> Result<()> {
    let runtime = LxcRuntime::discover(config.provisioning.lxc_binary.clone())?;
    let (sink, _broadcast) = event_sinks(&config.notifications)?;
    let engine = Engine::new(config, Arc::new(runtime), sink);

    let shutdown = CancellationToken::new();
    let workers = engine.spawn_workers(shutdown.clone());

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling provisioning");
                cancel.cancel();
            }
        })
    };

    let name = request.name.clone();
    let result = engine.provision(request, &cancel).await;

    ctrl_c.abort();
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }

    let result = result.with_context(|| format!("provisioning {name}"))?;
    info!(container = %result.container, address = %result.address, "provisioned");
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
