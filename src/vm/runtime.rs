//! Container runtime contract and the LXD (`lxc` CLI) implementation.
//!
//! The engine only ever talks to [`ContainerRuntime`]; nothing outside this
//! module knows which hypervisor is underneath.
//!
//! ## Architecture
//!
//! ```text
//! LxcRuntime::launch(LaunchSpec)
//!     └─► tokio::process::Command  →  lxc launch <image> <name> --config=user.user-data=…
//! LxcRuntime::query_state(name)
//!     └─► lxc query /1.0/instances/<name>/state  →  InstanceState { status, interfaces }
//! ```

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::model::Demand;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("`{0}` binary not found; install LXD or set provisioning.lxc_binary")]
    BinaryNotFound(String),

    #[error("failed to spawn `{program}` for {label}: {source}")]
    Spawn {
        program: String,
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{label} failed (exit {code:?}): {stderr}")]
    Command {
        label: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("could not parse {what}: {source}")]
    Parse {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Contract types
// ---------------------------------------------------------------------------

/// Everything the runtime needs to create one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    /// Rendered cloud-config document.
    pub boot_config: String,
    pub demand: Demand,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InterfaceAddress {
    pub family: String,
    pub address: String,
    #[serde(default)]
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub addresses: Vec<InterfaceAddress>,
}

/// Observed state of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstanceState {
    pub status: String,
    pub interfaces: Vec<NetworkInterface>,
}

impl InstanceState {
    /// The first IPv4 address with global scope on any interface.
    pub fn global_ipv4(&self) -> Option<Ipv4Addr> {
        self.interfaces
            .iter()
            .flat_map(|iface| iface.addresses.iter())
            .filter(|a| a.family == "inet" && a.scope == "global")
            .find_map(|a| a.address.parse().ok())
    }
}

#[derive(Debug, Deserialize)]
struct RawInterface {
    #[serde(default)]
    addresses: Vec<InterfaceAddress>,
}

#[derive(Debug, Deserialize)]
struct RawState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    network: Option<BTreeMap<String, RawInterface>>,
}

/// Parse the body of `GET /1.0/instances/<name>/state`.
pub fn parse_instance_state(json: &str) -> Result<InstanceState, RuntimeError> {
    let raw: RawState = serde_json::from_str(json).map_err(|source| RuntimeError::Parse {
        what: "instance state".into(),
        source,
    })?;
    let interfaces = raw
        .network
        .unwrap_or_default()
        .into_iter()
        .filter(|(name, _)| name != "lo")
        .map(|(name, iface)| NetworkInterface {
            name,
            addresses: iface.addresses,
        })
        .collect();
    Ok(InstanceState {
        status: raw.status,
        interfaces,
    })
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<(), RuntimeError>;
    async fn query_state(&self, name: &str) -> Result<InstanceState, RuntimeError>;
    async fn exec_command(&self, name: &str, cmd: &[&str]) -> Result<String, RuntimeError>;
    async fn start(&self, name: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;
    async fn snapshot(&self, name: &str, snapshot: &str) -> Result<(), RuntimeError>;
    /// Force-remove an instance. Removing one that does not exist succeeds.
    async fn delete(&self, name: &str) -> Result<(), RuntimeError>;
}

// ---------------------------------------------------------------------------
// LXD implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LxcRuntime {
    binary: PathBuf,
}

impl LxcRuntime {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Use `explicit` if given, otherwise search `PATH` and the usual
    /// install locations.
    pub fn discover(explicit: Option<PathBuf>) -> Result<Self, RuntimeError> {
        let binary = match explicit {
            Some(path) => path,
            None => find_lxc()?,
        };
        info!(path = %binary.display(), "using lxc binary");
        Ok(Self::new(binary))
    }

    /// Build the argument vector for `lxc launch`.
    pub fn launch_args(spec: &LaunchSpec) -> Vec<String> {
        vec![
            "launch".to_string(),
            spec.image.clone(),
            spec.name.clone(),
            format!("--config=user.user-data={}", spec.boot_config),
            format!("--config=limits.cpu={}", spec.demand.cores),
            format!("--config=limits.memory={}MiB", spec.demand.memory_mb),
            "--device".to_string(),
            format!("root,size={}MiB", spec.demand.disk_mb),
        ]
    }

    /// Spawn `lxc`, wait for it, and map non-zero exit to `Err`. Returns
    /// stdout on success. Dropping the future kills the child.
    async fn run(&self, args: &[String], label: &str) -> Result<String, RuntimeError> {
        let program = self.binary.display().to_string();
        debug!(%program, label, "running");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                program: program.clone(),
                label: label.to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(RuntimeError::Command {
                label: label.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

fn find_lxc() -> Result<PathBuf, RuntimeError> {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = PathBuf::from(dir).join("lxc");
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    // Snap and distro package locations.
    let candidates: &[&str] = &["/snap/bin/lxc", "/usr/bin/lxc", "/usr/local/bin/lxc"];
    for &path in candidates {
        if PathBuf::from(path).exists() {
            return Ok(PathBuf::from(path));
        }
    }

    Err(RuntimeError::BinaryNotFound("lxc".into()))
}

#[async_trait]
impl ContainerRuntime for LxcRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<(), RuntimeError> {
        self.run(&Self::launch_args(spec), &format!("lxc launch {}", spec.name))
            .await?;
        info!(
            name = %spec.name,
            image = %spec.image,
            cpus = spec.demand.cores,
            memory_mb = spec.demand.memory_mb,
            "instance launched"
        );
        Ok(())
    }

    async fn query_state(&self, name: &str) -> Result<InstanceState, RuntimeError> {
        let body = self
            .run(
                &["query".to_string(), format!("/1.0/instances/{name}/state")],
                &format!("lxc query {name} state"),
            )
            .await?;
        parse_instance_state(&body)
    }

    async fn exec_command(&self, name: &str, cmd: &[&str]) -> Result<String, RuntimeError> {
        let mut args = vec!["exec".to_string(), name.to_string(), "--".to_string()];
        args.extend(cmd.iter().map(|s| s.to_string()));
        self.run(&args, &format!("lxc exec {name}")).await
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(&["start".to_string(), name.to_string()], &format!("lxc start {name}"))
            .await
            .map(drop)
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(&["stop".to_string(), name.to_string()], &format!("lxc stop {name}"))
            .await
            .map(drop)
    }

    async fn snapshot(&self, name: &str, snapshot: &str) -> Result<(), RuntimeError> {
        self.run(
            &["snapshot".to_string(), name.to_string(), snapshot.to_string()],
            &format!("lxc snapshot {name}/{snapshot}"),
        )
        .await
        .map(drop)
    }

    async fn delete(&self, name: &str) -> Result<(), RuntimeError> {
        let result = self
            .run(
                &["delete".to_string(), "--force".to_string(), name.to_string()],
                &format!("lxc delete {name}"),
            )
            .await;
        match result {
            Err(RuntimeError::Command { stderr, .. })
                if stderr.to_ascii_lowercase().contains("not found") =>
            {
                warn!(name, "delete: instance already gone");
                Ok(())
            }
            other => other.map(drop),
        }
    }
}
