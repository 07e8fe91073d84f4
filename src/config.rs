//! Engine configuration, loaded from `labctl.toml`.
//!
//! Every section carries `#[serde(default)]`, so a partial file only
//! overrides the keys it names and an empty file yields the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::model::Quota;
use crate::queue::QueueConfig;
use crate::vm::DriverSettings;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub admission: AdmissionConfig,
    pub queue: QueueSection,
    pub provisioning: ProvisioningConfig,
    pub notifications: NotificationConfig,
    pub quotas: Vec<Quota>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub lock_timeout_secs: u64,
    pub lock_retry_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSection {
    /// Number of concurrent operation workers.
    pub workers: usize,
    /// Executions before an entry is failed permanently.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub idle_poll_ms: u64,
    /// Completed and failed queue entries kept for inspection.
    pub retain_finished: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub image: String,
    pub admin_user: String,
    pub ssh_port: u16,
    pub ready_poll_interval_ms: u64,
    pub ready_timeout_secs: u64,
    /// Explicit path to `lxc`; searched on `PATH` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lxc_binary: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub broadcast_capacity: usize,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 10,
            lock_retry_interval_ms: 1000,
        }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            backoff_base_ms: 2000,
            backoff_max_ms: 60_000,
            idle_poll_ms: 500,
            retain_finished: 1024,
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            image: "ubuntu:22.04".into(),
            admin_user: "labuser".into(),
            ssh_port: 22,
            ready_poll_interval_ms: 2000,
            ready_timeout_secs: 120,
            lxc_binary: None,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            broadcast_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl AdmissionConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }
}

impl QueueSection {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            idle_poll: Duration::from_millis(self.idle_poll_ms),
            retain_finished: self.retain_finished,
        }
    }
}

impl ProvisioningConfig {
    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            image: self.image.clone(),
            admin_user: self.admin_user.clone(),
            ssh_port: self.ssh_port,
            poll_interval: Duration::from_millis(self.ready_poll_interval_ms),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl EngineConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("serializing configuration")
    }

    /// Read and validate the file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = Self::from_toml(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue.workers == 0 {
            bail!("queue.workers must be at least 1");
        }
        if self.queue.max_attempts == 0 {
            bail!("queue.max_attempts must be at least 1");
        }
        if self.provisioning.ready_poll_interval_ms == 0 {
            bail!("provisioning.ready_poll_interval_ms must be positive");
        }
        if self.admission.lock_retry_interval_ms == 0 {
            bail!("admission.lock_retry_interval_ms must be positive");
        }
        if self.notifications.broadcast_capacity == 0 {
            bail!("notifications.broadcast_capacity must be at least 1");
        }
        for (i, a) in self.quotas.iter().enumerate() {
            if self.quotas[i + 1..]
                .iter()
                .any(|b| a.scope == b.scope && a.id == b.id)
            {
                bail!("duplicate quota for {:?} {}", a.scope, a.id);
            }
        }
        Ok(())
    }
}
