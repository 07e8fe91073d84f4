//! Provisioning driver: takes a `creating` container to `running`.
//!
//! The driver is the operation queue's handler. A `create` entry runs the
//! slow half of provisioning:
//!
//! 1. launch the instance from the configured image with the rendered
//!    cloud-config;
//! 2. poll the runtime until a global-scope IPv4 address appears or the
//!    readiness timeout elapses;
//! 3. fetch the host key fingerprint (best-effort);
//! 4. move the container to `running`.
//!
//! Steps 1 and 2 are cancellable; cancelling mid-launch kills the `lxc`
//! process. Whatever ends them early (launch error,
//! timeout, cancellation) force-deletes the partially created instance before
//! the error is returned, so no runtime instance outlives its container row.
//!
//! The caller that enqueued the `create` entry waits on a oneshot channel
//! registered with [`ProvisioningDriver::track`]; the driver resolves it when
//! the entry succeeds or fails permanently.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::events::{Event, EventSink, EventType, deliver};
use crate::lifecycle::LifecycleManager;
use crate::model::{Actor, ContainerId, Operation, QueueEntry, SshCredential, Status};
use crate::queue::OperationHandler;
use crate::quota::QuotaLedger;
use crate::vm::boot_config;
use crate::vm::credentials;
use crate::vm::runtime::{ContainerRuntime, LaunchSpec};

/// Host key whose fingerprint is reported back to the caller.
const HOST_KEY_PATH: &str = "/etc/ssh/ssh_host_ed25519_key.pub";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Image alias passed to the runtime, e.g. `ubuntu:22.04`.
    pub image: String,
    /// The single non-root account created by cloud-init.
    pub admin_user: String,
    pub ssh_port: u16,
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            image: "ubuntu:22.04".into(),
            admin_user: "labuser".into(),
            ssh_port: 22,
            poll_interval: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(120),
        }
    }
}

/// What a successful `create` entry hands back to the waiting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub address: Ipv4Addr,
    pub host_key_fingerprint: Option<String>,
}

/// Payload of a `create` queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePayload {
    pub image: String,
    pub boot_config: String,
}

struct Inflight {
    cancel: CancellationToken,
    waiter: Option<oneshot::Sender<Result<Readiness>>>,
}

pub struct ProvisioningDriver {
    runtime: Arc<dyn ContainerRuntime>,
    lifecycle: Arc<LifecycleManager>,
    ledger: Arc<QuotaLedger>,
    sink: Arc<dyn EventSink>,
    settings: DriverSettings,
    inflight: Mutex<HashMap<ContainerId, Inflight>>,
}

impl ProvisioningDriver {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        lifecycle: Arc<LifecycleManager>,
        ledger: Arc<QuotaLedger>,
        sink: Arc<dyn EventSink>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            runtime,
            lifecycle,
            ledger,
            sink,
            settings,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<ContainerId, Inflight>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Preparation (runs on the caller's task)
    // -----------------------------------------------------------------------

    /// Credential preparation and boot configuration assembly.
    ///
    /// Returns the credential to hand back to the caller and the `create`
    /// payload to enqueue.
    pub async fn prepare(
        &self,
        name: &str,
        dependencies: &[String],
        supplied_key: Option<&str>,
    ) -> Result<(SshCredential, CreatePayload)> {
        let credential =
            credentials::prepare(&self.settings.admin_user, supplied_key, &format!("labctl@{name}"))
                .await?;
        let boot_config =
            boot_config::render(&self.settings.admin_user, &credential.public_key, dependencies)?;
        debug!(name, dependencies = ?dependencies, bytes = boot_config.len(), "boot config rendered");

        Ok((
            credential,
            CreatePayload {
                image: self.settings.image.clone(),
                boot_config,
            },
        ))
    }

    /// Register interest in the outcome of `id`'s `create` entry.
    ///
    /// Cancelling `parent` (or calling [`cancel`](Self::cancel)) aborts the
    /// launch and readiness wait.
    pub fn track(
        &self,
        id: ContainerId,
        parent: &CancellationToken,
    ) -> oneshot::Receiver<Result<Readiness>> {
        let (tx, rx) = oneshot::channel();
        self.inflight().insert(
            id,
            Inflight {
                cancel: parent.child_token(),
                waiter: Some(tx),
            },
        );
        rx
    }

    /// Abort in-flight provisioning of `id`. Returns whether anything was
    /// in flight.
    pub fn cancel(&self, id: ContainerId) -> bool {
        match self.inflight().get(&id) {
            Some(inflight) => {
                info!(container = %id, "cancelling provisioning");
                inflight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_token(&self, id: ContainerId) -> CancellationToken {
        self.inflight()
            .entry(id)
            .or_insert_with(|| Inflight {
                cancel: CancellationToken::new(),
                waiter: None,
            })
            .cancel
            .clone()
    }

    fn finish(&self, id: ContainerId, outcome: Result<Readiness>) {
        let waiter = self.inflight().remove(&id).and_then(|i| i.waiter);
        if let Some(tx) = waiter {
            // The caller may have given up waiting.
            let _ = tx.send(outcome);
        }
    }

    /// Fail an outstanding waiter without touching the container row.
    pub fn abandon(&self, id: ContainerId, reason: &str) {
        self.finish(id, Err(EngineError::Provisioning(reason.to_string())));
    }

    // -----------------------------------------------------------------------
    // Launch and readiness
    // -----------------------------------------------------------------------

    /// Launch `spec` and wait for it to become reachable.
    pub async fn launch_and_wait(
        &self,
        spec: &LaunchSpec,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr> {
        let launched = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.runtime.launch(spec) => Some(result),
        };
        match launched {
            None => {
                warn!(name = %spec.name, "cancelled during launch, tearing down");
                self.teardown(&spec.name).await;
                return Err(EngineError::Cancelled { name: spec.name.clone() });
            }
            Some(Err(e)) => {
                warn!(name = %spec.name, error = %e, "launch failed");
                self.teardown(&spec.name).await;
                return Err(EngineError::LaunchFailure {
                    name: spec.name.clone(),
                    reason: e.to_string(),
                });
            }
            Some(Ok(())) => {}
        }

        let result = if cancel.is_cancelled() {
            Err(EngineError::Cancelled { name: spec.name.clone() })
        } else {
            self.wait_for_address(&spec.name, cancel).await
        };

        if let Err(e) = &result {
            warn!(name = %spec.name, error = %e, "readiness not reached, tearing down");
            self.teardown(&spec.name).await;
        }
        result
    }

    /// Poll the runtime until `name` reports a global IPv4 address.
    ///
    /// Query errors are logged and polling continues; only the deadline or
    /// cancellation end the wait without an address.
    pub async fn wait_for_address(&self, name: &str, cancel: &CancellationToken) -> Result<Ipv4Addr> {
        let started = Instant::now();
        let deadline = started + self.settings.ready_timeout;
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.runtime.query_state(name).await {
                Ok(state) => {
                    if let Some(address) = state.global_ipv4() {
                        info!(name, %address, polls, waited = ?started.elapsed(), "instance reachable");
                        return Ok(address);
                    }
                    debug!(name, status = %state.status, polls, "no global address yet");
                }
                Err(e) => warn!(name, polls, error = %e, "state query failed"),
            }

            if Instant::now() >= deadline {
                return Err(EngineError::ProvisioningTimeout {
                    name: name.to_string(),
                    timeout: self.settings.ready_timeout,
                });
            }

            let next = (Instant::now() + self.settings.poll_interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(EngineError::Cancelled { name: name.to_string() });
                }
                _ = tokio::time::sleep_until(next) => {}
            }
        }
    }

    /// SHA256 fingerprint of the instance's ed25519 host key, or `None` if
    /// it could not be read.
    pub async fn fetch_host_key_fingerprint(&self, name: &str) -> Option<String> {
        match self
            .runtime
            .exec_command(name, &["ssh-keygen", "-lf", HOST_KEY_PATH])
            .await
        {
            // "256 SHA256:abc… root@host (ED25519)"
            Ok(out) => {
                let fingerprint = out.split_whitespace().nth(1).map(str::to_string);
                if fingerprint.is_none() {
                    debug!(name, output = %out.trim(), "unexpected ssh-keygen output");
                }
                fingerprint
            }
            Err(e) => {
                debug!(name, error = %e, "host key fingerprint unavailable");
                None
            }
        }
    }

    async fn teardown(&self, name: &str) {
        match self.runtime.delete(name).await {
            Ok(()) => info!(name, "partial instance removed"),
            Err(e) => error!(name, error = %e, "teardown failed; instance may be orphaned"),
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    async fn create(&self, entry: &QueueEntry) -> Result<()> {
        let container = self
            .lifecycle
            .get(entry.container)
            .await
            .ok_or(EngineError::UnknownContainer(entry.container))?;
        let cancel = self.cancel_token(container.id);
        if container.status != Status::Creating || cancel.is_cancelled() {
            return Err(EngineError::Cancelled { name: container.name });
        }

        let payload: CreatePayload = serde_json::from_value(entry.payload.clone()).map_err(|e| {
            EngineError::Provisioning(format!("malformed create payload for {}: {e}", container.id))
        })?;
        let spec = LaunchSpec {
            name: container.name.clone(),
            image: payload.image,
            boot_config: payload.boot_config,
            demand: container.demand,
        };

        let address = self.launch_and_wait(&spec, &cancel).await?;
        let host_key_fingerprint = self.fetch_host_key_fingerprint(&spec.name).await;

        self.lifecycle
            .mark_running(container.id, Some(address), &Actor::System, "instance reachable")
            .await?;
        if let Some(fp) = &host_key_fingerprint {
            self.lifecycle
                .set_metadata(container.id, "host_key_fingerprint", json!(fp))
                .await?;
        }

        self.finish(
            container.id,
            Ok(Readiness {
                address,
                host_key_fingerprint,
            }),
        );
        Ok(())
    }

    async fn start(&self, entry: &QueueEntry) -> Result<()> {
        let container = self
            .lifecycle
            .get(entry.container)
            .await
            .ok_or(EngineError::UnknownContainer(entry.container))?;
        self.runtime.start(&container.name).await?;
        let address = self
            .wait_for_address(&container.name, &CancellationToken::new())
            .await?;
        self.lifecycle
            .mark_running(container.id, Some(address), &payload_actor(entry), "started")
            .await?;
        Ok(())
    }

    async fn stop(&self, entry: &QueueEntry) -> Result<()> {
        let container = self
            .lifecycle
            .get(entry.container)
            .await
            .ok_or(EngineError::UnknownContainer(entry.container))?;
        self.runtime.stop(&container.name).await?;
        self.lifecycle
            .transition(container.id, Status::Stopped, &payload_actor(entry), "stopped")
            .await?;
        Ok(())
    }

    async fn snapshot(&self, entry: &QueueEntry) -> Result<()> {
        let container = self
            .lifecycle
            .get(entry.container)
            .await
            .ok_or(EngineError::UnknownContainer(entry.container))?;
        let snapshot = entry
            .payload
            .get("snapshot")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Provisioning("snapshot entry has no snapshot name".into()))?;

        self.runtime.snapshot(&container.name, snapshot).await?;
        self.lifecycle
            .set_metadata(
                container.id,
                "last_snapshot",
                json!({ "name": snapshot, "at": Utc::now() }),
            )
            .await?;
        info!(container = %container.id, snapshot, "snapshot taken");
        Ok(())
    }

    async fn delete(&self, entry: &QueueEntry) -> Result<()> {
        let Some(container) = self.lifecycle.get(entry.container).await else {
            debug!(container = %entry.container, "already archived");
            return Ok(());
        };

        self.runtime.delete(&container.name).await?;
        self.lifecycle.archive(container.id).await?;
        self.ledger
            .release(&container.requester, &container.demand, container.reserved_period)
            .await;
        self.finish(
            container.id,
            Err(EngineError::Cancelled { name: container.name.clone() }),
        );
        info!(container = %container.id, name = %container.name, "container deleted");
        Ok(())
    }
}

/// The user recorded on the entry, or the system when none was.
fn payload_actor(entry: &QueueEntry) -> Actor {
    entry
        .payload
        .get("actor")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(Actor::System)
}

/// Copy of `err` for the waiting caller; the queue keeps the original.
fn detach(err: &EngineError) -> EngineError {
    match err {
        EngineError::LaunchFailure { name, reason } => EngineError::LaunchFailure {
            name: name.clone(),
            reason: reason.clone(),
        },
        EngineError::ProvisioningTimeout { name, timeout } => EngineError::ProvisioningTimeout {
            name: name.clone(),
            timeout: *timeout,
        },
        EngineError::Cancelled { name } => EngineError::Cancelled { name: name.clone() },
        EngineError::OperationRetryExhausted {
            entry,
            container,
            operation,
            attempts,
            last_error,
        } => EngineError::OperationRetryExhausted {
            entry: *entry,
            container: *container,
            operation: *operation,
            attempts: *attempts,
            last_error: last_error.clone(),
        },
        EngineError::InvalidTransition { container, from, to } => EngineError::InvalidTransition {
            container: *container,
            from: *from,
            to: *to,
        },
        EngineError::UnknownContainer(id) => EngineError::UnknownContainer(*id),
        other => EngineError::Provisioning(other.to_string()),
    }
}

#[async_trait]
impl OperationHandler for ProvisioningDriver {
    async fn execute(&self, entry: &QueueEntry) -> Result<()> {
        match entry.operation {
            Operation::Create => self.create(entry).await,
            Operation::Start => self.start(entry).await,
            Operation::Stop => self.stop(entry).await,
            Operation::Snapshot => self.snapshot(entry).await,
            Operation::Delete => self.delete(entry).await,
        }
    }

    async fn on_permanent_failure(&self, entry: &QueueEntry, err: &EngineError) {
        let id = entry.container;
        let Some(container) = self.lifecycle.get(id).await else {
            self.finish(id, Err(detach(err)));
            return;
        };

        match container.status {
            Status::Creating => {
                let reason = format!("{} failed: {err}", entry.operation);
                if let Err(e) = self
                    .lifecycle
                    .transition(id, Status::Failed, &Actor::System, &reason)
                    .await
                {
                    error!(container = %id, error = %e, "could not mark container failed");
                }
            }
            Status::Deleting => {
                debug!(container = %id, operation = %entry.operation, "container is being deleted");
            }
            Status::Running | Status::Stopped | Status::Failed => {
                let record = json!({
                    "entry": entry.id,
                    "operation": entry.operation,
                    "error": err.to_string(),
                    "at": Utc::now(),
                });
                if let Err(e) = self.lifecycle.set_metadata(id, "last_operation_error", record).await {
                    error!(container = %id, error = %e, "could not record operation failure");
                }
            }
        }

        deliver(
            self.sink.as_ref(),
            Event::new(
                container.requester.user_id,
                EventType::OperationFailed,
                json!({
                    "container": id,
                    "name": container.name,
                    "entry": entry.id,
                    "operation": entry.operation,
                    "attempts": entry.attempts,
                    "layer": err.layer().to_string(),
                    "error": err.to_string(),
                }),
            ),
        )
        .await;

        if entry.operation == Operation::Create {
            self.finish(id, Err(detach(err)));
        }
    }
}
