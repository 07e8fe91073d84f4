//! Request API: admission, provisioning and queued container operations.
//!
//! ## Control flow
//!
//! ```text
//! provision(request)
//!   ├─ validate (name, demand, supplied key)
//!   ├─ LockCoordinator::with_lock(requester)      ── serialised per requester
//!   │     ├─ name check
//!   │     ├─ QuotaLedger::check_and_reserve_at
//!   │     └─ LifecycleManager::insert  → creating
//!   ├─ ProvisioningDriver::prepare                 ── credential + cloud-config
//!   ├─ OperationQueue::enqueue(create)
//!   └─ await driver outcome                        ── running | failed
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{EngineConfig, NotificationConfig};
use crate::error::{EngineError, Result};
use crate::events::{BroadcastSink, Event, EventSink, EventType, FanoutSink, LogSink, WebhookSink, deliver};
use crate::lifecycle::{LifecycleManager, can_transition};
use crate::lock::LockCoordinator;
use crate::model::{
    Actor, Container, ContainerId, Demand, EntryId, Operation, ProvisioningResult, Requester,
    ShellTarget, Status,
};
use crate::queue::{self, OperationQueue};
use crate::quota::{QuotaLedger, current_period};
use crate::vm::credentials;
use crate::vm::{ContainerRuntime, ProvisioningDriver};

/// One provisioning request as it arrives from the CLI or an API caller.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub name: String,
    pub requester: Requester,
    pub demand: Demand,
    /// Catalog ids, installed in this order. Unknown ids are skipped.
    pub dependencies: Vec<String>,
    /// Caller-supplied OpenSSH public key; a keypair is generated when absent.
    pub public_key: Option<String>,
}

/// Largest single-container demand accepted before quota is consulted.
pub const MAX_CORES: u32 = 1024;
pub const MAX_MEMORY_MB: u64 = 1 << 22;
pub const MAX_DISK_MB: u64 = 1 << 26;

/// Hostname-safe: 1..=63 of `[a-z0-9-]`, no leading or trailing `-`.
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if ok {
        Ok(())
    } else {
        Err(EngineError::InvalidRequest(format!(
            "name {name:?} must be 1-63 characters of a-z, 0-9 and '-', not starting or ending with '-'"
        )))
    }
}

fn validate_request(request: &ProvisionRequest) -> Result<()> {
    validate_name(&request.name)?;
    if request.demand.cores == 0 {
        return Err(EngineError::InvalidRequest("at least one core is required".into()));
    }
    if request.demand.memory_mb == 0 {
        return Err(EngineError::InvalidRequest("memory must be positive".into()));
    }
    let demand = &request.demand;
    if demand.cores > MAX_CORES || demand.memory_mb > MAX_MEMORY_MB || demand.disk_mb > MAX_DISK_MB {
        return Err(EngineError::InvalidRequest(format!(
            "demand {demand} exceeds the per-container maximum of {MAX_CORES} cores, \
             {MAX_MEMORY_MB} MiB memory and {MAX_DISK_MB} MiB disk"
        )));
    }
    if let Some(key) = &request.public_key {
        credentials::validate_public_key(key)?;
    }
    Ok(())
}

/// Log sink always; broadcast sink always; webhook when configured.
///
/// Returns the combined sink and the broadcast half for in-process
/// subscribers.
pub fn event_sinks(
    config: &NotificationConfig,
) -> anyhow::Result<(Arc<dyn EventSink>, Arc<BroadcastSink>)> {
    let broadcast = Arc::new(BroadcastSink::new(config.broadcast_capacity));
    let mut fanout = FanoutSink::new()
        .with(Arc::new(LogSink))
        .with(Arc::clone(&broadcast) as Arc<dyn EventSink>);
    if let Some(url) = &config.webhook_url {
        fanout = fanout.with(Arc::new(WebhookSink::new(url.clone())?));
    }
    Ok((Arc::new(fanout), broadcast))
}

/// Outcome of the locked part of admission.
enum Admission {
    Granted(Container, Event),
    Denied(EngineError, &'static str),
}

pub struct Engine {
    ledger: Arc<QuotaLedger>,
    locks: LockCoordinator,
    lifecycle: Arc<LifecycleManager>,
    queue: Arc<OperationQueue>,
    driver: Arc<ProvisioningDriver>,
    sink: Arc<dyn EventSink>,
    lock_timeout: Duration,
    workers: usize,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        runtime: Arc<dyn ContainerRuntime>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let ledger = Arc::new(QuotaLedger::with_quotas(config.quotas.iter().cloned()));
        let lifecycle = Arc::new(LifecycleManager::new(Arc::clone(&sink)));
        let queue = Arc::new(OperationQueue::new(config.queue.queue_config()));
        let driver = Arc::new(ProvisioningDriver::new(
            runtime,
            Arc::clone(&lifecycle),
            Arc::clone(&ledger),
            Arc::clone(&sink),
            config.provisioning.driver_settings(),
        ));

        Self {
            ledger,
            locks: LockCoordinator::new(config.admission.lock_retry_interval()),
            lifecycle,
            queue,
            driver,
            sink,
            lock_timeout: config.admission.lock_timeout(),
            workers: config.queue.workers,
        }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Start the operation workers. They run until `shutdown` is cancelled.
    pub fn spawn_workers(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        queue::spawn_workers(
            Arc::clone(&self.queue),
            Arc::clone(&self.driver) as Arc<dyn queue::OperationHandler>,
            self.workers,
            shutdown,
        )
    }

    pub async fn container(&self, id: ContainerId) -> Result<Container> {
        self.lifecycle
            .get(id)
            .await
            .ok_or(EngineError::UnknownContainer(id))
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Admit `request` and create its container row in `creating`.
    ///
    /// The decision runs under the requester's reservation lock; nothing is
    /// mutated when an error is returned. Events are published only after
    /// the lock is released.
    pub async fn admit(&self, request: &ProvisionRequest) -> Result<Container> {
        validate_request(request)?;
        let requester = request.requester;
        let actor = Actor::from(requester);

        let decision = self
            .locks
            .with_lock(&requester, self.lock_timeout, || async {
                if self.lifecycle.name_in_use(&request.name).await {
                    return Ok(Admission::Denied(
                        EngineError::NameInUse(request.name.clone()),
                        "name in use",
                    ));
                }

                let period = current_period();
                if !self
                    .ledger
                    .check_and_reserve_at(&requester, &request.demand, period)
                    .await
                {
                    return Ok(Admission::Denied(
                        EngineError::QuotaExceeded {
                            requester,
                            demand: request.demand,
                        },
                        "quota exceeded",
                    ));
                }

                // Another requester may have taken the name since the check.
                match self
                    .lifecycle
                    .insert_deferred(&request.name, requester, request.demand, period, &actor)
                    .await
                {
                    Ok((container, created)) => Ok(Admission::Granted(container, created)),
                    Err(e) => {
                        self.ledger.release(&requester, &request.demand, period).await;
                        Ok(Admission::Denied(e, "name in use"))
                    }
                }
            })
            .await?;

        match decision {
            Admission::Granted(container, created) => {
                info!(container = %container.id, name = %container.name, requester = %requester, "admission granted");
                deliver(self.sink.as_ref(), created).await;
                deliver(
                    self.sink.as_ref(),
                    Event::new(
                        requester.user_id,
                        EventType::AdmissionGranted,
                        json!({
                            "container": container.id,
                            "name": container.name,
                            "demand": request.demand,
                        }),
                    ),
                )
                .await;
                Ok(container)
            }
            Admission::Denied(err, reason) => {
                self.admission_denied(request, reason).await;
                Err(err)
            }
        }
    }

    async fn admission_denied(&self, request: &ProvisionRequest, reason: &str) {
        info!(name = %request.name, requester = %request.requester, reason, "admission denied");
        deliver(
            self.sink.as_ref(),
            Event::new(
                request.requester.user_id,
                EventType::AdmissionDenied,
                json!({
                    "name": request.name,
                    "demand": request.demand,
                    "reason": reason,
                }),
            ),
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Provisioning
    // -----------------------------------------------------------------------

    /// Admit, launch and wait for `request` to become reachable.
    ///
    /// Cancelling `cancel` before readiness tears the partial instance down
    /// and returns [`EngineError::Cancelled`]. Requires workers started with
    /// [`spawn_workers`](Self::spawn_workers).
    pub async fn provision(
        &self,
        request: ProvisionRequest,
        cancel: &CancellationToken,
    ) -> Result<ProvisioningResult> {
        let container = self.admit(&request).await?;

        let prepared = self
            .driver
            .prepare(&request.name, &request.dependencies, request.public_key.as_deref())
            .await;
        let (credential, payload) = match prepared {
            Ok(p) => p,
            Err(e) => {
                warn!(container = %container.id, error = %e, "preparation failed");
                self.lifecycle
                    .transition(container.id, Status::Failed, &Actor::System, &format!("preparation failed: {e}"))
                    .await?;
                return Err(e);
            }
        };

        let outcome = self.driver.track(container.id, cancel);
        let payload = serde_json::to_value(&payload)
            .map_err(|e| EngineError::Provisioning(format!("encoding create payload: {e}")))?;
        let entry = self
            .queue
            .enqueue(container.id, Operation::Create, payload, Utc::now());
        info!(container = %container.id, entry = %entry, "provisioning queued");

        let readiness = outcome.await.map_err(|_| {
            EngineError::Provisioning(format!("driver dropped {} without an outcome", container.id))
        })??;

        Ok(ProvisioningResult {
            container: container.id,
            name: container.name,
            address: readiness.address,
            ssh_port: self.driver.settings().ssh_port,
            credential,
            host_key_fingerprint: readiness.host_key_fingerprint,
        })
    }

    /// Abort in-flight provisioning of `id`.
    pub fn cancel(&self, id: ContainerId) -> bool {
        self.driver.cancel(id)
    }

    // -----------------------------------------------------------------------
    // Queued operations
    // -----------------------------------------------------------------------

    /// Queue a start of a `stopped` container. `Ok(None)` when it is already
    /// running.
    pub async fn start(&self, id: ContainerId, actor: &Actor) -> Result<Option<EntryId>> {
        self.request_change(id, Operation::Start, Status::Stopped, Status::Running, actor)
            .await
    }

    /// Queue a stop of a `running` container. `Ok(None)` when it is already
    /// stopped.
    pub async fn stop(&self, id: ContainerId, actor: &Actor) -> Result<Option<EntryId>> {
        self.request_change(id, Operation::Stop, Status::Running, Status::Stopped, actor)
            .await
    }

    async fn request_change(
        &self,
        id: ContainerId,
        operation: Operation,
        from: Status,
        to: Status,
        actor: &Actor,
    ) -> Result<Option<EntryId>> {
        let container = self.container(id).await?;
        let reason = format!("{operation} requested");

        if container.status == to {
            self.lifecycle.transition(id, to, actor, &reason).await?;
            return Ok(None);
        }
        if container.status != from {
            if !can_transition(container.status, to) {
                // Records the refusal and returns InvalidTransition.
                self.lifecycle.transition(id, to, actor, &reason).await?;
            }
            return Err(EngineError::InvalidRequest(format!(
                "{id} is {}; {operation} needs it {from}",
                container.status
            )));
        }

        let entry = self
            .queue
            .enqueue(id, operation, json!({ "actor": actor }), Utc::now());
        Ok(Some(entry))
    }

    /// Queue a runtime snapshot of a `running` or `stopped` container.
    pub async fn snapshot(&self, id: ContainerId, snapshot: &str, actor: &Actor) -> Result<EntryId> {
        validate_name(snapshot)?;
        let container = self.container(id).await?;
        if !matches!(container.status, Status::Running | Status::Stopped) {
            return Err(EngineError::InvalidRequest(format!(
                "{id} is {}; snapshots need it running or stopped",
                container.status
            )));
        }
        Ok(self.queue.enqueue(
            id,
            Operation::Snapshot,
            json!({ "snapshot": snapshot, "actor": actor }),
            Utc::now(),
        ))
    }

    /// Move `id` to `deleting`, cancel any in-flight provisioning and queue
    /// the teardown. The container is archived and its quota released once
    /// the teardown completes.
    pub async fn delete(&self, id: ContainerId, actor: &Actor) -> Result<EntryId> {
        let container = self.container(id).await?;
        self.lifecycle
            .transition(id, Status::Deleting, actor, "delete requested")
            .await?;
        if self.driver.cancel(id) {
            info!(container = %id, "in-flight provisioning cancelled by delete");
        }
        let entry = self
            .queue
            .enqueue(id, Operation::Delete, json!({ "actor": actor }), Utc::now());
        info!(container = %id, name = %container.name, entry = %entry, "delete queued");
        Ok(entry)
    }

    // -----------------------------------------------------------------------
    // Maintenance and relay
    // -----------------------------------------------------------------------

    /// Fail containers stuck in `creating` for longer than `max_age` with no
    /// queued or running work. Returns the containers that were failed.
    pub async fn fail_stalled(&self, max_age: Duration) -> Vec<ContainerId> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = Utc::now() - max_age;

        let mut failed = Vec::new();
        for id in self.lifecycle.creating_before(cutoff).await {
            if self.queue.has_open_entries(id) {
                continue;
            }
            match self
                .lifecycle
                .transition(id, Status::Failed, &Actor::System, "stalled in creating")
                .await
            {
                Ok(_) => {
                    warn!(container = %id, "stalled container failed");
                    self.driver.abandon(id, "stalled in creating");
                    failed.push(id);
                }
                Err(e) => warn!(container = %id, error = %e, "could not fail stalled container"),
            }
        }
        failed
    }

    /// Connection tuple for the shell relay. Only `running` containers with
    /// a known address have one.
    pub async fn shell_target(&self, id: ContainerId) -> Result<ShellTarget> {
        let container = self.container(id).await?;
        match (container.status, container.address) {
            (Status::Running, Some(host)) => Ok(ShellTarget {
                host,
                port: self.driver.settings().ssh_port,
                user: self.driver.settings().admin_user.clone(),
            }),
            (status, _) => Err(EngineError::InvalidRequest(format!(
                "{id} is {status} and has no shell target"
            ))),
        }
    }
}
