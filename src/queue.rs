//! Operation queue and worker pool.
//!
//! Entries are claimed by flipping them `pending → in_progress` under the
//! queue mutex, so exactly one worker ever owns an entry. Only one entry per
//! container is in flight at a time, which keeps a container's operations in
//! `scheduled_at` order. Failed entries go back to `pending` with exponential
//! backoff until the attempt ceiling, then stay `failed` and the handler is
//! told once. Finished entries are dropped when their container's delete
//! completes, and beyond `retain_finished` the oldest are evicted.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, Result};
use crate::model::{ContainerId, EntryId, EntryStatus, Operation, QueueEntry};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Executions allowed before an entry is failed permanently.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long an idle worker sleeps before re-checking for due entries.
    pub idle_poll: Duration,
    /// Completed and failed entries kept for inspection.
    pub retain_finished: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
            idle_poll: Duration::from_millis(500),
            retain_finished: 1024,
        }
    }
}

impl QueueConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_max, |d| d.min(self.backoff_max))
    }
}

/// What happened to an entry after a failed execution.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    Retry { attempt: u32, next_at: DateTime<Utc> },
    Exhausted { attempts: u32 },
}

#[derive(Debug)]
pub struct OperationQueue {
    entries: Mutex<BTreeMap<EntryId, QueueEntry>>,
    next_id: AtomicU64,
    wake: Notify,
    config: QueueConfig,
}

impl OperationQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            wake: Notify::new(),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<EntryId, QueueEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(
        &self,
        container: ContainerId,
        operation: Operation,
        payload: serde_json::Value,
        scheduled_at: DateTime<Utc>,
    ) -> EntryId {
        let id = EntryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().insert(
            id,
            QueueEntry {
                id,
                container,
                operation,
                payload,
                status: EntryStatus::Pending,
                attempts: 0,
                scheduled_at,
                last_error: None,
            },
        );
        debug!(entry = %id, container = %container, %operation, "operation enqueued");
        self.wake.notify_one();
        id
    }

    /// Claim the earliest due pending entry whose container has nothing else
    /// in flight.
    pub fn dequeue_next(&self) -> Option<QueueEntry> {
        let now = Utc::now();
        let mut entries = self.entries();

        let busy: HashSet<ContainerId> = entries
            .values()
            .filter(|e| e.status == EntryStatus::InProgress)
            .map(|e| e.container)
            .collect();

        let next = entries
            .values()
            .filter(|e| {
                e.status == EntryStatus::Pending
                    && e.scheduled_at <= now
                    && !busy.contains(&e.container)
            })
            .min_by_key(|e| (e.scheduled_at, e.id))
            .map(|e| e.id)?;

        let entry = entries.get_mut(&next)?;
        entry.status = EntryStatus::InProgress;
        Some(entry.clone())
    }

    /// Claim a specific entry. Fails unless it is currently `pending`.
    pub fn mark_in_progress(&self, id: EntryId) -> Result<QueueEntry> {
        let mut entries = self.entries();
        let entry = entries.get_mut(&id).ok_or(EngineError::UnknownEntry(id))?;
        if entry.status != EntryStatus::Pending {
            return Err(EngineError::NotClaimable(id));
        }
        entry.status = EntryStatus::InProgress;
        Ok(entry.clone())
    }

    pub fn mark_completed(&self, id: EntryId) -> Result<()> {
        {
            let mut entries = self.entries();
            let entry = in_progress(&mut entries, id)?;
            entry.status = EntryStatus::Completed;
            entry.last_error = None;
            if entry.operation == Operation::Delete {
                let container = entry.container;
                entries.retain(|_, e| e.container != container || !e.status.is_finished());
            }
            self.evict_finished(&mut entries);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Record a failed execution. Retryable failures under the ceiling are
    /// rescheduled; everything else is failed permanently.
    pub fn mark_failed(
        &self,
        id: EntryId,
        error: &str,
        retryable: bool,
    ) -> Result<FailureDisposition> {
        let disposition = {
            let mut entries = self.entries();
            let entry = in_progress(&mut entries, id)?;
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());

            let disposition = if retryable && entry.attempts < self.config.max_attempts {
                let delay = self.config.backoff(entry.attempts);
                let next_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::days(1));
                entry.status = EntryStatus::Pending;
                entry.scheduled_at = next_at;
                FailureDisposition::Retry { attempt: entry.attempts, next_at }
            } else {
                entry.status = EntryStatus::Failed;
                FailureDisposition::Exhausted { attempts: entry.attempts }
            };
            self.evict_finished(&mut entries);
            disposition
        };
        self.wake.notify_one();
        Ok(disposition)
    }

    /// Drop the oldest finished entries beyond the retention limit.
    fn evict_finished(&self, entries: &mut BTreeMap<EntryId, QueueEntry>) {
        let finished: Vec<EntryId> = entries
            .values()
            .filter(|e| e.status.is_finished())
            .map(|e| e.id)
            .collect();
        let excess = finished.len().saturating_sub(self.config.retain_finished);
        for id in &finished[..excess] {
            entries.remove(id);
        }
    }

    pub fn get(&self, id: EntryId) -> Option<QueueEntry> {
        self.entries().get(&id).cloned()
    }

    pub fn entries_for(&self, container: ContainerId) -> Vec<QueueEntry> {
        self.entries()
            .values()
            .filter(|e| e.container == container)
            .cloned()
            .collect()
    }

    /// Whether the container has work that is still pending or running.
    pub fn has_open_entries(&self, container: ContainerId) -> bool {
        self.entries().values().any(|e| {
            e.container == container
                && matches!(e.status, EntryStatus::Pending | EntryStatus::InProgress)
        })
    }

    async fn wait_for_work(&self) {
        self.wake.notified().await;
    }
}

fn in_progress(
    entries: &mut BTreeMap<EntryId, QueueEntry>,
    id: EntryId,
) -> Result<&mut QueueEntry> {
    let entry = entries.get_mut(&id).ok_or(EngineError::UnknownEntry(id))?;
    if entry.status != EntryStatus::InProgress {
        return Err(EngineError::NotInProgress(id));
    }
    Ok(entry)
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Executes claimed entries on behalf of the pool.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn execute(&self, entry: &QueueEntry) -> Result<()>;

    /// Called exactly once when an entry is failed permanently.
    async fn on_permanent_failure(&self, entry: &QueueEntry, error: &EngineError);
}

/// Spawn `size` workers that drain `queue` until `shutdown` is cancelled.
pub fn spawn_workers(
    queue: Arc<OperationQueue>,
    handler: Arc<dyn OperationHandler>,
    size: usize,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    info!(workers = size, "starting operation workers");
    (0..size.max(1))
        .map(|worker| {
            tokio::spawn(worker_loop(
                worker,
                Arc::clone(&queue),
                Arc::clone(&handler),
                shutdown.clone(),
            ))
        })
        .collect()
}

async fn worker_loop(
    worker: usize,
    queue: Arc<OperationQueue>,
    handler: Arc<dyn OperationHandler>,
    shutdown: CancellationToken,
) {
    let idle_poll = queue.config().idle_poll;
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        match queue.dequeue_next() {
            Some(entry) => run_entry(worker, &queue, handler.as_ref(), entry).await,
            None => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = queue.wait_for_work() => {}
                    _ = tokio::time::sleep(idle_poll) => {}
                }
            }
        }
    }
    debug!(worker, "operation worker stopped");
}

async fn run_entry(
    worker: usize,
    queue: &OperationQueue,
    handler: &dyn OperationHandler,
    entry: QueueEntry,
) {
    debug!(worker, entry = %entry.id, container = %entry.container, operation = %entry.operation, "executing");

    let err = match handler.execute(&entry).await {
        Ok(()) => {
            if let Err(e) = queue.mark_completed(entry.id) {
                error!(entry = %entry.id, error = %e, "could not complete entry");
            }
            return;
        }
        Err(err) => err,
    };

    let disposition = match queue.mark_failed(entry.id, &err.to_string(), err.is_transient()) {
        Ok(d) => d,
        Err(e) => {
            error!(entry = %entry.id, error = %e, "could not record failure");
            return;
        }
    };

    match disposition {
        FailureDisposition::Retry { attempt, next_at } => {
            warn!(
                entry = %entry.id,
                container = %entry.container,
                operation = %entry.operation,
                attempt,
                %next_at,
                error = %err,
                "operation failed, will retry"
            );
        }
        FailureDisposition::Exhausted { attempts } => {
            let final_entry = queue.get(entry.id).unwrap_or(entry);
            let err = if err.is_transient() {
                EngineError::OperationRetryExhausted {
                    entry: final_entry.id,
                    container: final_entry.container,
                    operation: final_entry.operation,
                    attempts,
                    last_error: err.to_string(),
                }
            } else {
                err
            };
            error!(
                entry = %final_entry.id,
                container = %final_entry.container,
                operation = %final_entry.operation,
                attempts,
                error = %err,
                "operation failed permanently"
            );
            handler.on_permanent_failure(&final_entry, &err).await;
        }
    }
}
