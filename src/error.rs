//! Engine error taxonomy.
//!
//! Every variant belongs to exactly one [`Layer`], and the layer name leads
//! the rendered message so operators can tell "denied" (admission) apart from
//! "attempted and broke" (provisioning).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::model::{ContainerId, Demand, EntryId, Operation, Requester, Status};
use crate::vm::runtime::RuntimeError;

/// The part of the engine that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Admission,
    Lifecycle,
    Queue,
    Provisioning,
    Runtime,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Layer::Admission => "admission",
            Layer::Lifecycle => "lifecycle",
            Layer::Queue => "queue",
            Layer::Provisioning => "provisioning",
            Layer::Runtime => "runtime",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Admission rejected against the applicable quota; nothing was mutated.
    #[error("admission: quota exceeded for {requester} (requested {demand})")]
    QuotaExceeded { requester: Requester, demand: Demand },

    /// The requester lock could not be acquired in time; nothing was mutated.
    #[error("admission: reservation lock {key:#x} not acquired within {waited:?}")]
    LockTimeout { key: u64, waited: Duration },

    #[error("admission: container name {0:?} is already in use")]
    NameInUse(String),

    #[error("admission: invalid request: {0}")]
    InvalidRequest(String),

    #[error("lifecycle: container {container} cannot move from {from} to {to}")]
    InvalidTransition {
        container: ContainerId,
        from: Status,
        to: Status,
    },

    #[error("lifecycle: unknown container {0}")]
    UnknownContainer(ContainerId),

    #[error(
        "queue: {operation} on {container} failed after {attempts} attempts ({entry}): {last_error}"
    )]
    OperationRetryExhausted {
        entry: EntryId,
        container: ContainerId,
        operation: Operation,
        attempts: u32,
        last_error: String,
    },

    #[error("queue: unknown entry {0}")]
    UnknownEntry(EntryId),

    #[error("queue: entry {0} is not pending")]
    NotClaimable(EntryId),

    #[error("queue: entry {0} is not in progress")]
    NotInProgress(EntryId),

    #[error("provisioning: launch of {name:?} failed: {reason}")]
    LaunchFailure { name: String, reason: String },

    #[error("provisioning: {name:?} reported no global IPv4 address within {timeout:?}")]
    ProvisioningTimeout { name: String, timeout: Duration },

    #[error("provisioning: {name:?} was cancelled before it became ready")]
    Cancelled { name: String },

    #[error("provisioning: {0}")]
    Provisioning(String),

    #[error("runtime: {0}")]
    Runtime(#[from] RuntimeError),
}

impl EngineError {
    pub fn layer(&self) -> Layer {
        match self {
            EngineError::QuotaExceeded { .. }
            | EngineError::LockTimeout { .. }
            | EngineError::NameInUse(_)
            | EngineError::InvalidRequest(_) => Layer::Admission,
            EngineError::InvalidTransition { .. } | EngineError::UnknownContainer(_) => {
                Layer::Lifecycle
            }
            EngineError::OperationRetryExhausted { .. }
            | EngineError::UnknownEntry(_)
            | EngineError::NotClaimable(_)
            | EngineError::NotInProgress(_) => Layer::Queue,
            EngineError::LaunchFailure { .. }
            | EngineError::ProvisioningTimeout { .. }
            | EngineError::Cancelled { .. }
            | EngineError::Provisioning(_) => Layer::Provisioning,
            EngineError::Runtime(_) => Layer::Runtime,
        }
    }

    /// Whether the operation queue should schedule another attempt.
    ///
    /// A failed launch is torn down before the error is returned, so the next
    /// attempt starts from a clean slate.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Runtime(_) | EngineError::LockTimeout { .. } | EngineError::LaunchFailure { .. }
        )
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
