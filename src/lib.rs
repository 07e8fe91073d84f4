//! lab-sandbox: quota-aware provisioning of ephemeral lab containers.
//!
//! A provisioning request is admitted under a per-requester lock against the
//! applicable quota, recorded as a container in `creating`, and then launched
//! by the operation workers, which wait for the instance to report a global
//! IPv4 address before moving it to `running`. Start, stop, snapshot and
//! delete run through the same queue.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod lock;
pub mod logging;
pub mod model;
pub mod paths;
pub mod queue;
pub mod quota;
pub mod vm;

pub use engine::{Engine, ProvisionRequest};
pub use error::{EngineError, Layer, Result};
