//! Everything that touches the container runtime.
//!
//! [`runtime`] is the narrow contract the engine depends on plus the LXD
//! implementation; [`boot_config`] and [`credentials`] build what a new
//! instance boots with; [`provisioning`] drives an instance from launch to
//! reachable and executes queued container operations.

pub mod boot_config;
pub mod credentials;
pub mod provisioning;
pub mod runtime;

pub use provisioning::{CreatePayload, DriverSettings, ProvisioningDriver, Readiness};
pub use runtime::{ContainerRuntime, InstanceState, LaunchSpec, LxcRuntime, RuntimeError};
