//! Shared fixtures: an in-memory container runtime and a test-scaled config.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use lab_sandbox::config::EngineConfig;
use lab_sandbox::engine::{Engine, ProvisionRequest, event_sinks};
use lab_sandbox::events::BroadcastSink;
use lab_sandbox::model::{Container, ContainerId, Demand, Requester};
use lab_sandbox::vm::runtime::{
    ContainerRuntime, InstanceState, InterfaceAddress, LaunchSpec, NetworkInterface, RuntimeError,
};

pub const KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl test@lab";

pub const ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 55, 0, 2);

#[derive(Default)]
struct Calls {
    launches: Vec<String>,
    deletes: Vec<String>,
    starts: Vec<String>,
    stops: Vec<String>,
    snapshots: Vec<(String, String)>,
    polls: HashMap<String, u32>,
}

/// Runtime double. Reports [`ADDRESS`] from the `ready_on`th state query of
/// each instance onward; `None` never does.
#[derive(Default)]
pub struct FakeRuntime {
    ready_on: Option<u32>,
    fail_launch: bool,
    fail_stop: bool,
    calls: Mutex<Calls>,
}

impl FakeRuntime {
    pub fn ready_on(poll: u32) -> Self {
        Self {
            ready_on: Some(poll),
            ..Self::default()
        }
    }

    pub fn never_ready() -> Self {
        Self::default()
    }

    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn launches(&self) -> Vec<String> {
        self.calls.lock().unwrap().launches.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.calls.lock().unwrap().deletes.clone()
    }

    pub fn stops(&self) -> Vec<String> {
        self.calls.lock().unwrap().stops.clone()
    }

    pub fn starts(&self) -> Vec<String> {
        self.calls.lock().unwrap().starts.clone()
    }

    pub fn snapshots(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().snapshots.clone()
    }

    pub fn polls(&self, name: &str) -> u32 {
        self.calls.lock().unwrap().polls.get(name).copied().unwrap_or(0)
    }
}

fn failure(label: &str) -> RuntimeError {
    RuntimeError::Command {
        label: label.to_string(),
        code: Some(1),
        stderr: "simulated failure".into(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<(), RuntimeError> {
        self.calls.lock().unwrap().launches.push(spec.name.clone());
        if self.fail_launch {
            return Err(failure("lxc launch"));
        }
        Ok(())
    }

    async fn query_state(&self, name: &str) -> Result<InstanceState, RuntimeError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.polls.entry(name.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let mut addresses = vec![InterfaceAddress {
            family: "inet6".into(),
            address: "fe80::1".into(),
            scope: "link".into(),
        }];
        if self.ready_on.is_some_and(|ready| n >= ready) {
            addresses.push(InterfaceAddress {
                family: "inet".into(),
                address: ADDRESS.to_string(),
                scope: "global".into(),
            });
        }
        Ok(InstanceState {
            status: "Running".into(),
            interfaces: vec![NetworkInterface {
                name: "eth0".into(),
                addresses,
            }],
        })
    }

    async fn exec_command(&self, _name: &str, _cmd: &[&str]) -> Result<String, RuntimeError> {
        Ok("256 SHA256:fakefingerprint root@lab (ED25519)\n".into())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.calls.lock().unwrap().starts.push(name.to_string());
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.calls.lock().unwrap().stops.push(name.to_string());
        if self.fail_stop {
            return Err(failure("lxc stop"));
        }
        Ok(())
    }

    async fn snapshot(&self, name: &str, snapshot: &str) -> Result<(), RuntimeError> {
        self.calls
            .lock()
            .unwrap()
            .snapshots
            .push((name.to_string(), snapshot.to_string()));
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), RuntimeError> {
        self.calls.lock().unwrap().deletes.push(name.to_string());
        Ok(())
    }
}

/// 2s readiness polls against a 10s timeout; millisecond-scale lock retry
/// and queue backoff.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.admission.lock_retry_interval_ms = 10;
    config.queue.backoff_base_ms = 10;
    config.queue.backoff_max_ms = 40;
    config.queue.idle_poll_ms = 20;
    config.provisioning.ready_poll_interval_ms = 2000;
    config.provisioning.ready_timeout_secs = 10;
    config
}

pub fn engine(config: &EngineConfig, runtime: Arc<FakeRuntime>) -> (Engine, Arc<BroadcastSink>) {
    let (sink, broadcast) = event_sinks(&config.notifications).unwrap();
    (Engine::new(config, runtime, sink), broadcast)
}

pub fn request(name: &str, requester: Requester, cores: u32) -> ProvisionRequest {
    ProvisionRequest {
        name: name.to_string(),
        requester,
        demand: Demand::new(cores, 512, 2048),
        dependencies: vec!["node".into(), "redis".into()],
        public_key: Some(KEY.into()),
    }
}

pub async fn find(engine: &Engine, name: &str) -> Option<Container> {
    engine
        .lifecycle()
        .list_active()
        .await
        .into_iter()
        .find(|c| c.name == name)
}

/// Poll until `check` holds for the container (or it is gone, when
/// `check` accepts `None`). Panics after `limit` attempts.
pub async fn wait_for<F>(engine: &Engine, id: ContainerId, limit: u32, check: F) -> Option<Container>
where
    F: Fn(Option<&Container>) -> bool,
{
    for _ in 0..limit {
        let current = engine.lifecycle().get(id).await;
        if check(current.as_ref()) {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition on {id} not reached");
}
