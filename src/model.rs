//! Core records shared by every component of the engine.
//!
//! These are plain data types: the quota ledger, lifecycle manager and
//! operation queue own the tables that hold them, and all mutation goes
//! through those components.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The user (optionally scoped to a team) on whose behalf quota is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Requester {
    pub user_id: u64,
    pub team_id: Option<u64>,
}

impl Requester {
    pub fn user(user_id: u64) -> Self {
        Self { user_id, team_id: None }
    }

    pub fn in_team(user_id: u64, team_id: u64) -> Self {
        Self { user_id, team_id: Some(team_id) }
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.team_id {
            Some(team) => write!(f, "user:{}/team:{}", self.user_id, team),
            None => write!(f, "user:{}", self.user_id),
        }
    }
}

/// Who asked for a mutation. Passed explicitly on every call that changes
/// state so audit rows always name their author.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    User(u64),
    System,
}

impl From<Requester> for Actor {
    fn from(requester: Requester) -> Self {
        Actor::User(requester.user_id)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{id}"),
            Actor::System => f.write_str("system"),
        }
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Resources a single provisioning request asks to reserve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demand {
    pub cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
}

impl Demand {
    pub fn new(cores: u32, memory_mb: u64, disk_mb: u64) -> Self {
        Self { cores, memory_mb, disk_mb }
    }
}

impl fmt::Display for Demand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cores, {} MB RAM, {} MB disk",
            self.cores, self.memory_mb, self.disk_mb
        )
    }
}

/// Whether a quota record applies to a single user or to a whole team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaScope {
    User,
    Team,
}

/// Ceiling on what a user or team may hold at once. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub scope: QuotaScope,
    pub id: u64,
    #[serde(default)]
    pub cores_limit: Option<u32>,
    #[serde(default)]
    pub memory_mb_limit: Option<u64>,
    #[serde(default)]
    pub disk_mb_limit: Option<u64>,
    #[serde(default)]
    pub max_concurrent_containers: Option<u32>,
}

/// Running totals for one requester within one accounting period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub requester: Requester,
    /// Calendar day (UTC) the counter accumulates for.
    pub period: NaiveDate,
    pub cores_used: u64,
    pub memory_mb_used: u64,
    pub storage_mb_used: u64,
    pub concurrent_containers: u32,
}

impl UsageCounter {
    pub fn empty(requester: Requester, period: NaiveDate) -> Self {
        Self {
            requester,
            period,
            cores_used: 0,
            memory_mb_used: 0,
            storage_mb_used: 0,
            concurrent_containers: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(pub u64);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ct-{}", self.0)
    }
}

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Running,
    Stopped,
    Failed,
    Deleting,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Creating,
        Status::Running,
        Status::Stopped,
        Status::Failed,
        Status::Deleting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Creating => "creating",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Failed => "failed",
            Status::Deleting => "deleting",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    /// Unique among active containers; also the runtime instance name.
    pub name: String,
    pub requester: Requester,
    pub demand: Demand,
    pub status: Status,
    pub address: Option<Ipv4Addr>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Accounting period whose usage counter holds this container's demand.
    pub reserved_period: NaiveDate,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Operation queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// A long-running container action executed by the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Start,
    Stop,
    Snapshot,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Snapshot => "snapshot",
            Operation::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl EntryStatus {
    /// Completed or failed; the entry will not run again.
    pub fn is_finished(self) -> bool {
        matches!(self, EntryStatus::Completed | EntryStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub container: ContainerId,
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub status: EntryStatus,
    pub attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The row was inserted in its initial status.
    Inserted,
    Applied,
    NoOp,
    Rejected,
}

/// Append-only record of one attempted status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub container: ContainerId,
    pub old_status: Option<Status>,
    pub new_status: Status,
    pub changed_by: Actor,
    pub reason: String,
    pub outcome: TransitionOutcome,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Provisioning output
// ---------------------------------------------------------------------------

/// SSH material handed back to the caller. `private_key` is only present
/// when the engine generated the keypair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshCredential {
    pub user: String,
    pub public_key: String,
    pub private_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningResult {
    pub container: ContainerId,
    pub name: String,
    pub address: Ipv4Addr,
    pub ssh_port: u16,
    pub credential: SshCredential,
    /// `None` when the best-effort host key fetch did not succeed.
    pub host_key_fingerprint: Option<String>,
}

/// Connection tuple for the interactive shell relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellTarget {
    pub host: Ipv4Addr,
    pub port: u16,
    pub user: String,
}
