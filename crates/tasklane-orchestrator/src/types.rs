use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use tasklane_core::{ClaimId, TaskId, TasklaneError, WorkerId};
use tasklane_store::Metadata;

// --- Workers ---

/// Liveness status of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Dead,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Dead => "dead",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = TasklaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerStatus::Idle),
            "busy" => Ok(WorkerStatus::Busy),
            "dead" => Ok(WorkerStatus::Dead),
            other => Err(TasklaneError::Validation(format!(
                "unknown worker status '{other}'"
            ))),
        }
    }
}

/// A registered worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub hostname: String,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Input for [`crate::WorkerRegistry::register_worker`].
#[derive(Debug, Clone, Default)]
pub struct NewWorker {
    pub name: String,
    pub hostname: String,
    pub pid: Option<u32>,
    pub capabilities: Vec<String>,
    pub metadata: Metadata,
}

impl NewWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

// --- Claims ---

/// Claim lifecycle: `active` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Active,
    Released,
    Expired,
}

impl ClaimStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Active => "active",
            ClaimStatus::Released => "released",
            ClaimStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimStatus {
    type Err = TasklaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ClaimStatus::Active),
            "released" => Ok(ClaimStatus::Released),
            "expired" => Ok(ClaimStatus::Expired),
            other => Err(TasklaneError::Validation(format!(
                "unknown claim status '{other}'"
            ))),
        }
    }
}

/// A time-bounded exclusive right for one worker to work on one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub status: ClaimStatus,
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub renewed_count: u32,
}

impl Claim {
    /// Active and not yet past its lease.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ClaimStatus::Active && now <= self.lease_expires_at
    }
}

// --- Orchestrator state ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorStatus {
    Stopped,
    Starting,
    Running,
}

impl OrchestratorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrchestratorStatus::Stopped => "stopped",
            OrchestratorStatus::Starting => "starting",
            OrchestratorStatus::Running => "running",
        }
    }
}

impl fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrchestratorStatus {
    type Err = TasklaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(OrchestratorStatus::Stopped),
            "starting" => Ok(OrchestratorStatus::Starting),
            "running" => Ok(OrchestratorStatus::Running),
            other => Err(TasklaneError::Validation(format!(
                "unknown orchestrator status '{other}'"
            ))),
        }
    }
}

pub const DEFAULT_WORKER_POOL_SIZE: u32 = 1;
pub const DEFAULT_RECONCILE_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_LEASE_DURATION_MINUTES: u64 = 30;

/// The singleton control-loop row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub status: OrchestratorStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub worker_pool_size: u32,
    pub reconcile_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub lease_duration_minutes: u64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            status: OrchestratorStatus::Stopped,
            pid: None,
            started_at: None,
            last_reconcile_at: None,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            reconcile_interval_seconds: DEFAULT_RECONCILE_INTERVAL_SECONDS,
            heartbeat_interval_seconds: DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
            lease_duration_minutes: DEFAULT_LEASE_DURATION_MINUTES,
            metadata: Metadata::new(),
        }
    }
}

/// Partial update of [`OrchestratorState`].
///
/// For the nullable fields, an absent key is `None` and an explicit JSON
/// `null` is `Some(None)`, which writes NULL back to the row.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorStatePatch {
    #[serde(default)]
    pub status: Option<OrchestratorStatus>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub pid: Option<Option<u32>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub started_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub last_reconcile_at: Option<Option<DateTime<Utc>>>,
    #[serde(default)]
    pub worker_pool_size: Option<u32>,
    #[serde(default)]
    pub reconcile_interval_seconds: Option<u64>,
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<u64>,
    #[serde(default)]
    pub lease_duration_minutes: Option<u64>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

fn explicit_null<'de, D, T>(d: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(d).map(Some)
}

impl OrchestratorStatePatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply this patch on top of `state`.
    pub fn apply_to(&self, state: &mut OrchestratorState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(pid) = self.pid {
            state.pid = pid;
        }
        if let Some(started_at) = self.started_at {
            state.started_at = started_at;
        }
        if let Some(last) = self.last_reconcile_at {
            state.last_reconcile_at = last;
        }
        if let Some(n) = self.worker_pool_size {
            state.worker_pool_size = n;
        }
        if let Some(n) = self.reconcile_interval_seconds {
            state.reconcile_interval_seconds = n;
        }
        if let Some(n) = self.heartbeat_interval_seconds {
            state.heartbeat_interval_seconds = n;
        }
        if let Some(n) = self.lease_duration_minutes {
            state.lease_duration_minutes = n;
        }
        if let Some(metadata) = &self.metadata {
            state.metadata = metadata.clone();
        }
    }
}
