use crate::storage::types::{DatasetId, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Metadata attached to a match, keyed by field name.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Unique identifier for a search job.
///
/// Wrapper around a UUID string so ids stay opaque to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub String);

impl JobId {
    /// Generates a new random UUID v4-based JobId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sequence number of a task, unique within its job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique task address: `<job>/<task>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub job_id: JobId,
    pub task_id: TaskId,
}

impl TaskKey {
    pub fn new(job_id: JobId, task_id: TaskId) -> Self {
        Self { job_id, task_id }
    }

    /// Parses the `<job>/<task>` form produced by `Display`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (job, task) = raw.split_once('/')?;
        let task_id = task.parse().ok()?;
        Some(Self::new(JobId(job.to_string()), TaskId(task_id)))
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.task_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one grant of a lease. A requeued task gets a fresh lease id on
/// its next lease, so stale holders can be told apart from the current one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LeaseId(pub String);

impl LeaseId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a job.
///
/// `queued -> dispatching -> running -> done | error | cancelled`, with
/// `dispatching -> queued` while the storage engine is unreachable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Dispatching,
    Running,
    Done,
    Cancelled,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Cancelled | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Dispatching => "dispatching",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client asked for.
///
/// `pattern` and `options` are opaque here; the matcher named by `matcher`
/// interprets them and decides which index query goes to the storage engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuerySpec {
    pub matcher: String,
    pub pattern: String,
    #[serde(default)]
    pub options: serde_json::Value,
    /// Dataset tags forwarded to the storage engine.
    #[serde(default)]
    pub taints: Vec<String>,
    /// Quota account charged for the job.
    #[serde(default)]
    pub owner: Option<String>,
}

impl QuerySpec {
    pub fn new(matcher: &str, pattern: &str) -> Self {
        Self {
            matcher: matcher.to_string(),
            pattern: pattern.to_string(),
            options: serde_json::Value::Null,
            taints: Vec::new(),
            owner: None,
        }
    }
}

/// The authoritative job record kept in the job ledger.
///
/// Only the scheduler writes it, always under the job's ownership token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub query: QuerySpec,
    pub status: JobStatus,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub total_tasks: u32,
    /// Tasks that reached `succeeded` or `failed`.
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub total_objects: u64,
    pub processed_objects: u64,
    pub matched_objects: u64,
    pub errored_objects: u64,
    /// Objects of permanently failed tasks.
    pub unevaluated_objects: Vec<ObjectId>,
    pub datasets: Vec<DatasetId>,
    pub error: Option<String>,
    pub cancelled: bool,
    pub dispatch_attempts: u32,
    /// Earliest time (ms) the dispatch loop picks the job up again.
    pub next_dispatch_at: u64,
    /// Final state of every task folded into the counters. Task records are
    /// brought in line with it after each commit.
    #[serde(default)]
    pub settled_tasks: BTreeMap<TaskId, TaskState>,
}

impl JobRecord {
    pub fn new(query: QuerySpec) -> Self {
        Self {
            id: JobId::new(),
            query,
            status: JobStatus::Queued,
            created_at: now_ms(),
            started_at: None,
            finished_at: None,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            total_objects: 0,
            processed_objects: 0,
            matched_objects: 0,
            errored_objects: 0,
            unevaluated_objects: Vec::new(),
            datasets: Vec::new(),
            error: None,
            cancelled: false,
            dispatch_attempts: 0,
            next_dispatch_at: 0,
            settled_tasks: BTreeMap::new(),
        }
    }

    pub fn is_due(&self, now: u64) -> bool {
        self.awaits_dispatch() && self.next_dispatch_at <= now
    }

    /// Whether the dispatch index should list the job.
    pub fn awaits_dispatch(&self) -> bool {
        self.status == JobStatus::Queued && !self.cancelled
    }

    pub fn finish(&mut self, status: JobStatus, now: u64) {
        self.status = status;
        self.finished_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Leased,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Leased => "leased",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(TaskState::Pending),
            "leased" => Some(TaskState::Leased),
            "succeeded" => Some(TaskState::Succeeded),
            "failed" => Some(TaskState::Failed),
            _ => None,
        }
    }
}

/// Time-bounded exclusive claim on a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub lease_id: LeaseId,
    pub worker: WorkerId,
    /// Timestamp (ms) after which the task may be reclaimed.
    pub expires_at: u64,
}

/// A bounded batch of candidate objects dispatched as one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub key: TaskKey,
    pub objects: Vec<ObjectId>,
    /// Number of the current (or next) attempt, starting at 1.
    pub attempts: u32,
    pub state: TaskState,
    /// Present while a worker holds the task.
    pub lease: Option<Lease>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TaskRecord {
    pub fn new(key: TaskKey, objects: Vec<ObjectId>) -> Self {
        let now = now_ms();
        Self {
            key,
            objects,
            attempts: 1,
            state: TaskState::Pending,
            lease: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when another holder than `lease_id` owns the task right now.
    pub fn held_by_other(&self, lease_id: &LeaseId) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|lease| &lease.lease_id != lease_id)
    }
}

/// Per-object evaluation result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ObjectOutcome {
    Matched { metadata: Metadata },
    NotMatched,
    /// The object could not be read or evaluated. Never fatal to the task.
    Error { message: String },
}

impl ObjectOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, ObjectOutcome::Matched { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ObjectOutcome::Error { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultEntry {
    pub object: ObjectId,
    pub outcome: ObjectOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Every object of the batch was evaluated.
    Completed { results: Vec<ResultEntry> },
    /// The task could not run at all (e.g. the query failed to compile).
    Failed { error: String },
    /// The worker stopped because the job was cancelled.
    Interrupted,
}

/// One batch report per task, sent by the worker that held `lease_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskReport {
    pub key: TaskKey,
    pub lease_id: LeaseId,
    pub worker: WorkerId,
    pub outcome: TaskOutcome,
    pub reported_at: u64,
    /// Times the scheduler put the report back after failing to apply it.
    #[serde(default)]
    pub deliveries: u32,
}

/// A matched object as listed to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchRecord {
    pub object: ObjectId,
    pub task_id: TaskId,
    pub metadata: Metadata,
}

/// Number of tasks of a job in each state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: u32,
    pub leased: u32,
    pub succeeded: u32,
    pub failed: u32,
}

impl TaskCounts {
    pub fn tally<'a>(tasks: impl IntoIterator<Item = &'a TaskRecord>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            match task.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Leased => counts.leased += 1,
                TaskState::Succeeded => counts.succeeded += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> u32 {
        self.pending + self.leased + self.succeeded + self.failed
    }
}

/// Read-only snapshot of a job returned by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub query: QuerySpec,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub tasks: TaskCounts,
    pub total_objects: u64,
    pub processed_objects: u64,
    pub matched_objects: u64,
    pub errored_objects: u64,
    pub unevaluated_objects: Vec<ObjectId>,
    pub datasets: Vec<DatasetId>,
    pub error: Option<String>,
    pub cancelled: bool,
    pub dispatch_attempts: u32,
}

impl JobView {
    pub fn new(job: JobRecord, tasks: TaskCounts) -> Self {
        Self {
            id: job.id,
            status: job.status,
            query: job.query,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            total_tasks: job.total_tasks,
            completed_tasks: job.completed_tasks,
            tasks,
            total_objects: job.total_objects,
            processed_objects: job.processed_objects,
            matched_objects: job.matched_objects,
            errored_objects: job.errored_objects,
            unevaluated_objects: job.unevaluated_objects,
            datasets: job.datasets,
            error: job.error,
            cancelled: job.cancelled,
            dispatch_attempts: job.dispatch_attempts,
        }
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
