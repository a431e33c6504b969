use super::error::BrokerError;
use crate::jobs::types::{
    JobId, JobRecord, LeaseId, MatchRecord, TaskId, TaskKey, TaskRecord, TaskReport, TaskState,
    WorkerId,
};

use async_trait::async_trait;
use std::time::Duration;

/// Everything the coordination core needs from the shared broker: a job
/// ledger, a lease-based FIFO of tasks, a FIFO of task reports and the
/// per-job match lists.
///
/// Lease transitions (`lease`, `renew`, `requeue`, `settle`) are atomic. A
/// leased task stays invisible to other `lease` calls until it is requeued or
/// settled. `lease` never hands out a task of a job marked cancelled.
#[async_trait]
pub trait Broker: Send + Sync {
    // --- Job ledger ---

    /// Stores the record and, in the same step, lists or unlists the job in
    /// the dispatch index (listed while `awaits_dispatch`, scored by
    /// `next_dispatch_at`).
    async fn put_job(&self, job: &JobRecord) -> Result<(), BrokerError>;

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>, BrokerError>;

    /// Every known job id, oldest first.
    async fn list_jobs(&self) -> Result<Vec<JobId>, BrokerError>;

    /// Up to `limit` indexed jobs due at `now_ms`, earliest first.
    async fn due_jobs(&self, now_ms: u64, limit: usize) -> Result<Vec<JobId>, BrokerError>;

    /// Closes the lease gate for a job. Idempotent.
    async fn mark_cancelled(&self, job_id: &JobId) -> Result<(), BrokerError>;

    async fn is_cancelled(&self, job_id: &JobId) -> Result<bool, BrokerError>;

    /// Replaces the matches recorded for one task. Writing the same task
    /// twice never lists its matches twice.
    async fn put_task_matches(
        &self,
        job_id: &JobId,
        task_id: TaskId,
        matches: &[MatchRecord],
    ) -> Result<(), BrokerError>;

    /// A page of the job's matches, in task id order. An offset past the end
    /// yields an empty page.
    async fn matches(
        &self,
        job_id: &JobId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MatchRecord>, BrokerError>;

    // --- Task queue ---

    /// Stores the task and appends it to the ready queue. Enqueuing the same
    /// key twice does not list the task twice for its job.
    async fn enqueue(&self, task: &TaskRecord) -> Result<(), BrokerError>;

    /// Leases the oldest ready task, waiting up to `wait` for one to appear.
    async fn lease(
        &self,
        worker: &WorkerId,
        lease_for: Duration,
        wait: Duration,
    ) -> Result<Option<TaskRecord>, BrokerError>;

    /// Extends a lease still held under `lease_id`.
    async fn renew(
        &self,
        key: &TaskKey,
        lease_id: &LeaseId,
        lease_for: Duration,
    ) -> Result<bool, BrokerError>;

    /// Puts a leased task back on the ready queue with its attempt count
    /// incremented by one. Refused (`None`) when the task is not leased or
    /// is held under a different lease.
    async fn requeue(
        &self,
        key: &TaskKey,
        lease_id: &LeaseId,
    ) -> Result<Option<TaskRecord>, BrokerError>;

    /// Forces a task into `state` and drops any lease. Does not touch the
    /// ready queue.
    async fn settle(
        &self,
        key: &TaskKey,
        state: TaskState,
    ) -> Result<Option<TaskRecord>, BrokerError>;

    /// Leased tasks whose lease expired at or before `now_ms`.
    async fn expired_leases(&self, now_ms: u64) -> Result<Vec<TaskRecord>, BrokerError>;

    async fn get_task(&self, key: &TaskKey) -> Result<Option<TaskRecord>, BrokerError>;

    /// Tasks of a job in task id order.
    async fn tasks_for_job(&self, job_id: &JobId) -> Result<Vec<TaskRecord>, BrokerError>;

    // --- Reports ---

    async fn push_report(&self, report: &TaskReport) -> Result<(), BrokerError>;

    /// Pops the oldest report, waiting up to `wait` for one to appear.
    async fn next_report(&self, wait: Duration) -> Result<Option<TaskReport>, BrokerError>;
}
