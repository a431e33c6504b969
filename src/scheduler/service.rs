//! Scheduler Service
//!
//! Owns every job: turns submissions into tasks, folds task reports back into
//! the job and moves the job through its lifecycle.
//!
//! ## Single Writer
//! Every mutation of a job happens under its ownership token (see
//! [`JobStore::own`]). The token is never held across the storage query nor
//! across a blocking wait on the broker, so a slow engine or an idle report
//! queue never stalls an unrelated job.
//!
//! ## Settling Tasks
//! The job record is the ledger of settled tasks. A report is folded into
//! the counters and `settled_tasks` under the token, the record is committed,
//! and only then is the task record settled. A failure anywhere before the
//! commit leaves nothing behind (match lists are replaced per task, never
//! appended); a failure after it is repaired by replaying the ledger.

use super::batching;
use crate::config::SchedulerConfig;
use crate::error::CoordinationError;
use crate::jobs::types::*;
use crate::jobs::{JobOwnership, JobStore};
use crate::matching::MatcherRegistry;
use crate::quota::QuotaLedger;
use crate::queue::Broker;
use crate::storage::types::{CandidateSet, StorageQuery};
use crate::storage::{StorageError, StorageQueryClient, resolve_candidates};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const QUOTA_DECAY_PERIOD: Duration = Duration::from_secs(60);

/// Jobs handed to dispatch per tick of the dispatch loop.
const DISPATCH_BATCH: usize = 64;

/// What a report did to its task and job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportDisposition {
    /// Results merged, task succeeded.
    Merged,
    /// The job is cancelled or finished; results dropped.
    Discarded,
    /// The task had already reached a final state.
    Duplicate,
    /// Failed attempt, task requeued.
    Retrying,
    /// Failed attempt with no attempts left, task failed for good.
    Failed,
    /// Sent under a lease that is no longer current.
    Superseded,
    /// Worker stopped for cancellation, task back to pending.
    Returned,
}

pub struct Scheduler {
    store: JobStore,
    broker: Arc<dyn Broker>,
    storage: Arc<dyn StorageQueryClient>,
    matchers: Arc<MatcherRegistry>,
    quotas: QuotaLedger,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        broker: Arc<dyn Broker>,
        storage: Arc<dyn StorageQueryClient>,
        matchers: Arc<MatcherRegistry>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: JobStore::new(broker.clone()),
            broker,
            storage,
            matchers,
            quotas: QuotaLedger::new(config.owner_quota),
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn matchers(&self) -> &Arc<MatcherRegistry> {
        &self.matchers
    }

    pub fn quotas(&self) -> &QuotaLedger {
        &self.quotas
    }

    // --- Client operations ---

    /// Validates the query and records a new `queued` job.
    pub async fn submit(&self, query: QuerySpec) -> Result<JobId, CoordinationError> {
        self.matchers.compile(&query)?;

        if let Some(owner) = &query.owner {
            self.quotas.charge(owner)?;
        }

        let job = JobRecord::new(query);
        if let Err(e) = self.store.create(&job).await {
            if let Some(owner) = &job.query.owner {
                self.quotas.refund(owner);
            }
            return Err(e);
        }

        tracing::info!(
            "Job {} submitted (matcher '{}')",
            job.id,
            job.query.matcher
        );
        Ok(job.id)
    }

    /// Read-only snapshot with per-state task counts.
    pub async fn status(&self, job_id: &JobId) -> Result<JobView, CoordinationError> {
        let job = self.store.get(job_id).await?;
        let tasks = self.broker.tasks_for_job(job_id).await?;
        Ok(JobView::new(job, TaskCounts::tally(&tasks)))
    }

    /// Every job, oldest first.
    pub async fn list_jobs(&self) -> Result<Vec<JobView>, CoordinationError> {
        let mut views = Vec::new();
        for job_id in self.broker.list_jobs().await? {
            match self.status(&job_id).await {
                Ok(view) => views.push(view),
                Err(CoordinationError::JobNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(views)
    }

    pub async fn matches(
        &self,
        job_id: &JobId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MatchRecord>, CoordinationError> {
        self.store.get(job_id).await?;
        Ok(self.broker.matches(job_id, offset, limit).await?)
    }

    /// Stops a job. Already-leased tasks may finish but their results are
    /// dropped; the job turns `cancelled` once none of its tasks is leased.
    pub async fn cancel(&self, job_id: &JobId) -> Result<JobStatus, CoordinationError> {
        let mut token = self.store.own(job_id).await?;

        if token.job().status.is_terminal() {
            return Ok(token.job().status);
        }

        // Gate first: from here on no task of the job is leased.
        self.broker.mark_cancelled(job_id).await?;
        token.job_mut().cancelled = true;

        self.finalize(token.job_mut()).await?;
        let job = token.commit().await?;

        tracing::info!("Job {} cancelled (status: {})", job_id, job.status);
        Ok(job.status)
    }

    // --- Dispatch ---

    /// Resolves the candidate set of a `queued` job and enqueues its tasks.
    ///
    /// Jobs in any other state are left alone and their status returned.
    pub async fn dispatch(&self, job_id: &JobId) -> Result<JobStatus, CoordinationError> {
        // 1. Claim the job.
        let query = {
            let mut token = self.store.own(job_id).await?;
            let job = token.job_mut();

            if job.status != JobStatus::Queued || job.cancelled {
                return Ok(job.status);
            }

            job.status = JobStatus::Dispatching;
            job.dispatch_attempts += 1;
            job.started_at.get_or_insert_with(now_ms);

            let job = token.commit().await?;
            tracing::info!(
                "Dispatching job {} (attempt {})",
                job_id,
                job.dispatch_attempts
            );
            job.query
        };

        // 2. Ask the engine, without the token.
        let resolved = match self.matchers.compile(&query) {
            Ok(compiled) => {
                let storage_query = StorageQuery::new(compiled.index_query(), query.taints.clone());
                resolve_candidates(self.storage.as_ref(), &storage_query).await
            }
            Err(e) => Err(StorageError::Rejected(e.to_string())),
        };

        // 3. Apply the answer.
        let mut token = self.store.own(job_id).await?;

        if token.job().cancelled || self.broker.is_cancelled(job_id).await? {
            let job = token.job_mut();
            job.cancelled = true;
            job.finish(JobStatus::Cancelled, now_ms());
            token.commit().await?;
            tracing::info!("Job {} cancelled while dispatching", job_id);
            return Ok(JobStatus::Cancelled);
        }

        match resolved {
            Ok(candidates) => self.enqueue_candidates(token, candidates).await,
            Err(StorageError::Unavailable(reason)) => {
                self.postpone_dispatch(token, &reason).await?;
                Err(CoordinationError::BackendUnavailable(reason))
            }
            Err(StorageError::Rejected(reason)) => {
                let job = token.job_mut();
                job.error = Some(format!("query rejected: {}", reason));
                job.finish(JobStatus::Error, now_ms());
                token.commit().await?;

                tracing::warn!("Job {} failed: query rejected: {}", job_id, reason);
                Err(CoordinationError::InvalidQuery(reason))
            }
        }
    }

    async fn enqueue_candidates(
        &self,
        mut token: JobOwnership<'_>,
        candidates: CandidateSet,
    ) -> Result<JobStatus, CoordinationError> {
        let job_id = token.job().id.clone();
        let tasks =
            batching::build_tasks(&job_id, &candidates.objects, self.config.max_batch_size);

        for task in &tasks {
            if let Err(e) = self.broker.enqueue(task).await {
                // Tasks already enqueued must not run for a failed job.
                if let Err(gate) = self.broker.mark_cancelled(&job_id).await {
                    tracing::error!("Failed to close lease gate of job {}: {}", job_id, gate);
                }

                let job = token.job_mut();
                job.error = Some(format!("failed to enqueue tasks: {}", e));
                job.finish(JobStatus::Error, now_ms());
                token.commit().await?;

                tracing::error!("Job {} failed: could not enqueue tasks: {}", job_id, e);
                return Err(e.into());
            }
        }

        let job = token.job_mut();
        job.total_tasks = tasks.len() as u32;
        job.total_objects = candidates.len() as u64;
        job.datasets = candidates.datasets;

        if tasks.is_empty() {
            job.finish(JobStatus::Done, now_ms());
        } else {
            job.status = JobStatus::Running;
        }

        let job = token.commit().await?;
        tracing::info!(
            "Job {} {}: {} candidates in {} tasks",
            job_id,
            job.status,
            job.total_objects,
            job.total_tasks
        );
        Ok(job.status)
    }

    /// Puts the job back in the queue with backoff, or fails it when the
    /// dispatch budget is spent.
    async fn postpone_dispatch(
        &self,
        mut token: JobOwnership<'_>,
        reason: &str,
    ) -> Result<(), CoordinationError> {
        let job = token.job_mut();
        let attempts = job.dispatch_attempts;

        if attempts >= self.config.max_dispatch_attempts {
            job.error = Some(format!(
                "storage backend unavailable after {} attempts: {}",
                attempts, reason
            ));
            job.finish(JobStatus::Error, now_ms());
            tracing::error!("Job {} failed: storage backend unavailable", job.id);
        } else {
            let jitter = rand::random::<u64>() % 50;
            let delay = self.config.dispatch_backoff(attempts).as_millis() as u64 + jitter;
            job.status = JobStatus::Queued;
            job.next_dispatch_at = now_ms() + delay;
            tracing::warn!(
                "Storage backend unavailable for job {} (attempt {}/{}), retrying in {}ms: {}",
                job.id,
                attempts,
                self.config.max_dispatch_attempts,
                delay,
                reason
            );
        }

        token.commit().await?;
        Ok(())
    }

    // --- Aggregation ---

    /// Folds one task report into its job. Safe to call more than once with
    /// the same report.
    pub async fn report_task_result(
        &self,
        report: TaskReport,
    ) -> Result<ReportDisposition, CoordinationError> {
        let key = report.key.clone();
        let mut token = self.store.own(&key.job_id).await?;

        if let Some(&state) = token.job().settled_tasks.get(&key.task_id) {
            self.broker.settle(&key, state).await?;
            tracing::debug!("Duplicate report for task {} ignored", key);
            return Ok(ReportDisposition::Duplicate);
        }

        let task = self
            .broker
            .get_task(&key)
            .await?
            .ok_or_else(|| CoordinationError::TaskNotFound(key.clone()))?;

        if token.job().status.is_terminal() {
            self.broker.settle(&key, TaskState::Pending).await?;
            tracing::debug!("Report for task {} of finished job discarded", key);
            return Ok(ReportDisposition::Discarded);
        }

        let mut settle_after = None;
        let disposition = match report.outcome {
            TaskOutcome::Interrupted => {
                if task.held_by_other(&report.lease_id) {
                    ReportDisposition::Superseded
                } else {
                    self.broker.settle(&key, TaskState::Pending).await?;
                    ReportDisposition::Returned
                }
            }
            _ if token.job().cancelled => {
                self.broker.settle(&key, TaskState::Pending).await?;
                self.broker
                    .put_task_matches(&key.job_id, key.task_id, &[])
                    .await?;
                ReportDisposition::Discarded
            }
            TaskOutcome::Completed { results } => {
                self.merge_results(token.job_mut(), &task, results).await?;
                settle_after = Some(TaskState::Succeeded);
                ReportDisposition::Merged
            }
            TaskOutcome::Failed { error } => {
                if task.held_by_other(&report.lease_id) {
                    ReportDisposition::Superseded
                } else if task.attempts < self.config.max_task_attempts {
                    match self.broker.requeue(&key, &report.lease_id).await? {
                        Some(requeued) => {
                            tracing::warn!(
                                "Task {} failed on worker {}, retrying (attempt {}): {}",
                                key,
                                report.worker,
                                requeued.attempts,
                                error
                            );
                            ReportDisposition::Retrying
                        }
                        None => ReportDisposition::Superseded,
                    }
                } else {
                    self.fail_task(token.job_mut(), &task, &error).await?;
                    settle_after = Some(TaskState::Failed);
                    ReportDisposition::Failed
                }
            }
        };

        self.finalize(token.job_mut()).await?;
        token.commit().await?;

        if let Some(state) = settle_after {
            self.broker.settle(&key, state).await?;
        }

        tracing::debug!("Report for task {}: {:?}", key, disposition);
        Ok(disposition)
    }

    /// Counts the results into the job and records the task as succeeded.
    /// The task's matches are written now; the caller settles the task once
    /// the job is committed.
    async fn merge_results(
        &self,
        job: &mut JobRecord,
        task: &TaskRecord,
        results: Vec<ResultEntry>,
    ) -> Result<(), CoordinationError> {
        let mut matches = Vec::new();

        for entry in results {
            job.processed_objects += 1;
            match entry.outcome {
                ObjectOutcome::Matched { metadata } => {
                    job.matched_objects += 1;
                    matches.push(MatchRecord {
                        object: entry.object,
                        task_id: task.key.task_id,
                        metadata,
                    });
                }
                ObjectOutcome::Error { .. } => job.errored_objects += 1,
                ObjectOutcome::NotMatched => {}
            }
        }

        self.broker
            .put_task_matches(&job.id, task.key.task_id, &matches)
            .await?;
        job.completed_tasks += 1;
        job.settled_tasks
            .insert(task.key.task_id, TaskState::Succeeded);

        tracing::debug!(
            "Merged task {}: {} matches ({}/{} tasks done)",
            task.key,
            matches.len(),
            job.completed_tasks,
            job.total_tasks
        );
        Ok(())
    }

    /// Gives up on a task: its objects are recorded as never evaluated.
    async fn fail_task(
        &self,
        job: &mut JobRecord,
        task: &TaskRecord,
        reason: &str,
    ) -> Result<(), CoordinationError> {
        // Matches of an earlier uncommitted merge.
        self.broker
            .put_task_matches(&job.id, task.key.task_id, &[])
            .await?;

        job.completed_tasks += 1;
        job.failed_tasks += 1;
        job.settled_tasks.insert(task.key.task_id, TaskState::Failed);
        job.unevaluated_objects.extend(task.objects.iter().cloned());
        job.error.get_or_insert_with(|| {
            format!(
                "task {} failed after {} attempts: {}",
                task.key, task.attempts, reason
            )
        });

        tracing::error!(
            "Task {} failed permanently after {} attempts: {}",
            task.key,
            task.attempts,
            reason
        );
        Ok(())
    }

    /// Moves the job to a final state once nothing is left to wait for.
    async fn finalize(&self, job: &mut JobRecord) -> Result<(), CoordinationError> {
        if job.status.is_terminal() {
            return Ok(());
        }

        if job.cancelled {
            let settled = match job.status {
                JobStatus::Queued => true,
                JobStatus::Running => {
                    let tasks = self.broker.tasks_for_job(&job.id).await?;
                    !tasks.iter().any(|t| {
                        t.state == TaskState::Leased
                            && !job.settled_tasks.contains_key(&t.key.task_id)
                    })
                }
                // The dispatcher finishes it once the engine answers.
                _ => false,
            };
            if settled {
                job.finish(JobStatus::Cancelled, now_ms());
            }
            return Ok(());
        }

        if job.status == JobStatus::Running && job.completed_tasks >= job.total_tasks {
            let status = if job.failed_tasks > 0 {
                JobStatus::Error
            } else {
                JobStatus::Done
            };
            job.finish(status, now_ms());
            tracing::info!(
                "Job {} {}: {} processed, {} matched, {} errored, {} unevaluated",
                job.id,
                status,
                job.processed_objects,
                job.matched_objects,
                job.errored_objects,
                job.unevaluated_objects.len()
            );
        }

        Ok(())
    }

    // --- Lease recovery ---

    /// Requeues tasks whose lease ran out without a report.
    ///
    /// Returns the number of tasks reclaimed.
    pub async fn reclaim_expired_leases(&self) -> Result<usize, CoordinationError> {
        let expired = self.broker.expired_leases(now_ms()).await?;
        let mut reclaimed = 0;

        for task in expired {
            let key = task.key.clone();
            match self.reclaim(task).await {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Failed to reclaim task {}: {}", key, e),
            }
        }

        Ok(reclaimed)
    }

    async fn reclaim(&self, stale: TaskRecord) -> Result<bool, CoordinationError> {
        let Some(stale_lease) = stale.lease else {
            return Ok(false);
        };
        let key = stale.key;

        let mut token = self.store.own(&key.job_id).await?;

        if let Some(&state) = token.job().settled_tasks.get(&key.task_id) {
            self.broker.settle(&key, state).await?;
            tracing::debug!("Settled task {} from the job ledger", key);
            return Ok(false);
        }

        // Renewed, reported or reclaimed since the scan.
        let Some(task) = self.broker.get_task(&key).await? else {
            return Ok(false);
        };
        let still_expired = task.state == TaskState::Leased
            && task.lease.as_ref().is_some_and(|lease| {
                lease.lease_id == stale_lease.lease_id && lease.expires_at <= now_ms()
            });
        if !still_expired {
            return Ok(false);
        }

        let expired = CoordinationError::TaskLeaseExpired { key: key.clone() };
        tracing::warn!("{} (worker {})", expired, stale_lease.worker);

        let mut settle_after = None;
        let job = token.job();
        if job.status.is_terminal() || job.cancelled {
            self.broker.settle(&key, TaskState::Pending).await?;
        } else if task.attempts >= self.config.max_task_attempts {
            self.fail_task(token.job_mut(), &task, &expired.to_string())
                .await?;
            settle_after = Some(TaskState::Failed);
        } else if self
            .broker
            .requeue(&key, &stale_lease.lease_id)
            .await?
            .is_none()
        {
            return Ok(false);
        }

        self.finalize(token.job_mut()).await?;
        token.commit().await?;

        if let Some(state) = settle_after {
            self.broker.settle(&key, state).await?;
        }
        Ok(true)
    }

    // --- Report intake ---

    /// Pops one report (waiting up to `wait`) and applies it.
    pub async fn process_next_report(
        &self,
        wait: Duration,
    ) -> Result<Option<ReportDisposition>, CoordinationError> {
        match self.broker.next_report(wait).await? {
            Some(report) => self.apply_report(report).await.map(Some),
            None => Ok(None),
        }
    }

    /// Applies a popped report. On a transient failure the report goes back
    /// on the queue after a backoff, up to `max_report_deliveries` times.
    /// A dropped report leaves its task leased, so lease expiry runs it again.
    async fn apply_report(
        &self,
        mut report: TaskReport,
    ) -> Result<ReportDisposition, CoordinationError> {
        let e = match self.report_task_result(report.clone()).await {
            Ok(disposition) => return Ok(disposition),
            Err(CoordinationError::JobNotFound(_) | CoordinationError::TaskNotFound(_)) => {
                tracing::warn!("Dropping report for unknown task {}", report.key);
                return Ok(ReportDisposition::Discarded);
            }
            Err(e) => e,
        };

        report.deliveries += 1;
        if report.deliveries >= self.config.max_report_deliveries {
            tracing::error!(
                "Dropping report for task {} after {} failed deliveries: {}",
                report.key,
                report.deliveries,
                e
            );
            return Err(e);
        }

        let delay = self.config.report_retry_backoff(report.deliveries);
        tracing::warn!(
            "Report for task {} not applied (delivery {}), retrying in {:?}: {}",
            report.key,
            report.deliveries,
            delay,
            e
        );
        tokio::time::sleep(delay).await;

        if let Err(requeue) = self.broker.push_report(&report).await {
            tracing::error!("Report for task {} lost: {}", report.key, requeue);
        }
        Err(e)
    }

    // --- Background loops ---

    /// Recovers from a previous crash and spawns the background loops.
    pub async fn start(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, CoordinationError> {
        self.recover().await?;

        let handles = vec![
            tokio::spawn(self.clone().dispatch_loop(shutdown.clone())),
            tokio::spawn(self.clone().report_loop(shutdown.clone())),
            tokio::spawn(self.clone().sweep_loop(shutdown.clone())),
            tokio::spawn(self.clone().quota_loop(shutdown)),
        ];

        tracing::info!("Scheduler started");
        Ok(handles)
    }

    /// Jobs left `dispatching` by a crashed scheduler go back to the queue,
    /// and every queued job is listed in the dispatch index again.
    async fn recover(&self) -> Result<(), CoordinationError> {
        for job_id in self.broker.list_jobs().await? {
            let job = self.store.get(&job_id).await?;
            if job.status != JobStatus::Dispatching && !job.awaits_dispatch() {
                continue;
            }

            let mut token = self.store.own(&job_id).await?;
            let interrupted = token.job().status == JobStatus::Dispatching;
            if interrupted {
                token.job_mut().status = JobStatus::Queued;
            }
            token.commit().await?;

            if interrupted {
                tracing::info!("Recovered job {} interrupted while dispatching", job_id);
            }
        }
        Ok(())
    }

    /// Spawns a dispatch for every indexed job that is due. Returns how many.
    pub async fn dispatch_due(self: &Arc<Self>) -> Result<usize, CoordinationError> {
        let due = self.broker.due_jobs(now_ms(), DISPATCH_BATCH).await?;
        let spawned = due.len();

        for job_id in due {
            let scheduler = self.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler.dispatch(&job_id).await {
                    tracing::warn!("Dispatch of job {} failed: {}", job_id, e);
                }
            });
        }

        Ok(spawned)
    }

    async fn dispatch_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.dispatch_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.dispatch_due().await {
                tracing::warn!("Dispatch scan failed: {}", e);
            }
        }
    }

    async fn report_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.broker.next_report(self.config.report_wait) => next,
            };

            match next {
                Ok(Some(report)) => {
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = scheduler.apply_report(report).await {
                            tracing::warn!("Failed to apply report: {}", e);
                        }
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Failed to read reports: {}", e);
                    tokio::time::sleep(self.config.report_wait).await;
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.reclaim_expired_leases().await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Reclaimed {} expired leases", n),
                Err(e) => tracing::warn!("Lease sweep failed: {}", e),
            }
        }
    }

    async fn quota_loop(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.quotas.is_enabled() {
            return;
        }

        let start = tokio::time::Instant::now() + QUOTA_DECAY_PERIOD;
        let mut ticker = tokio::time::interval_at(start, QUOTA_DECAY_PERIOD);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.quotas.decay(),
            }
        }
    }
}
