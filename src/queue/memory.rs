//! In-Process Broker
//!
//! Implements the full [`Broker`] contract on local memory: `DashMap`s for the
//! ledger and the task records, tokio mutex-guarded FIFOs for the ready queue
//! and the report queue, and a `Notify` per FIFO so waiting consumers wake up
//! as soon as something is pushed.
//!
//! Used by the `standalone` mode (scheduler and workers in one process) and
//! by the tests. Nothing survives a restart.

use super::broker::Broker;
use super::error::BrokerError;
use crate::jobs::types::*;

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

pub struct MemoryBroker {
    jobs: DashMap<JobId, JobRecord>,
    /// Submission order of `jobs`.
    job_order: Mutex<Vec<JobId>>,
    /// Jobs awaiting dispatch, by `next_dispatch_at`.
    dispatch_index: DashMap<JobId, u64>,
    cancelled: DashMap<JobId, u64>,
    matches: DashMap<JobId, BTreeMap<TaskId, Vec<MatchRecord>>>,

    tasks: DashMap<TaskKey, TaskRecord>,
    job_tasks: DashMap<JobId, Vec<TaskId>>,
    ready: Mutex<VecDeque<TaskKey>>,
    task_signal: Notify,

    reports: Mutex<VecDeque<TaskReport>>,
    report_signal: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            job_order: Mutex::new(Vec::new()),
            dispatch_index: DashMap::new(),
            cancelled: DashMap::new(),
            matches: DashMap::new(),
            tasks: DashMap::new(),
            job_tasks: DashMap::new(),
            ready: Mutex::new(VecDeque::new()),
            task_signal: Notify::new(),
            reports: Mutex::new(VecDeque::new()),
            report_signal: Notify::new(),
        }
    }

    /// Number of task keys waiting on the ready queue (stale ones included).
    pub async fn ready_len(&self) -> usize {
        self.ready.lock().await.len()
    }

    pub async fn report_backlog(&self) -> usize {
        self.reports.lock().await.len()
    }

    /// Pops ready keys until one is leasable.
    ///
    /// Keys of cancelled jobs and keys whose task is no longer `Pending`
    /// (stale duplicates) are dropped on the way.
    async fn try_lease(&self, worker: &WorkerId, lease_for: Duration) -> Option<TaskRecord> {
        let mut ready = self.ready.lock().await;

        while let Some(key) = ready.pop_front() {
            if self.cancelled.contains_key(&key.job_id) {
                tracing::trace!("Dropping task {} of cancelled job", key);
                continue;
            }

            let Some(mut entry) = self.tasks.get_mut(&key) else {
                continue;
            };

            if entry.state != TaskState::Pending {
                tracing::trace!("Skipping stale ready entry {} ({:?})", key, entry.state);
                continue;
            }

            let now = now_ms();
            entry.state = TaskState::Leased;
            entry.lease = Some(Lease {
                lease_id: LeaseId::new(),
                worker: worker.clone(),
                expires_at: now + lease_for.as_millis() as u64,
            });
            entry.updated_at = now;

            tracing::debug!("Leased task {} to worker {}", key, worker);
            return Some(entry.clone());
        }

        None
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn put_job(&self, job: &JobRecord) -> Result<(), BrokerError> {
        let mut order = self.job_order.lock().await;

        if job.awaits_dispatch() {
            self.dispatch_index.insert(job.id.clone(), job.next_dispatch_at);
        } else {
            self.dispatch_index.remove(&job.id);
        }
        if self.jobs.insert(job.id.clone(), job.clone()).is_none() {
            order.push(job.id.clone());
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>, BrokerError> {
        Ok(self.jobs.get(job_id).map(|entry| entry.value().clone()))
    }

    async fn list_jobs(&self) -> Result<Vec<JobId>, BrokerError> {
        Ok(self.job_order.lock().await.clone())
    }

    async fn due_jobs(&self, now_ms: u64, limit: usize) -> Result<Vec<JobId>, BrokerError> {
        let mut due: Vec<(u64, JobId)> = self
            .dispatch_index
            .iter()
            .filter(|entry| *entry.value() <= now_ms)
            .map(|entry| (*entry.value(), entry.key().clone()))
            .collect();
        due.sort();

        Ok(due.into_iter().take(limit).map(|(_, job_id)| job_id).collect())
    }

    async fn mark_cancelled(&self, job_id: &JobId) -> Result<(), BrokerError> {
        self.cancelled.entry(job_id.clone()).or_insert_with(now_ms);
        Ok(())
    }

    async fn is_cancelled(&self, job_id: &JobId) -> Result<bool, BrokerError> {
        Ok(self.cancelled.contains_key(job_id))
    }

    async fn put_task_matches(
        &self,
        job_id: &JobId,
        task_id: TaskId,
        matches: &[MatchRecord],
    ) -> Result<(), BrokerError> {
        let mut per_task = self.matches.entry(job_id.clone()).or_default();
        if matches.is_empty() {
            per_task.remove(&task_id);
        } else {
            per_task.insert(task_id, matches.to_vec());
        }
        Ok(())
    }

    async fn matches(
        &self,
        job_id: &JobId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MatchRecord>, BrokerError> {
        Ok(self
            .matches
            .get(job_id)
            .map(|per_task| {
                per_task
                    .values()
                    .flatten()
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn enqueue(&self, task: &TaskRecord) -> Result<(), BrokerError> {
        let key = task.key.clone();

        if self.tasks.insert(key.clone(), task.clone()).is_none() {
            self.job_tasks
                .entry(key.job_id.clone())
                .or_default()
                .push(key.task_id);
        }

        self.ready.lock().await.push_back(key);
        self.task_signal.notify_waiters();
        Ok(())
    }

    async fn lease(
        &self,
        worker: &WorkerId,
        lease_for: Duration,
        wait: Duration,
    ) -> Result<Option<TaskRecord>, BrokerError> {
        let deadline = Instant::now() + wait;

        loop {
            // Register before checking so an enqueue in between is not missed.
            let notified = self.task_signal.notified();

            if let Some(task) = self.try_lease(worker, lease_for).await {
                return Ok(Some(task));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn renew(
        &self,
        key: &TaskKey,
        lease_id: &LeaseId,
        lease_for: Duration,
    ) -> Result<bool, BrokerError> {
        let Some(mut entry) = self.tasks.get_mut(key) else {
            return Ok(false);
        };

        if entry.state != TaskState::Leased {
            return Ok(false);
        }

        let now = now_ms();
        match entry.lease.as_mut() {
            Some(lease) if &lease.lease_id == lease_id => {
                lease.expires_at = now + lease_for.as_millis() as u64;
            }
            _ => return Ok(false),
        }
        entry.updated_at = now;

        tracing::trace!("Renewed lease for task {}", key);
        Ok(true)
    }

    async fn requeue(
        &self,
        key: &TaskKey,
        lease_id: &LeaseId,
    ) -> Result<Option<TaskRecord>, BrokerError> {
        let requeued = {
            let Some(mut entry) = self.tasks.get_mut(key) else {
                return Ok(None);
            };

            if entry.state != TaskState::Leased || entry.held_by_other(lease_id) {
                return Ok(None);
            }

            entry.attempts += 1;
            entry.state = TaskState::Pending;
            entry.lease = None;
            entry.updated_at = now_ms();
            entry.clone()
        };

        self.ready.lock().await.push_back(key.clone());
        self.task_signal.notify_waiters();

        tracing::debug!("Requeued task {} (attempt {})", key, requeued.attempts);
        Ok(Some(requeued))
    }

    async fn settle(
        &self,
        key: &TaskKey,
        state: TaskState,
    ) -> Result<Option<TaskRecord>, BrokerError> {
        let Some(mut entry) = self.tasks.get_mut(key) else {
            return Ok(None);
        };

        entry.state = state;
        entry.lease = None;
        entry.updated_at = now_ms();
        Ok(Some(entry.clone()))
    }

    async fn expired_leases(&self, now_ms: u64) -> Result<Vec<TaskRecord>, BrokerError> {
        Ok(self
            .tasks
            .iter()
            .filter(|entry| {
                entry.state == TaskState::Leased
                    && entry
                        .lease
                        .as_ref()
                        .is_some_and(|lease| lease.expires_at <= now_ms)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn get_task(&self, key: &TaskKey) -> Result<Option<TaskRecord>, BrokerError> {
        Ok(self.tasks.get(key).map(|entry| entry.value().clone()))
    }

    async fn tasks_for_job(&self, job_id: &JobId) -> Result<Vec<TaskRecord>, BrokerError> {
        let Some(task_ids) = self.job_tasks.get(job_id).map(|ids| ids.value().clone()) else {
            return Ok(Vec::new());
        };

        Ok(task_ids
            .into_iter()
            .filter_map(|task_id| {
                self.tasks
                    .get(&TaskKey::new(job_id.clone(), task_id))
                    .map(|entry| entry.value().clone())
            })
            .collect())
    }

    async fn push_report(&self, report: &TaskReport) -> Result<(), BrokerError> {
        self.reports.lock().await.push_back(report.clone());
        self.report_signal.notify_waiters();
        Ok(())
    }

    async fn next_report(&self, wait: Duration) -> Result<Option<TaskReport>, BrokerError> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.report_signal.notified();

            if let Some(report) = self.reports.lock().await.pop_front() {
                return Ok(Some(report));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }
}
