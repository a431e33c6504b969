//! Worker Daemon
//!
//! Runs `concurrency` independent loops that lease tasks from the broker,
//! evaluate every object of the batch and push one report per task.
//!
//! ## Responsibilities
//! - **Leasing**: blocking lease with a bounded wait, never busy-polling.
//! - **Lease Management**: a sidecar renews the lease while the batch runs.
//!   If the process dies, renewal stops and the lease expires, which is how
//!   the scheduler finds out.
//! - **Cancellation**: the job's cancellation gate is checked before every object.
//! - **Evaluation**: per-object read or match errors are recorded, never fatal.

use crate::config::WorkerConfig;
use crate::error::CoordinationError;
use crate::jobs::types::*;
use crate::matching::{CompiledQuery, MatcherRegistry, SampleStore};
use crate::queue::Broker;
use crate::storage::types::ObjectId;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause after a broker failure before leasing again.
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

pub struct Worker {
    id: WorkerId,
    broker: Arc<dyn Broker>,
    matchers: Arc<MatcherRegistry>,
    samples: Arc<SampleStore>,
    config: WorkerConfig,
    /// Compiled queries per job, cleared when it reaches the configured size.
    compiled: DashMap<JobId, Arc<dyn CompiledQuery>>,
}

/// Aborts the lease renewal sidecar when the task is done, however it ends.
struct RenewalGuard(JoinHandle<()>);

impl Drop for RenewalGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Worker {
    pub fn new(
        broker: Arc<dyn Broker>,
        matchers: Arc<MatcherRegistry>,
        samples: Arc<SampleStore>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: WorkerId::new(),
            broker,
            matchers,
            samples,
            config,
            compiled: DashMap::new(),
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Spawns the lease loops and returns their handles.
    /// Each loop stops after its current task once `shutdown` fires.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        tracing::info!(
            "Starting worker {} with {} lease loops",
            self.id,
            self.config.concurrency
        );

        (0..self.config.concurrency.max(1))
            .map(|slot| {
                let worker = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker.worker_loop(slot, shutdown).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, slot: usize, shutdown: CancellationToken) {
        tracing::info!("Worker {} loop {} started", self.id, slot);

        loop {
            let leased = tokio::select! {
                _ = shutdown.cancelled() => break,
                leased = self.broker.lease(&self.id, self.config.lease_timeout, self.config.lease_wait) => leased,
            };

            match leased {
                Ok(Some(task)) => {
                    if let Err(e) = self.handle_task(task).await {
                        tracing::warn!("Worker {} loop {}: {}", self.id, slot, e);
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
                Ok(None) => {
                    tracing::trace!("Worker {} loop {} idle", self.id, slot);
                }
                Err(e) => {
                    tracing::warn!("Worker {} failed to lease: {}", self.id, e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }

        tracing::info!("Worker {} loop {} stopped", self.id, slot);
    }

    /// Leases one task (waiting up to `lease_wait`) and processes it.
    ///
    /// Returns whether a task was handled.
    pub async fn run_once(&self) -> Result<bool, CoordinationError> {
        let leased = self
            .broker
            .lease(&self.id, self.config.lease_timeout, self.config.lease_wait)
            .await?;

        match leased {
            Some(task) => {
                self.handle_task(task).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Processes a leased task under lease renewal, then reports it.
    pub async fn handle_task(&self, task: TaskRecord) -> Result<(), CoordinationError> {
        let Some(lease) = task.lease.clone() else {
            return Err(CoordinationError::TaskLeaseExpired { key: task.key });
        };

        tracing::info!(
            "Worker {} processing task {} ({} objects, attempt {})",
            self.id,
            task.key,
            task.objects.len(),
            task.attempts
        );

        let outcome = {
            let _renewal = RenewalGuard(self.spawn_lease_renewal(&task.key, &lease.lease_id));
            self.process_task(&task).await?
        };

        let report = TaskReport {
            key: task.key.clone(),
            lease_id: lease.lease_id.clone(),
            worker: self.id.clone(),
            outcome,
            reported_at: now_ms(),
            deliveries: 0,
        };

        self.broker.push_report(&report).await?;

        // The lease stays until the scheduler settles the task from the
        // report. If the report is lost, expiry hands the task out again.
        if !self
            .broker
            .renew(&task.key, &lease.lease_id, self.config.lease_timeout)
            .await?
        {
            tracing::debug!("Task {} settled before its report was acknowledged", task.key);
        }

        tracing::debug!("Worker {} reported task {}", self.id, task.key);
        Ok(())
    }

    /// Evaluates every object of the batch.
    ///
    /// Only broker failures are returned as errors; anything wrong with the
    /// query or the objects ends up in the outcome.
    async fn process_task(&self, task: &TaskRecord) -> Result<TaskOutcome, CoordinationError> {
        let job_id = &task.key.job_id;

        let compiled = match self.compiled_query(job_id).await {
            Ok(compiled) => compiled,
            Err(CoordinationError::Broker(e)) => return Err(CoordinationError::Broker(e)),
            Err(e) => {
                tracing::warn!("Task {} cannot run: {}", task.key, e);
                return Ok(TaskOutcome::Failed {
                    error: e.to_string(),
                });
            }
        };

        let mut results = Vec::with_capacity(task.objects.len());

        for object in &task.objects {
            if self.broker.is_cancelled(job_id).await? {
                tracing::info!(
                    "Job {} cancelled, stopping task {} after {} objects",
                    job_id,
                    task.key,
                    results.len()
                );
                return Ok(TaskOutcome::Interrupted);
            }

            let outcome = self.evaluate_object(&compiled, object).await;
            if let ObjectOutcome::Error { message } = &outcome {
                tracing::debug!("Object {} of task {} failed: {}", object, task.key, message);
            }

            results.push(ResultEntry {
                object: object.clone(),
                outcome,
            });
        }

        Ok(TaskOutcome::Completed { results })
    }

    async fn compiled_query(
        &self,
        job_id: &JobId,
    ) -> Result<Arc<dyn CompiledQuery>, CoordinationError> {
        if let Some(compiled) = self.compiled.get(job_id) {
            return Ok(compiled.value().clone());
        }

        let job = self
            .broker
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoordinationError::JobNotFound(job_id.clone()))?;
        let compiled = self.matchers.compile(&job.query)?;

        if self.compiled.len() >= self.config.compiled_cache_size {
            self.compiled.clear();
        }
        self.compiled.insert(job_id.clone(), compiled.clone());

        Ok(compiled)
    }

    /// Reads and matches one object; every failure becomes an `Error` outcome.
    async fn evaluate_object(
        &self,
        compiled: &Arc<dyn CompiledQuery>,
        object: &ObjectId,
    ) -> ObjectOutcome {
        let data = match self.samples.read(object).await {
            Ok(data) => data,
            Err(e) => {
                return ObjectOutcome::Error {
                    message: e.to_string(),
                };
            }
        };

        let compiled = compiled.clone();
        let evaluated = tokio::task::spawn_blocking(move || {
            let outcome = compiled.evaluate(&data)?;
            Ok::<_, anyhow::Error>(match outcome {
                ObjectOutcome::Matched { mut metadata } => {
                    metadata.insert("size".to_string(), data.len().into());
                    metadata.insert(
                        "sha256".to_string(),
                        hex::encode(Sha256::digest(&data)).into(),
                    );
                    ObjectOutcome::Matched { metadata }
                }
                other => other,
            })
        })
        .await;

        match evaluated {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ObjectOutcome::Error {
                message: format!("evaluation failed: {}", e),
            },
            Err(e) => ObjectOutcome::Error {
                message: format!("evaluation aborted: {}", e),
            },
        }
    }

    /// Spawns a background task renewing the lease every third of its length.
    fn spawn_lease_renewal(&self, key: &TaskKey, lease_id: &LeaseId) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let key = key.clone();
        let lease_id = lease_id.clone();
        let lease_for = self.config.lease_timeout;
        let interval = self.config.renew_interval();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                match broker.renew(&key, &lease_id, lease_for).await {
                    Ok(true) => {
                        tracing::trace!("Renewed lease for task {}", key);
                    }
                    Ok(false) => {
                        // Reclaimed by the scheduler; the report will be superseded.
                        let lost = CoordinationError::TaskLeaseExpired { key: key.clone() };
                        tracing::warn!("{}", lost);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to renew lease for task {}: {}", key, e);
                    }
                }
            }
        })
    }
}
