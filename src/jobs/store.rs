//! Job Store
//!
//! Authoritative job records, persisted through the broker's key-value ledger.
//!
//! Mutations go through a [`JobOwnership`] token: a per-job lock plus the
//! freshly loaded record. Holding the token makes the scheduler the single
//! writer of that job; unrelated jobs have unrelated tokens and proceed in
//! parallel. Reads (`get`) never take the token.

use super::types::{JobId, JobRecord};
use crate::error::CoordinationError;
use crate::queue::Broker;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct JobStore {
    broker: Arc<dyn Broker>,
    /// One lock per job that currently has (or recently had) a writer.
    owners: DashMap<JobId, Arc<Mutex<()>>>,
}

impl JobStore {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            owners: DashMap::new(),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Persists a brand new job.
    pub async fn create(&self, job: &JobRecord) -> Result<(), CoordinationError> {
        self.broker.put_job(job).await?;
        tracing::debug!("Stored job {}", job.id);
        Ok(())
    }

    /// Reads the latest committed record.
    pub async fn get(&self, job_id: &JobId) -> Result<JobRecord, CoordinationError> {
        self.broker
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoordinationError::JobNotFound(job_id.clone()))
    }

    /// Acquires the job's ownership token and loads the record under it.
    ///
    /// Waits while another mutation of the same job is in progress.
    pub async fn own(&self, job_id: &JobId) -> Result<JobOwnership<'_>, CoordinationError> {
        let token = self
            .owners
            .entry(job_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let guard = token.lock_owned().await;
        let job = match self.get(job_id).await {
            Ok(job) => job,
            Err(e) => {
                drop(guard);
                self.forget(job_id);
                return Err(e);
            }
        };

        Ok(JobOwnership {
            store: self,
            job,
            guard,
        })
    }

    /// Drops the lock of a job nobody is waiting on.
    fn forget(&self, job_id: &JobId) {
        self.owners
            .remove_if(job_id, |_, token| Arc::strong_count(token) == 1);
    }

    /// Number of jobs with a live ownership lock.
    pub fn owned_count(&self) -> usize {
        self.owners.len()
    }
}

/// Exclusive right to mutate one job, held only for the duration of the
/// mutation. Dropping the token without `commit` discards the changes.
pub struct JobOwnership<'a> {
    store: &'a JobStore,
    job: JobRecord,
    guard: OwnedMutexGuard<()>,
}

impl JobOwnership<'_> {
    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    pub fn job_mut(&mut self) -> &mut JobRecord {
        &mut self.job
    }

    /// Writes the record back and releases the token.
    pub async fn commit(self) -> Result<JobRecord, CoordinationError> {
        self.store.broker.put_job(&self.job).await?;

        let JobOwnership { store, job, guard } = self;
        drop(guard);

        if job.status.is_terminal() {
            store.forget(&job.id);
        }

        Ok(job)
    }
}
