//! Static Storage
//!
//! A fixed, in-memory engine: datasets are declared up front and every query
//! returns the dataset's objects. The topology reports each dataset's taints;
//! a dataset lacking one of the query's taints also answers with nothing
//! when queried directly. Outages and rejections can be switched on to drive
//! the scheduler's failure paths.

use super::client::{StorageError, StorageQueryClient};
use super::types::{Dataset, DatasetId, ObjectId, StorageQuery};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

struct StaticDataset {
    id: DatasetId,
    taints: Vec<String>,
    objects: Vec<ObjectId>,
}

pub struct StaticStorage {
    datasets: Vec<StaticDataset>,
    available: AtomicBool,
    /// Calls still to fail with `Unavailable` before answering normally.
    outages: AtomicU32,
    rejecting: AtomicBool,
    queries: AtomicU32,
}

impl StaticStorage {
    pub fn new() -> Self {
        Self {
            datasets: Vec::new(),
            available: AtomicBool::new(true),
            outages: AtomicU32::new(0),
            rejecting: AtomicBool::new(false),
            queries: AtomicU32::new(0),
        }
    }

    pub fn with_dataset<I, S>(self, id: &str, objects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ObjectId>,
    {
        self.with_tainted_dataset(id, &[], objects)
    }

    pub fn with_tainted_dataset<I, S>(mut self, id: &str, taints: &[&str], objects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ObjectId>,
    {
        self.datasets.push(StaticDataset {
            id: DatasetId::from(id),
            taints: taints.iter().map(|t| t.to_string()).collect(),
            objects: objects.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes the next `calls` calls fail as if the engine were down.
    pub fn fail_next(&self, calls: u32) {
        self.outages.store(calls, Ordering::SeqCst);
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Number of per-dataset queries answered so far.
    pub fn query_count(&self) -> u32 {
        self.queries.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("engine offline".to_string()));
        }

        let outage = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if outage.is_ok() {
            return Err(StorageError::Unavailable("engine outage".to_string()));
        }

        Ok(())
    }
}

impl Default for StaticStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageQueryClient for StaticStorage {
    async fn topology(&self) -> Result<Vec<Dataset>, StorageError> {
        self.check_available()?;
        Ok(self
            .datasets
            .iter()
            .map(|d| Dataset {
                id: d.id.clone(),
                taints: d.taints.clone(),
                file_count: Some(d.objects.len() as u64),
            })
            .collect())
    }

    async fn query(
        &self,
        query: &StorageQuery,
        dataset: &DatasetId,
    ) -> Result<Vec<ObjectId>, StorageError> {
        self.check_available()?;

        if self.rejecting.load(Ordering::SeqCst) {
            return Err(StorageError::Rejected("query rejected".to_string()));
        }

        let Some(found) = self.datasets.iter().find(|d| &d.id == dataset) else {
            return Err(StorageError::Rejected(format!("unknown dataset {}", dataset)));
        };

        self.queries.fetch_add(1, Ordering::SeqCst);

        let tainted = query.taints.iter().all(|t| found.taints.contains(t));
        if !tainted {
            return Ok(Vec::new());
        }
        Ok(found.objects.clone())
    }
}
