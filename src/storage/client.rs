use super::types::{CandidateSet, Dataset, DatasetId, ObjectId, StorageQuery};

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The engine could not be reached or failed internally. Transient.
    #[error("storage engine unavailable: {0}")]
    Unavailable(String),

    /// The engine refused the query itself. Retrying will not help.
    #[error("query rejected by storage engine: {0}")]
    Rejected(String),
}

/// Adapter over the external index engine.
#[async_trait]
pub trait StorageQueryClient: Send + Sync {
    /// Datasets the engine serves right now, in a stable order.
    async fn topology(&self) -> Result<Vec<Dataset>, StorageError>;

    /// Candidates of one dataset, in engine order.
    async fn query(
        &self,
        query: &StorageQuery,
        dataset: &DatasetId,
    ) -> Result<Vec<ObjectId>, StorageError>;
}

/// Queries every dataset of the topology carrying the query's taints and
/// merges the answers.
///
/// Objects are kept in dataset order; an object reported by several
/// datasets is kept at its first occurrence only.
pub async fn resolve_candidates(
    client: &dyn StorageQueryClient,
    query: &StorageQuery,
) -> Result<CandidateSet, StorageError> {
    let topology = client.topology().await?;

    let datasets: Vec<DatasetId> = topology
        .into_iter()
        .filter(|dataset| {
            let carries = dataset.carries(&query.taints);
            if !carries {
                tracing::trace!("Skipping dataset {}: taints {:?}", dataset.id, dataset.taints);
            }
            carries
        })
        .map(|dataset| {
            if let Some(files) = dataset.file_count {
                tracing::debug!("Querying dataset {} ({} indexed files)", dataset.id, files);
            }
            dataset.id
        })
        .collect();

    let mut seen = HashSet::new();
    let mut objects = Vec::new();

    for dataset in &datasets {
        let found = client.query(query, dataset).await?;
        tracing::debug!("Dataset {} returned {} candidates", dataset, found.len());

        for object in found {
            if seen.insert(object.clone()) {
                objects.push(object);
            }
        }
    }

    Ok(CandidateSet { objects, datasets })
}
