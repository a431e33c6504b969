//! Coordination Error Taxonomy
//!
//! Every fallible operation of the scheduler, the workers and the job store
//! surfaces one of these variants. Per-object failures are recorded on the
//! task result rather than returned, so `ObjectProcessingError` mostly shows
//! up as the message of an `error` outcome.

use crate::jobs::types::{JobId, TaskKey};
use crate::queue::BrokerError;
use crate::storage::StorageError;
use crate::storage::types::ObjectId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The query cannot be parsed or validated by the matching capability,
    /// or the storage engine rejected it.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The storage engine could not be reached.
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("lease on task {key} expired")]
    TaskLeaseExpired { key: TaskKey },

    #[error("failed to process object {object}: {reason}")]
    ObjectProcessingError { object: ObjectId, reason: String },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskKey),

    #[error("quota exceeded for {owner}: {used}/{limit}")]
    QuotaExceeded { owner: String, used: u64, limit: u64 },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl From<StorageError> for CoordinationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(reason) => CoordinationError::BackendUnavailable(reason),
            StorageError::Rejected(reason) => CoordinationError::InvalidQuery(reason),
        }
    }
}
