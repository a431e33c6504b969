//! Partitioning of a candidate set into tasks.

use crate::jobs::types::{JobId, TaskId, TaskKey, TaskRecord};
use crate::storage::types::ObjectId;

/// Splits `objects` into consecutive tasks of at most `max_batch_size`
/// objects, numbered from 0. The batches are disjoint and keep the
/// candidate order, so their concatenation is the input.
pub fn build_tasks(job_id: &JobId, objects: &[ObjectId], max_batch_size: usize) -> Vec<TaskRecord> {
    objects
        .chunks(max_batch_size.max(1))
        .enumerate()
        .map(|(i, batch)| {
            TaskRecord::new(TaskKey::new(job_id.clone(), TaskId(i as u32)), batch.to_vec())
        })
        .collect()
}
