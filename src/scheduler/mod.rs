//! Scheduler Module
//!
//! The coordinating side of the system and the only writer of job state.
//!
//! ## Architecture Overview
//! 1. **Submission**: the query is compiled to validate it, the owner's quota is
//!    charged and a `queued` job is recorded.
//! 2. **Dispatch**: the storage engine resolves the candidate set, which is split
//!    into bounded tasks and enqueued. An unreachable engine puts the job back in
//!    the queue with exponential backoff.
//! 3. **Aggregation**: task reports are folded into the job exactly once; failed
//!    tasks are retried up to a budget, then recorded as unevaluated.
//! 4. **Recovery**: tasks whose lease expired without a report are requeued.
//!
//! ## Submodules
//! - **`service`**: the `Scheduler` with its operations and background loops.
//! - **`batching`**: partitioning of candidate sets into tasks.
//! - **`handlers`** / **`protocol`**: the HTTP API.

pub mod batching;
pub mod handlers;
pub mod protocol;
pub mod service;

pub use handlers::router;
pub use service::{ReportDisposition, Scheduler};
