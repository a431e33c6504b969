//! Distributed Bulk Search Library
//!
//! Core of the scheduler and worker daemons that run a content query over a
//! large file corpus. The binary (`main.rs`) wires these modules together.
//!
//! ## Architecture Modules
//! - **`storage`**: Client of the external index engine. Resolves a query into
//!   a deduplicated, ordered candidate set, dataset by dataset.
//! - **`queue`**: The `Broker` seam shared by every process: task lease queue,
//!   report queue, job ledger and match lists. In-memory and redis backends.
//! - **`jobs`**: Job, task and report records, plus per-job ownership tokens
//!   that make the scheduler the single writer of every job.
//! - **`matching`**: Pluggable matchers (literal, regex) and the read-only
//!   sample store workers evaluate objects from.
//! - **`scheduler`**: Submission, dispatch, aggregation, cancellation, lease
//!   reclamation and the client HTTP API.
//! - **`worker`**: Lease loops that evaluate batches and report results.
//! - **`quota`**: Per-owner submission budgets.

pub mod config;
pub mod error;
pub mod jobs;
pub mod matching;
pub mod queue;
pub mod quota;
pub mod scheduler;
pub mod storage;
pub mod worker;
