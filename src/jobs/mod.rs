//! Job Store Module
//!
//! The data model of the coordination core and the authoritative store of
//! job state.
//!
//! ## Core Concepts
//! - **Job**: one client search request, owned and mutated only by the scheduler.
//! - **Task**: a bounded batch of candidate objects, the unit leased to a worker.
//! - **Report**: one batch of per-object results sent back per task.
//! - **Ownership token**: per-job lock under which the scheduler mutates a job,
//!   never held across a storage query or a blocking broker wait.

pub mod store;
pub mod types;

pub use store::{JobOwnership, JobStore};
pub use types::*;
