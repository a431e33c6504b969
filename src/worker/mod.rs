//! Worker Module
//!
//! The daemon side of the system: leases tasks, evaluates the objects of each
//! batch against the job's query and reports the results.
//!
//! ## Architecture Overview
//! 1. **Lease**: each loop blocks on the broker for the next pending task.
//! 2. **Compile**: the job's query is compiled once and cached per worker.
//! 3. **Evaluate**: objects are read from the sample store one by one, checking
//!    for cancellation in between.
//! 4. **Report**: one report per task goes to the report queue. The lease is
//!    kept until the scheduler settles the task, so a lost report ends in
//!    lease expiry rather than a stuck task.

pub mod daemon;

pub use daemon::Worker;

#[cfg(test)]
mod tests;
