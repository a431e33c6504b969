//! Task Queue Module
//!
//! The shared broker through which the scheduler and the workers coordinate.
//!
//! ## Architecture Overview
//! The queue follows a **Pull-based** model with **Lease** management:
//! 1. **Enqueue**: The scheduler stores each task and appends its key to the ready FIFO.
//! 2. **Lease**: A worker pops the oldest pending task and holds it under a lease id
//!    until the lease expires. Tasks of cancelled jobs are never leased.
//! 3. **Report**: The worker pushes one report per task onto the report FIFO and
//!    keeps its lease. Settling the task from the report is what drops the lease.
//! 4. **Reclaim**: Tasks whose lease expired before they were settled are requeued
//!    by the scheduler (at-least-once semantics).
//!
//! The same broker also holds the job ledger, the index of jobs awaiting
//! dispatch and the per-task match lists.
//!
//! ## Submodules
//! - **`broker`**: The `Broker` trait, the contract every backend honours.
//! - **`memory`**: In-process backend for standalone deployments and tests.
//! - **`redis`**: Redis backend for multi-process deployments.

pub mod broker;
pub mod error;
pub mod memory;
pub mod redis;

pub use broker::Broker;
pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use self::redis::RedisBroker;

#[cfg(test)]
mod tests;
