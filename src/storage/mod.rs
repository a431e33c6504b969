//! Storage Query Module
//!
//! Adapters over the external index engine that turns a query into a
//! candidate set: the objects that may match and must be checked by workers.
//!
//! ## Core Concepts
//! - **Topology**: The engine splits its index into datasets; every dataset is
//!   queried separately and the answers are merged in dataset order.
//! - **Deduplication**: An object reported by several datasets is kept once,
//!   at its first occurrence.
//! - **Failure classes**: `Unavailable` is transient (the scheduler backs off
//!   and retries), `Rejected` is final (the job fails).
//!
//! ## Backends
//! - **`http`**: The index engine over its JSON protocol.
//! - **`directory`**: Full scan of the sample root when no index is configured.
//! - **`memory`**: Fixed datasets held in memory.

pub mod client;
pub mod directory;
pub mod http;
pub mod memory;
pub mod protocol;
pub mod types;

pub use client::{StorageError, StorageQueryClient, resolve_candidates};
pub use directory::DirectoryStorage;
pub use http::HttpStorageClient;
pub use memory::StaticStorage;
