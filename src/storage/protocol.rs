//! Storage Engine Protocol
//!
//! API endpoints and DTOs spoken with the index engine over HTTP (JSON).

use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Lists the datasets the engine currently serves.
pub const ENDPOINT_TOPOLOGY: &str = "/topology";
/// Runs one index query against one dataset.
pub const ENDPOINT_QUERY: &str = "/query";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub id: String,
    #[serde(default)]
    pub taints: Vec<String>,
    #[serde(default)]
    pub file_count: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopologyResponse {
    pub datasets: Vec<DatasetEntry>,
}

/// Request body of [`ENDPOINT_QUERY`].
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Hex-string query, `None` selects every file of the dataset.
    pub query: Option<String>,
    #[serde(default)]
    pub taints: Vec<String>,
    pub dataset: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub files: Vec<String>,
}

/// Body the engine sends along with a 4xx/5xx status.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
