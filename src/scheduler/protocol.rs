//! Scheduler HTTP Protocol
//!
//! Endpoints and DTOs of the client-facing API.

use crate::jobs::types::{JobId, JobStatus, JobView, MatchRecord, QuerySpec};
use serde::{Deserialize, Serialize};

pub const ENDPOINT_JOBS: &str = "/jobs";
pub const ENDPOINT_JOB: &str = "/jobs/:id";
pub const ENDPOINT_JOB_CANCEL: &str = "/jobs/:id/cancel";
pub const ENDPOINT_JOB_MATCHES: &str = "/jobs/:id/matches";
pub const ENDPOINT_HEALTH: &str = "/health";

/// Page size of the match listing when the client gives none.
pub const DEFAULT_MATCH_LIMIT: usize = 100;
pub const MAX_MATCH_LIMIT: usize = 10_000;

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(flatten)]
    pub query: QuerySpec,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<JobView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Query string of [`ENDPOINT_JOB_MATCHES`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MatchesParams {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MatchesResponse {
    pub job_id: JobId,
    pub offset: usize,
    pub matches: Vec<MatchRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub matchers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
