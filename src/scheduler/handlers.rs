use super::protocol::*;
use super::service::Scheduler;
use crate::error::CoordinationError;
use crate::jobs::types::{JobId, JobView};

use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use std::sync::Arc;

/// Client-facing API of the scheduler.
pub fn router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route(ENDPOINT_JOBS, post(handle_submit_job).get(handle_list_jobs))
        .route(ENDPOINT_JOB, get(handle_job_status))
        .route(ENDPOINT_JOB_CANCEL, post(handle_cancel_job))
        .route(ENDPOINT_JOB_MATCHES, get(handle_job_matches))
        .route(ENDPOINT_HEALTH, get(handle_health))
        .layer(Extension(scheduler))
}

/// Maps coordination errors onto HTTP statuses with an `{"error": ...}` body.
pub struct ApiError(CoordinationError);

impl From<CoordinationError> for ApiError {
    fn from(err: CoordinationError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CoordinationError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            CoordinationError::JobNotFound(_) | CoordinationError::TaskNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            CoordinationError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoordinationError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request refused: {}", self.0);
        }

        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub async fn handle_submit_job(
    Extension(scheduler): Extension<Arc<Scheduler>>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let job_id = scheduler.submit(req.query).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })))
}

pub async fn handle_list_jobs(
    Extension(scheduler): Extension<Arc<Scheduler>>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let jobs = scheduler.list_jobs().await?;
    Ok(Json(ListJobsResponse { jobs }))
}

pub async fn handle_job_status(
    Extension(scheduler): Extension<Arc<Scheduler>>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let view = scheduler.status(&JobId(id)).await?;
    Ok(Json(view))
}

pub async fn handle_cancel_job(
    Extension(scheduler): Extension<Arc<Scheduler>>,
    Path(id): Path<String>,
) -> Result<Json<CancelJobResponse>, ApiError> {
    let job_id = JobId(id);
    let status = scheduler.cancel(&job_id).await?;
    Ok(Json(CancelJobResponse { job_id, status }))
}

pub async fn handle_job_matches(
    Extension(scheduler): Extension<Arc<Scheduler>>,
    Path(id): Path<String>,
    Query(params): Query<MatchesParams>,
) -> Result<Json<MatchesResponse>, ApiError> {
    let job_id = JobId(id);
    let offset = params.offset.unwrap_or(0);
    let limit = params
        .limit
        .unwrap_or(DEFAULT_MATCH_LIMIT)
        .min(MAX_MATCH_LIMIT);

    let matches = scheduler.matches(&job_id, offset, limit).await?;
    Ok(Json(MatchesResponse {
        job_id,
        offset,
        matches,
    }))
}

pub async fn handle_health(
    Extension(scheduler): Extension<Arc<Scheduler>>,
) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            matchers: scheduler.matchers().list_matchers(),
        }),
    )
}
