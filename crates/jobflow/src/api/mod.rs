use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::Error;
use crate::jobs::model::NewJob;
use crate::jobs::{Dispatcher, JobState, ResultOutcome, StatusOutcome, StatusService};

pub mod models;

use models::{
    ErrorBody, HealthResponse, ResultResponse, StatusResponse, SubmitQuery, SubmitResponse,
};

const NOT_FOUND_MESSAGE: &str = "Job not found or expired";

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Dispatcher,
    pub status: StatusService,
    /// Handler used when `POST /jobs` carries no `job_type`.
    pub default_job_type: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/jobs", post(submit_job))
        .route("/jobs/:id/status", get(get_status))
        .route("/jobs/:id/result", get(get_result))
        // Paths used by earlier clients
        .route("/enqueue", post(submit_job))
        .route("/status/:id", get(get_status))
        .route("/result/:id", get(get_result))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_err(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody { error: msg.into() }))
}

fn not_found() -> ApiError {
    api_err(StatusCode::NOT_FOUND, NOT_FOUND_MESSAGE)
}

fn error_response(e: Error) -> ApiError {
    match &e {
        Error::Validation(_) => api_err(StatusCode::BAD_REQUEST, e.to_string()),
        Error::PayloadTooLarge { .. } => api_err(StatusCode::PAYLOAD_TOO_LARGE, e.to_string()),
        Error::NotFound(_) => not_found(),
        Error::Store(_) => {
            tracing::warn!(error = %e, "store error while serving request");
            api_err(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Error::LeaseLost(_) | Error::Codec { .. } => {
            tracing::error!(error = %e, "internal error while serving request");
            api_err(StatusCode::INTERNAL_SERVER_ERROR, format!("internal error: {e}"))
        }
    }
}

/// Ids that don't parse can't exist, so they read as not found.
fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse().map_err(|_| not_found())
}

pub async fn index() -> Json<Value> {
    Json(json!({ "message": "jobflow is running" }))
}

pub async fn submit_job(
    State(state): State<ApiState>,
    Query(query): Query<SubmitQuery>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let Json(payload) = body.map_err(|rejection| {
        api_err(
            StatusCode::BAD_REQUEST,
            format!("validation failed: {}", rejection.body_text()),
        )
    })?;

    let job_type = query
        .job_type
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| state.default_job_type.clone());

    let mut job = NewJob::new(job_type, payload);
    if let Some(n) = query.max_attempts {
        job = job.with_max_attempts(n);
    }

    let job_id = state.dispatcher.submit(job).await.map_err(error_response)?;
    Ok(Json(SubmitResponse { job_id }))
}

pub async fn get_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let job_id = parse_id(&id)?;
    match state.status.get_status(job_id).await.map_err(error_response)? {
        StatusOutcome::Found(job_state) => Ok(Json(StatusResponse {
            job_id,
            state: job_state,
        })),
        StatusOutcome::NotFoundOrExpired => Err(not_found()),
    }
}

pub async fn get_result(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = parse_id(&id)?;
    let outcome = state.status.get_result(job_id).await.map_err(error_response)?;

    let response = match outcome {
        ResultOutcome::Finished(result) => (
            StatusCode::OK,
            Json(ResultResponse {
                job_id,
                state: JobState::Finished,
                result: Some(result),
                error: None,
            }),
        )
            .into_response(),
        ResultOutcome::Failed(failure) => (
            StatusCode::OK,
            Json(ResultResponse {
                job_id,
                state: JobState::Failed,
                result: None,
                error: Some(failure.into()),
            }),
        )
            .into_response(),
        ResultOutcome::Pending(job_state) => (
            StatusCode::ACCEPTED,
            Json(StatusResponse {
                job_id,
                state: job_state,
            }),
        )
            .into_response(),
        ResultOutcome::NotFoundOrExpired => return Err(not_found()),
    };
    Ok(response)
}

pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let queue = state.dispatcher.queue();
    match queue.depth().await {
        Ok(depth) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".into(),
                queue: queue.name().to_string(),
                depth: Some(depth),
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "health check could not reach the store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded".into(),
                    queue: queue.name().to_string(),
                    depth: None,
                }),
            )
        }
    }
}
