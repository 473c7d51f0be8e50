use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use super::db::DbHandle;
use super::dispatcher::Dispatcher;
use super::status::StatusReporter;
use crate::errors::DeployError;

/// Deployments returned by the history endpoint.
const HISTORY_LIMIT: i64 = 50;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub dispatcher: Dispatcher,
    pub reporter: StatusReporter,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        let msg = err.to_string();
        match err {
            DeployError::NotFound { .. } => ApiError::NotFound(msg),
            DeployError::Conflict { .. } => ApiError::Conflict(msg),
            DeployError::InvalidInput(_) => ApiError::BadRequest(msg),
            _ => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/applications/{id}/deploy", post(trigger_deployment))
        .route("/api/applications/{id}/deployments", get(list_deployments))
        .route("/api/applications/{id}/logs", get(application_logs))
        .route("/api/deployments/{id}", get(get_deployment))
        .route("/api/deployments/{id}/status", get(deployment_status))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn trigger_deployment(
    State(state): State<SharedState>,
    Path(application_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state.dispatcher.start_deployment(application_id).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

async fn list_deployments(
    State(state): State<SharedState>,
    Path(application_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deployments = state
        .db
        .call(move |db| {
            if db.get_application(application_id)?.is_none() {
                return Ok(None);
            }
            db.list_deployments_for_application(application_id, HISTORY_LIMIT)
                .map(Some)
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match deployments {
        Some(deployments) => Ok(Json(deployments)),
        None => Err(DeployError::application_not_found(application_id).into()),
    }
}

async fn application_logs(
    State(state): State<SharedState>,
    Path(application_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.reporter.logs(application_id).await?))
}

async fn get_deployment(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state
        .db
        .call(move |db| db.get_deployment(id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    match deployment {
        Some(deployment) => Ok(Json(deployment)),
        None => Err(DeployError::deployment_not_found(id).into()),
    }
}

async fn deployment_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.reporter.status(id).await?))
}

// ── Tests ─────────────────────────────────────────────────────────────
