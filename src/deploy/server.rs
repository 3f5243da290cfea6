//! Read-only HTTP view of the deployment queue for operators.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::models::JobStatus;
use crate::errors::MarketError;
use crate::market::db::DbHandle;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct StatusState {
    pub db: DbHandle,
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<MarketError> for ApiError {
    fn from(e: MarketError) -> Self {
        if e.is_not_found() {
            ApiError::NotFound(e.to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn status_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn list_jobs(
    State(state): State<StatusState>,
    Query(query): Query<JobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(raw.parse::<JobStatus>().map_err(ApiError::BadRequest)?),
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let jobs = state
        .db
        .call(move |db| db.list_jobs(status, limit))
        .await?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<StatusState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .db
        .call(move |db| db.get_job(id)?.ok_or(MarketError::JobNotFound { id }))
        .await?;
    Ok(Json(job))
}

/// Serve the status router until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, db: DbHandle, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status server to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "Status server listening");

    axum::serve(listener, status_router(StatusState { db }))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Status server error")?;
    Ok(())
}
