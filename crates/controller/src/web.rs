//! JSON REST facade over the executor's remote-control surface.

use std::env;
use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::db::{LogEntry, LogFilter};
use crate::error::ControlError;
use crate::executor::{ExecutorStatus, SharedExecutor};
use crate::schedule::ScheduleEntry;
use crate::zone::ZoneSummary;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Maps [`ControlError`] to a status code and a JSON error body.
pub struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::ZoneNotFound(_) | ControlError::EntryNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            ControlError::Invalid(_) | ControlError::Schedule(_) => StatusCode::BAD_REQUEST,
            ControlError::NotRunning => StatusCode::CONFLICT,
            ControlError::Internal(err) => {
                error!("request failed: {err:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(executor: SharedExecutor) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/executor/start", post(api_start))
        .route("/api/executor/stop", post(api_stop))
        .route("/api/zones", get(api_zones))
        .route("/api/zones/{id}", get(api_zone))
        .route("/api/zones/{id}/open", post(api_open))
        .route("/api/zones/{id}/close", post(api_close))
        .route("/api/zones/{id}/hold", post(api_hold))
        .route("/api/zones/{id}/schedule", post(api_add_entry))
        .route("/api/zones/{id}/schedule/{entry_id}", delete(api_remove_entry))
        .route("/api/logs", get(api_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(executor)
}

#[derive(Serialize)]
struct Lifecycle {
    /// False when the call was a no-op.
    changed: bool,
    running: bool,
}

async fn api_status(State(executor): State<SharedExecutor>) -> Json<ExecutorStatus> {
    Json(executor.status().await)
}

async fn api_start(State(executor): State<SharedExecutor>) -> ApiResult<Json<Lifecycle>> {
    let changed = executor.start().await?;
    Ok(Json(Lifecycle {
        changed,
        running: executor.is_running().await,
    }))
}

async fn api_stop(State(executor): State<SharedExecutor>) -> Json<Lifecycle> {
    let changed = executor.stop().await;
    Json(Lifecycle {
        changed,
        running: executor.is_running().await,
    })
}

async fn api_zones(State(executor): State<SharedExecutor>) -> Json<Vec<ZoneSummary>> {
    Json(executor.list_zones().await)
}

async fn api_zone(
    State(executor): State<SharedExecutor>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ZoneSummary>> {
    Ok(Json(executor.get_zone(id).await?))
}

async fn api_open(
    State(executor): State<SharedExecutor>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ZoneSummary>> {
    Ok(Json(executor.open_zone(id).await?))
}

async fn api_close(
    State(executor): State<SharedExecutor>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ZoneSummary>> {
    Ok(Json(executor.close_zone(id).await?))
}

async fn api_hold(
    State(executor): State<SharedExecutor>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ZoneSummary>> {
    Ok(Json(executor.hold_zone(id).await?))
}

async fn api_add_entry(
    State(executor): State<SharedExecutor>,
    Path(id): Path<i64>,
    Json(entry): Json<ScheduleEntry>,
) -> ApiResult<(StatusCode, Json<ScheduleEntry>)> {
    let entry = executor.add_schedule_entry(id, entry).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn api_remove_entry(
    State(executor): State<SharedExecutor>,
    Path((id, entry_id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    executor.remove_schedule_entry(id, entry_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn api_logs(
    State(executor): State<SharedExecutor>,
    Query(filter): Query<LogFilter>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    Ok(Json(executor.logs(&filter).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub fn port_from_env() -> u16 {
    env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(executor: SharedExecutor, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("api listening on http://{addr}");

    axum::serve(listener, router(executor))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
