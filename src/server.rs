//! HTTP API served by the daemon.
//!
//! Reads go straight to the [`JsonStore`]; writes go through the same
//! [`EventQueue`] as socket records, so the single consumer remains the only
//! writer.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/v1/executions` | Filtered executions, newest first (`tool`, `package`, `since`, `until`, `last`, `limit`) |
//! | `POST` | `/api/v1/executions` | Enqueue one record: `202`, `400` malformed, `503` queue full |
//! | `GET`  | `/api/v1/executions/{id}` | One execution or `404` |
//! | `GET`  | `/api/v1/packages` | Package aggregates (`tool`) |
//! | `GET`  | `/api/v1/stats` | Aggregate statistics |
//! | `GET`  | `/api/v1/health` | Status, version, uptime, active monitors, dropped events |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "limit must be a non-negative integer" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `method_not_allowed` (405),
//! `queue_full` (503), `internal` (500).
//!
//! # CORS
//!
//! Disabled unless `api.cors_enabled` is set, in which case all origins,
//! methods, and headers are permitted.

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::config::window_start;
use crate::models::{parse_timestamp, ExecutionRecord, PackageInfo, QueryFilter, Statistics};
use crate::parsers::ParserRegistry;
use crate::queue::{EventQueue, SubmitError};
use crate::storage::JsonStore;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<JsonStore>,
    pub registry: Arc<ParserRegistry>,
    pub queue: EventQueue,
    pub started_at: Instant,
}

/// Build the `/api/v1` router.
pub fn router(state: AppState, cors_enabled: bool) -> Router {
    let app = Router::new()
        .route(
            "/api/v1/executions",
            get(list_executions)
                .post(submit_execution)
                .fallback(method_not_allowed),
        )
        .route(
            "/api/v1/executions/{id}",
            get(get_execution).fallback(method_not_allowed),
        )
        .route(
            "/api/v1/packages",
            get(list_packages).fallback(method_not_allowed),
        )
        .route("/api/v1/stats", get(stats).fallback(method_not_allowed))
        .route("/api/v1/health", get(health).fallback(method_not_allowed))
        .fallback(route_not_found)
        .with_state(state);

    if cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app.layer(cors)
    } else {
        app
    }
}

// ============ Request / Response Types ============

/// Query parameters for `GET /api/v1/executions`.
#[derive(Debug, Default, Deserialize)]
pub struct ExecutionQuery {
    pub tool: Option<String>,
    pub package: Option<String>,
    /// RFC 3339 timestamp or `YYYY-MM-DD`, inclusive.
    pub since: Option<String>,
    /// RFC 3339 timestamp or `YYYY-MM-DD`, exclusive.
    pub until: Option<String>,
    /// Relative lower bound such as `7d`; `since` wins when both are given.
    pub last: Option<String>,
    pub limit: Option<usize>,
}

impl ExecutionQuery {
    fn into_filter(self, now: DateTime<Utc>) -> Result<QueryFilter, AppError> {
        let since = match (&self.since, &self.last) {
            (Some(since), _) => Some(parse_timestamp(since).map_err(bad_request)?),
            (None, Some(last)) => {
                Some(window_start(now, last).map_err(|e| bad_request(e.to_string()))?)
            }
            (None, None) => None,
        };
        let until = self
            .until
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(bad_request)?;

        Ok(QueryFilter {
            tool: self.tool.filter(|t| !t.is_empty()),
            package: self.package.filter(|p| !p.is_empty()),
            since,
            until,
            limit: self.limit,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PackageQuery {
    pub tool: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub status: String,
}

/// Response body for `GET /api/v1/health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Human-readable, e.g. `2h 5m 3s`.
    pub uptime: String,
    pub uptime_secs: u64,
    pub monitors_active: usize,
    pub dropped_events: u64,
}

// ============ Error Types ============

/// Standard error response envelope.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn queue_full(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "queue_full",
        message: message.into(),
    }
}

// ============ Handlers ============

async fn list_executions(
    State(state): State<AppState>,
    query: Result<Query<ExecutionQuery>, QueryRejection>,
) -> Result<Json<Vec<ExecutionRecord>>, AppError> {
    let Query(query) = query.map_err(|e| bad_request(e.body_text()))?;
    let filter = query.into_filter(Utc::now())?;
    Ok(Json(state.store.query(&filter)))
}

/// The body is decoded by hand so that malformed JSON gets the standard
/// error envelope instead of axum's plain-text rejection.
async fn submit_execution(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), AppError> {
    let record: ExecutionRecord = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("malformed execution record: {e}")))?;
    record.validate().map_err(bad_request)?;

    debug!(tool = %record.tool, "record received over HTTP");
    match state.queue.submit(record).await {
        Ok(()) => Ok((
            StatusCode::ACCEPTED,
            Json(AcceptedResponse {
                status: "accepted".to_string(),
            }),
        )),
        Err(SubmitError::Full) => Err(queue_full("event queue is full, record dropped")),
        Err(SubmitError::Closed) => Err(queue_full("daemon is shutting down, record dropped")),
    }
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRecord>, AppError> {
    state
        .store
        .get_execution(&id)
        .map(Json)
        .ok_or_else(|| not_found(format!("execution not found: {id}")))
}

async fn list_packages(
    State(state): State<AppState>,
    query: Result<Query<PackageQuery>, QueryRejection>,
) -> Result<Json<Vec<PackageInfo>>, AppError> {
    let Query(query) = query.map_err(|e| bad_request(e.body_text()))?;
    let tool = query.tool.as_deref().filter(|t| !t.is_empty());
    Ok(Json(state.store.get_packages(tool)))
}

async fn stats(State(state): State<AppState>) -> Json<Statistics> {
    Json(state.store.statistics())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = state.started_at.elapsed();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: format_uptime(uptime),
        uptime_secs: uptime.as_secs(),
        monitors_active: state.registry.active_count(),
        dropped_events: state.queue.dropped(),
    })
}

async fn method_not_allowed() -> AppError {
    AppError {
        status: StatusCode::METHOD_NOT_ALLOWED,
        code: "method_not_allowed",
        message: "method not allowed on this route".to_string(),
    }
}

async fn route_not_found() -> AppError {
    not_found("no such route")
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
