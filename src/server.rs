// HTTP server for admission checks, replication and Prometheus metrics
//
// Routes:
// - GET  /metrics                     Prometheus scrape endpoint
// - GET  /health                      liveness plus a short status summary
// - POST /v1/check                    admission decision with rate limit headers
// - GET  /v1/dashboard/{system_id}    admin snapshot for one system
// - POST /v1/admin/actions            admin action (rules, reputation, throttle)
// - POST /v1/replication/events       peers push event batches here
// - GET  /v1/replication/events       peers pull events here (?after=seq)
// - GET  /v1/replication/status       peer sync status

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::context::RequestContext;
use crate::error::Error;
use crate::metrics;
use crate::rate_limit::{AdminAction, DashboardBuilder, LimitCheckRequest, RateLimitManager};
use crate::replication::{DistributedReputationManager, EventBatch, EVENTS_PATH};

/// Upper bound on a single admission check made over HTTP
const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub rate_limit: Arc<RateLimitManager>,
    pub replication: Option<Arc<DistributedReputationManager>>,
}

impl AppState {
    pub fn new(rate_limit: Arc<RateLimitManager>) -> Self {
        Self {
            rate_limit,
            replication: None,
        }
    }

    pub fn with_replication(mut self, replication: Arc<DistributedReputationManager>) -> Self {
        self.replication = Some(replication);
        self
    }

    fn replication(&self) -> Result<&Arc<DistributedReputationManager>, ApiError> {
        self.replication.as_ref().ok_or_else(|| {
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "replication is not enabled")
        })
    }
}

/// Error response with a JSON body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Cancelled => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(err) => err.into(),
            Err(err) => Self {
                status: StatusCode::BAD_REQUEST,
                message: err.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request failed: {}", self.message);
        }
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

/// Build the router with all routes and request tracing
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/v1/check", post(check_handler))
        .route("/v1/dashboard/{system_id}", get(dashboard_handler))
        .route("/v1/admin/actions", post(admin_handler))
        .route(EVENTS_PATH, get(pull_handler).post(ingest_handler))
        .route("/v1/replication/status", get(sync_status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and run until `shutdown` resolves
pub async fn start_server<F>(bind: &str, port: u16, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    metrics::init().context("Failed to initialize metrics")?;

    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", bind, port))?;

    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind HTTP server")?;

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    Ok(())
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Health check endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.rate_limit.get_config().await;
    let throttle_level = state
        .rate_limit
        .throttler()
        .map(|t| t.get_current_level().as_str());

    Json(serde_json::json!({
        "status": "ok",
        "rate_limiting": config.enabled,
        "rules": state.rate_limit.rule_count().await,
        "throttle_level": throttle_level,
        "node_id": state.replication.as_ref().map(|r| r.node_id().to_string()),
    }))
}

async fn check_handler(
    State(state): State<AppState>,
    Json(req): Json<LimitCheckRequest>,
) -> Response {
    let ctx = RequestContext::with_timeout(CHECK_TIMEOUT);
    let decision = state.rate_limit.admit(&ctx, &req).await;

    let mut response = match decision.rejection_body() {
        Some(body) => (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response(),
        None => (StatusCode::OK, Json(&decision)).into_response(),
    };
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

async fn dashboard_handler(
    State(state): State<AppState>,
    Path(system_id): Path<String>,
) -> Result<Response, ApiError> {
    let data = DashboardBuilder::new(&state.rate_limit, &system_id).build().await?;
    Ok(Json(data).into_response())
}

async fn admin_handler(
    State(state): State<AppState>,
    Json(action): Json<AdminAction>,
) -> Result<StatusCode, ApiError> {
    info!("Admin action: {:?}", action);
    action.execute(&state.rate_limit).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ingest_handler(
    State(state): State<AppState>,
    Json(batch): Json<EventBatch>,
) -> Result<Response, ApiError> {
    let replication = state.replication()?;
    let report = replication.ingest_events(batch.events).await;
    info!(
        "Ingested batch from {}: {} accepted, {} duplicate(s), {} rejected",
        batch.source_node, report.accepted, report.duplicates, report.rejected
    );
    Ok(Json(report).into_response())
}

#[derive(Debug, Deserialize)]
struct PullParams {
    /// Journal sequence number of the last event already pulled
    after: Option<u64>,
}

async fn pull_handler(
    State(state): State<AppState>,
    Query(params): Query<PullParams>,
) -> Result<Response, ApiError> {
    let replication = state.replication()?;
    Ok(Json(replication.events_after(params.after).await).into_response())
}

async fn sync_status_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let replication = state.replication()?;
    Ok(Json(replication.get_sync_status()).into_response())
}
