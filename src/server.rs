//! HTTP surface for scanning, matching, and cost reporting.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/identify` | Normalize an uploaded still and identify its components |
//! | `POST` | `/match` | Match an inventory against a project catalog |
//! | `GET`  | `/costs/summary` | Per-user and platform cost totals |
//!
//! # Error Contract
//!
//! Errors use a single body shape:
//!
//! ```json
//! { "error": { "code": "validation_error", "message": "image is required" } }
//! ```
//!
//! Status codes follow [`ScanError::http_status`]: `400` for validation and
//! decode failures, `429` when upstream rate-limits (passed through, never
//! retried), `500` for misconfiguration and upstream failures, `502` when an
//! identification reply cannot be parsed.
//!
//! `/match` is the exception for parse failures: an unreadable model reply is
//! a `200` with `matched_projects: []` and an `error` diagnostic.
//!
//! Bodies over `[server].max_body_bytes` are rejected with `413` and code
//! `payload_too_large` before any decoding happens.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser clients can
//! call the service directly.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use partscan_core::ledger::{summarize, LedgerSummary};
use partscan_core::models::{Component, Project};

use crate::cache::FingerprintCache;
use crate::config::Config;
use crate::cost::{CostSink, JsonlCostLog, MemoryCostLog, Pricing};
use crate::error::ScanError;
use crate::identify::{Identification, IdentificationOrchestrator};
use crate::logging::{Logger, TracingLogger};
use crate::matcher::{MatchOutcome, ProjectMatcher};
use crate::normalize::{decode_image_payload, ImageNormalizer};
use crate::remote::{HttpModel, StructuredModel};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    normalizer: Arc<ImageNormalizer>,
    identifier: Arc<IdentificationOrchestrator>,
    matcher: Arc<ProjectMatcher>,
    costs: Arc<dyn CostSink>,
    max_body_bytes: usize,
}

impl AppState {
    /// Wire the pipeline around an explicit model and cost sink.
    pub fn new(
        config: &Config,
        model: Arc<dyn StructuredModel>,
        costs: Arc<dyn CostSink>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let pricing = Pricing::from(&config.model);
        let cache = Arc::new(FingerprintCache::new(config.cache.capacity));
        Self {
            normalizer: Arc::new(ImageNormalizer::new(&config.normalize)),
            identifier: Arc::new(IdentificationOrchestrator::new(
                model.clone(),
                costs.clone(),
                cache,
                pricing,
                logger.clone(),
            )),
            matcher: Arc::new(ProjectMatcher::new(
                model,
                costs.clone(),
                pricing,
                config.matcher.clone(),
                logger,
            )),
            costs,
            max_body_bytes: config.server.max_body_bytes,
        }
    }

    /// Production wiring: HTTP model, configured cost log, tracing logger.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let model = Arc::new(HttpModel::new(&config.model)?);
        Ok(Self::new(
            config,
            model,
            cost_sink(config),
            Arc::new(TracingLogger),
        ))
    }
}

/// JSON Lines log when `[costs].log_path` is set, in-memory otherwise.
pub fn cost_sink(config: &Config) -> Arc<dyn CostSink> {
    match &config.costs.log_path {
        Some(path) => Arc::new(JsonlCostLog::new(path)),
        None => Arc::new(MemoryCostLog::new()),
    }
}

/// Build the router with its middleware applied.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = DefaultBodyLimit::max(state.max_body_bytes);

    Router::new()
        .route("/health", get(handle_health))
        .route("/identify", post(handle_identify))
        .route("/match", post(handle_match))
        .route("/costs/summary", get(handle_cost_summary))
        .layer(body_limit)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind`.
///
/// Runs until the process is terminated. Returns an error if binding fails.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config)?;
    if config.model.api_key().is_none() {
        tracing::warn!(
            env = %config.model.api_key_env,
            "model credential not set; /identify and /match will return 500"
        );
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "partscan listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ScanError> for AppError {
    fn from(err: ScanError) -> Self {
        AppError {
            status: StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return AppError {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                code: "payload_too_large".to_string(),
                message: rejection.body_text(),
            };
        }
        ScanError::Validation(rejection.body_text()).into()
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /identify ============

#[derive(Debug, Deserialize)]
struct IdentifyRequest {
    #[serde(default)]
    user_id: Option<String>,
    /// Base64 JPEG/PNG, optionally as a `data:` URL.
    #[serde(default)]
    image: Option<String>,
}

/// Handler for `POST /identify`.
///
/// Decoding and resizing run on the blocking pool; the identification call
/// itself is async.
async fn handle_identify(
    State(state): State<AppState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<Identification>, AppError> {
    let Json(req) = payload?;
    let user_id = req.user_id.unwrap_or_default();
    let image = req
        .image
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ScanError::Validation("image is required".to_string()))?;

    let raw = decode_image_payload(&image)?;
    let normalizer = state.normalizer.clone();
    let normalized = tokio::task::spawn_blocking(move || normalizer.normalize(&raw))
        .await
        .map_err(|e| internal(format!("normalization task failed: {}", e)))??;

    let identification = state.identifier.identify(&user_id, &normalized).await?;
    Ok(Json(identification))
}

// ============ POST /match ============

#[derive(Debug, Deserialize)]
struct MatchRequest {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    inventory: Option<Vec<Component>>,
    #[serde(default)]
    projects: Option<Vec<Project>>,
}

/// Handler for `POST /match`. Unattributed calls are billed to `anonymous`.
async fn handle_match(
    State(state): State<AppState>,
    payload: Result<Json<MatchRequest>, JsonRejection>,
) -> Result<Json<MatchOutcome>, AppError> {
    let Json(req) = payload?;
    let user_id = req
        .user_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "anonymous".to_string());

    let outcome = state
        .matcher
        .match_projects(&user_id, req.inventory.as_deref(), req.projects.as_deref())
        .await?;
    Ok(Json(outcome))
}

// ============ GET /costs/summary ============

async fn handle_cost_summary(State(state): State<AppState>) -> Json<LedgerSummary> {
    Json(summarize(&state.costs.snapshot().await))
}
