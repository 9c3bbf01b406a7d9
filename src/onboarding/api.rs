use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde_json::json;

use super::models::{OnboardingConfig, StartedDeployment};
use super::pipeline::Orchestrator;
use super::prerequisites::check_prerequisites;
use super::registry::Registry;
use super::runner::CommandRunner;
use super::status::query_status;
use super::validate::validate;
use super::ws::{self, Broadcaster};
use crate::config::{ServiceConfig, ToolSettings};
use crate::errors::{StatusError, ValidationErrors};

pub struct AppState {
    pub registry: Arc<Registry>,
    pub broadcaster: Arc<Broadcaster>,
    pub orchestrator: Orchestrator,
    pub runner: Arc<dyn CommandRunner>,
    pub tools: ToolSettings,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire a fresh registry, broadcaster and orchestrator around `runner`.
    pub fn new(config: &ServiceConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let registry = Arc::new(Registry::new());
        let broadcaster = Arc::new(Broadcaster::new(config.events.subscriber_buffer));
        let orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&broadcaster),
            Arc::clone(&runner),
            config.tools.clone(),
            config.deployments.clone(),
        );
        Self {
            registry,
            broadcaster,
            orchestrator,
            runner,
            tools: config.tools.clone(),
            started_at: Utc::now(),
        }
    }
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Validation(ValidationErrors),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({"error": msg})),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            ApiError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                json!({"error": "Validation failed", "details": errors.errors}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StatusError> for ApiError {
    fn from(e: StatusError) -> Self {
        let message = e.to_string();
        match e {
            StatusError::InvalidId(_) => ApiError::BadRequest(message),
            StatusError::NotFound => ApiError::NotFound(message),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/version", get(version))
        .route("/api/check-prerequisites", get(prerequisites))
        .route("/api/start-onboarding", post(start_onboarding))
        .route("/api/deployment/{id}", get(deployment_status))
        .route("/ws/{id}", get(ws::ws_handler))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "timestamp": Utc::now()}))
}

async fn version(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let now = Utc::now();
    let uptime = (now - state.started_at).num_seconds().max(0);
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime,
        "timestamp": now,
    }))
}

async fn prerequisites(State(state): State<SharedState>) -> impl IntoResponse {
    let report = check_prerequisites(state.runner.as_ref(), &state.tools, FsPath::new(".")).await;
    Json(report)
}

async fn start_onboarding(
    State(state): State<SharedState>,
    payload: Result<Json<OnboardingConfig>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(config) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if let Err(errors) = validate(&config) {
        tracing::info!(fields = errors.errors.len(), "Rejected onboarding request");
        return Err(ApiError::Validation(errors));
    }
    let handle = state.orchestrator.start(config);
    Ok(Json(StartedDeployment::new(handle.id)))
}

async fn deployment_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = query_status(&state.registry, &id).await?;
    Ok(Json(snapshot))
}
