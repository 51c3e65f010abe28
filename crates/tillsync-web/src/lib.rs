//! Axum JSON trigger surface for the ingestion pipeline.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use tillsync_core::SourceType;
use tillsync_ingest::{IngestConfig, IngestPipeline, ProcessOutcome};

pub const CRATE_NAME: &str = "tillsync-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestPipeline>, pool: Option<PgPool>) -> Self {
        Self { pipeline, pool }
    }
}

/// Trigger body: either one payload by id, or a sweep over a scope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub raw_data_id: Option<Uuid>,
    #[serde(default)]
    pub process_all: bool,
    pub owner_scope: Option<String>,
    pub source_type: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub success: bool,
    pub processed_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub results: Vec<ProcessOutcome>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ingest/process", post(process_handler))
        .route("/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TILLSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);

    let config = IngestConfig::from_env();
    let pool = tillsync_storage::connect(&config.database_url).await?;
    let pipeline = Arc::new(IngestPipeline::from_pool(config, pool.clone())?);

    if let Some(scheduler) = pipeline.maybe_build_scheduler().await? {
        scheduler.start().await?;
        info!("sweep scheduler started");
    }

    let state = AppState::new(pipeline, Some(pool));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "tillsync web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn process_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProcessRequest>,
) -> Response {
    if let Some(raw_id) = request.raw_data_id {
        let outcome = state.pipeline.process_one(raw_id).await;
        let failed = outcome.error.is_some();
        let response = ProcessResponse {
            success: !failed,
            processed_count: 1,
            success_count: usize::from(!failed),
            error_count: usize::from(failed),
            results: vec![outcome],
        };
        return Json(response).into_response();
    }

    if request.process_all {
        let Some(owner_scope) = request.owner_scope.as_deref() else {
            return bad_request("processAll requires ownerScope");
        };
        let source_type = match request.source_type.as_deref() {
            None => None,
            Some(raw) => match SourceType::parse(raw) {
                Some(st) => Some(st),
                None => return bad_request("unknown sourceType"),
            },
        };
        let limit = request.limit.unwrap_or(500).clamp(1, 10_000);

        return match state.pipeline.sweep(source_type, owner_scope, limit).await {
            Ok(summary) => {
                let response = ProcessResponse {
                    success: summary.error_count == 0,
                    processed_count: summary.results.len(),
                    success_count: summary.success_count,
                    error_count: summary.error_count,
                    results: summary.results,
                };
                Json(response).into_response()
            }
            Err(err) => server_error(err),
        };
    }

    bad_request("expected rawDataId or processAll")
}

async fn runs_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(pool) = &state.pool else {
        return Json(serde_json::json!({ "runs": [] })).into_response();
    };
    match tillsync_storage::load_recent_runs(pool, 50).await {
        Ok(runs) => Json(serde_json::json!({ "runs": runs })).into_response(),
        Err(err) => server_error(err),
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "success": false, "error": format!("{err:#}") })),
    )
        .into_response()
}
