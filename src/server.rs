//! JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/context` | Retrieve and assemble context (semantic or sampling mode) |
//! | `POST` | `/context/sample` | Stratified sample of a filtered scope |
//! | `POST` | `/analyze` | Retrieve context, then run the task through the generation pool |
//! | `POST` | `/config/reload` | Re-read the config file and rebuild the engine |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "date_range.from (...) is after date_range.to (...)" } }
//! ```
//!
//! Error codes: `bad_request` (400), `generation_disabled` (400),
//! `internal` (500). Timeouts and per-type retrieval failures are not
//! errors; they are reported in the response `meta`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the dashboard can call
//! the API from the browser.

use std::sync::{Arc, RwLock};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use qe_context_core::filter::ScopeFilter;
use qe_context_core::models::SourceType;
use qe_context_core::sampler::SamplingResult;
use qe_context_core::store::{RecordStore, TitleResolver, VectorIndex};

use crate::config::{Config, SharedConfig};
use crate::db;
use crate::embedding::create_embedder;
use crate::engine::{ContextEngine, ContextRequest, ContextResponse, DEFAULT_SOURCE_TYPES};
use crate::generate::{build_prompt, GenerationPool};
use crate::migrate;
use crate::sqlite_store::SqliteStore;

/// The read collaborators the engine is built on.
#[derive(Clone)]
pub struct Collaborators {
    pub index: Arc<dyn VectorIndex>,
    pub records: Arc<dyn RecordStore>,
    pub titles: Arc<dyn TitleResolver>,
}

impl Collaborators {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: VectorIndex + RecordStore + TitleResolver + 'static,
    {
        Self {
            index: store.clone(),
            records: store.clone(),
            titles: store,
        }
    }
}

/// Everything derived from one config snapshot.
struct Runtime {
    engine: ContextEngine,
    generation: Option<GenerationPool>,
    system_prompt: Option<String>,
}

impl Runtime {
    fn build(config: &Config, collaborators: &Collaborators) -> anyhow::Result<Self> {
        let engine = ContextEngine::new(
            collaborators.index.clone(),
            collaborators.records.clone(),
            collaborators.titles.clone(),
            config.resolve(),
        );
        Ok(Self {
            engine,
            generation: GenerationPool::from_config(&config.generation)?,
            system_prompt: config.generation.system_prompt.clone(),
        })
    }
}

/// Shared state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<SharedConfig>,
    collaborators: Collaborators,
    runtime: Arc<RwLock<Arc<Runtime>>>,
}

impl AppState {
    pub fn new(config: Arc<SharedConfig>, collaborators: Collaborators) -> anyhow::Result<Self> {
        let runtime = Runtime::build(&config.current(), &collaborators)?;
        Ok(Self {
            config,
            collaborators,
            runtime: Arc::new(RwLock::new(Arc::new(runtime))),
        })
    }

    /// Replace the generation pool built from config.
    pub fn with_generation(self, pool: GenerationPool) -> Self {
        let current = self.runtime();
        let runtime = Runtime {
            engine: ContextEngine::new(
                self.collaborators.index.clone(),
                self.collaborators.records.clone(),
                self.collaborators.titles.clone(),
                current.engine.settings().clone(),
            ),
            generation: Some(pool),
            system_prompt: current.system_prompt.clone(),
        };
        *self.runtime.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(runtime);
        self
    }

    fn runtime(&self) -> Arc<Runtime> {
        self.runtime
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-read the config file and swap in a freshly built engine. The
    /// embedder and database stay as they were at startup.
    pub fn reload(&self) -> anyhow::Result<()> {
        let config = self.config.reload()?;
        let runtime = Runtime::build(&config, &self.collaborators)?;
        *self.runtime.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(runtime);
        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/context", post(handle_context))
        .route("/context/sample", post(handle_sample))
        .route("/analyze", post(handle_analyze))
        .route("/config/reload", post(handle_reload))
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on `[server].bind` over the SQLite store.
pub async fn run_server(config: Arc<SharedConfig>) -> anyhow::Result<()> {
    let snapshot = config.current();
    let pool = db::connect(&snapshot).await?;
    migrate::migrate_pool(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool, create_embedder(&snapshot.embedding)?));

    let state = AppState::new(config, Collaborators::from_store(store))?;
    let app = router(state);

    let bind_addr = snapshot.server.bind.clone();
    tracing::info!(bind = %bind_addr, "server listening");
    println!("Context server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
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

struct AppError {
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

fn generation_disabled() -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "generation_disabled",
        message: "text generation is disabled; set [generation] provider in config".to_string(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

/// Decode a JSON body into `T`, mapping failures to `bad_request`.
fn decode<T: serde::de::DeserializeOwned>(body: serde_json::Value) -> Result<T, AppError> {
    serde_json::from_value(body).map_err(|e| bad_request(e.to_string()))
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

// ============ POST /context ============

async fn handle_context(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ContextResponse>, AppError> {
    let request: ContextRequest = decode(body)?;
    let runtime = state.runtime();
    let response = runtime
        .engine
        .retrieve(&request)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(response))
}

// ============ POST /context/sample ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SampleRequest {
    #[serde(default = "default_source_types")]
    source_types: Vec<SourceType>,
    #[serde(default)]
    filters: Vec<ScopeFilter>,
}

fn default_source_types() -> Vec<SourceType> {
    DEFAULT_SOURCE_TYPES.to_vec()
}

async fn handle_sample(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<SamplingResult>, AppError> {
    let request: SampleRequest = decode(body)?;
    let runtime = state.runtime();
    let result = runtime
        .engine
        .sample(&request.source_types, &request.filters)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(result))
}

// ============ POST /analyze ============

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AnalyzeRequest {
    request: ContextRequest,
    task: String,
}

#[derive(Serialize)]
struct AnalyzeResponse {
    context: ContextResponse,
    output: String,
}

async fn handle_analyze(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<AnalyzeResponse>, AppError> {
    let request: AnalyzeRequest = decode(body)?;
    if request.task.trim().is_empty() {
        return Err(bad_request("task must not be empty"));
    }
    let runtime = state.runtime();
    let pool = runtime.generation.as_ref().ok_or_else(generation_disabled)?;

    let context = runtime
        .engine
        .retrieve(&request.request)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    let prompt = build_prompt(runtime.system_prompt.as_deref(), &request.task, &context);
    let output = pool.submit(&prompt).await.map_err(|e| {
        tracing::error!(error = %e, "generation failed");
        internal(format!("generation failed: {e:#}"))
    })?;

    Ok(Json(AnalyzeResponse { context, output }))
}

// ============ POST /config/reload ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReloadResponse {
    status: String,
    reloaded_at: DateTime<Utc>,
}

async fn handle_reload(State(state): State<AppState>) -> Result<Json<ReloadResponse>, AppError> {
    state.reload().map_err(|e| {
        tracing::warn!(error = %e, "config reload failed; keeping previous config");
        internal(format!("reload failed: {e:#}"))
    })?;
    Ok(Json(ReloadResponse {
        status: "reloaded".to_string(),
        reloaded_at: Utc::now(),
    }))
}
