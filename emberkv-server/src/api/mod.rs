//! HTTP API endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use emberkv_core::{BackupDescriptor, EmberError, MasterEngine, RejectRules, Tablet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state
pub type AppState = Arc<MasterEngine>;

/// Create the API router
pub fn create_router(engine: Arc<MasterEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))
        // Client operations
        .route("/v1/create", post(create))
        .route("/v1/read", post(read))
        .route("/v1/write", post(write))
        .route("/v1/remove", post(remove))
        // Cluster management
        .route("/v1/recover", post(recover))
        .route("/v1/set-tablets", post(set_tablets))
        // Stats
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .fallback(unimplemented)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub table_id: u64,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub id: u64,
    pub version: u64,
}

#[derive(Debug, Deserialize)]
pub struct ReadRequest {
    pub table_id: u64,
    pub object_id: u64,
    #[serde(default)]
    pub reject_rules: RejectRules,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub value: String,
    pub version: u64,
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub table_id: u64,
    pub object_id: u64,
    pub value: String,
    #[serde(default)]
    pub reject_rules: RejectRules,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub version: u64,
}

#[derive(Debug, Deserialize)]
pub struct RemoveRequest {
    pub table_id: u64,
    pub object_id: u64,
    #[serde(default)]
    pub reject_rules: RejectRules,
}

#[derive(Debug, Serialize)]
pub struct RemoveResponse {
    /// Version of the removed object, absent when nothing existed
    pub version: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RecoverRequest {
    pub master_id: u64,
    pub tablets: Vec<Tablet>,
    pub backups: Vec<BackupDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct SetTabletsRequest {
    pub tablets: Vec<Tablet>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub server_id: u64,
    pub bytes_written: u64,
    pub bytes_appended: u64,
    pub segment_count: usize,
    pub object_count: usize,
    pub tablet_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<u64>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn into_api_error(error: EmberError) -> ApiError {
    let status = match &error {
        EmberError::TableDoesntExist | EmberError::ObjectDoesntExist => StatusCode::NOT_FOUND,
        EmberError::ObjectExists { .. } => StatusCode::CONFLICT,
        EmberError::WrongVersion { .. } => StatusCode::PRECONDITION_FAILED,
        EmberError::Unimplemented(_) => StatusCode::NOT_IMPLEMENTED,
        EmberError::Transport(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let current_version = match &error {
        EmberError::ObjectExists { current } | EmberError::WrongVersion { current } => {
            Some(*current)
        }
        _ => None,
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: error.code(),
            current_version,
        }),
    )
}

/// Run a blocking engine call off the async runtime.
async fn blocking<T: Send + 'static>(
    engine: &AppState,
    f: impl FnOnce(Arc<MasterEngine>) -> Result<T, EmberError> + Send + 'static,
) -> Result<T, ApiError> {
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || f(engine))
        .await
        .map_err(|e| into_api_error(EmberError::Corruption(format!("handler panicked: {}", e))))?
        .map_err(into_api_error)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: emberkv_core::VERSION.to_string(),
    })
}

async fn ping(State(engine): State<AppState>) -> Json<StatsResponse> {
    stats_response(engine.ping())
}

async fn create(
    State(engine): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<CreateResponse>, ApiError> {
    let (id, version) = blocking(&engine, move |engine| {
        engine.create(req.table_id, Bytes::from(req.value))
    })
    .await?;
    Ok(Json(CreateResponse { id, version }))
}

async fn read(
    State(engine): State<AppState>,
    Json(req): Json<ReadRequest>,
) -> Result<Json<ReadResponse>, ApiError> {
    let (value, version) = engine
        .read(req.table_id, req.object_id, &req.reject_rules)
        .map_err(into_api_error)?;
    Ok(Json(ReadResponse {
        value: String::from_utf8_lossy(&value).into_owned(),
        version,
    }))
}

async fn write(
    State(engine): State<AppState>,
    Json(req): Json<WriteRequest>,
) -> Result<Json<WriteResponse>, ApiError> {
    let version = blocking(&engine, move |engine| {
        engine.write(
            req.table_id,
            req.object_id,
            &req.reject_rules,
            Bytes::from(req.value),
        )
    })
    .await?;
    Ok(Json(WriteResponse { version }))
}

async fn remove(
    State(engine): State<AppState>,
    Json(req): Json<RemoveRequest>,
) -> Result<Json<RemoveResponse>, ApiError> {
    let version = blocking(&engine, move |engine| {
        engine.remove(req.table_id, req.object_id, &req.reject_rules)
    })
    .await?;
    Ok(Json(RemoveResponse { version }))
}

async fn recover(
    State(engine): State<AppState>,
    Json(req): Json<RecoverRequest>,
) -> Result<StatusCode, ApiError> {
    blocking(&engine, move |engine| {
        engine.recover(req.master_id, req.tablets, req.backups)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_tablets(
    State(engine): State<AppState>,
    Json(req): Json<SetTabletsRequest>,
) -> StatusCode {
    engine.set_tablets(req.tablets);
    StatusCode::NO_CONTENT
}

async fn stats(State(engine): State<AppState>) -> Json<StatsResponse> {
    stats_response(engine.stats())
}

fn stats_response(stats: emberkv_core::EngineStats) -> Json<StatsResponse> {
    Json(StatsResponse {
        server_id: stats.server_id,
        bytes_written: stats.bytes_written,
        bytes_appended: stats.bytes_appended,
        segment_count: stats.segment_count,
        object_count: stats.object_count,
        tablet_count: stats.tablet_count,
    })
}

async fn metrics(State(engine): State<AppState>) -> String {
    let stats = engine.stats();

    // Prometheus format
    let mut output = String::new();
    output.push_str("# HELP emberkv_bytes_written_total Object bytes accepted from clients\n");
    output.push_str("# TYPE emberkv_bytes_written_total counter\n");
    output.push_str(&format!(
        "emberkv_bytes_written_total {}\n",
        stats.bytes_written
    ));

    output.push_str("# HELP emberkv_log_bytes_appended_total Bytes appended to the log\n");
    output.push_str("# TYPE emberkv_log_bytes_appended_total counter\n");
    output.push_str(&format!(
        "emberkv_log_bytes_appended_total {}\n",
        stats.bytes_appended
    ));

    output.push_str("# HELP emberkv_log_segments Segments not yet reclaimed\n");
    output.push_str("# TYPE emberkv_log_segments gauge\n");
    output.push_str(&format!("emberkv_log_segments {}\n", stats.segment_count));

    output.push_str("# HELP emberkv_objects Objects in the index\n");
    output.push_str("# TYPE emberkv_objects gauge\n");
    output.push_str(&format!("emberkv_objects {}\n", stats.object_count));

    output.push_str("# HELP emberkv_tablets Tablets served\n");
    output.push_str("# TYPE emberkv_tablets gauge\n");
    output.push_str(&format!("emberkv_tablets {}\n", stats.tablet_count));

    output
}

async fn unimplemented() -> ApiError {
    into_api_error(EmberError::Unimplemented("unknown request".into()))
}
