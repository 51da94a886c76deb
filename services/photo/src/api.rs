use crate::catalog::{CatalogError, ImageCatalog, ManualUpload};
use crate::config::ApiConfig;
use crate::dealers::{Dealer, DealerDirectory};
use crate::record_store::{DealerSnapshot, ProcessedImageRecord, Provenance, RecordStore};
use crate::upload::{validate_image, validate_png, ValidationError};
use crate::workflow::{ProcessingMode, Workflow, WorkflowError, WorkflowRegistry, WorkflowSnapshot};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub workflows: Arc<WorkflowRegistry>,
    pub dealers: Arc<DealerDirectory>,
    pub catalog: Arc<ImageCatalog>,
    pub records: Arc<dyn RecordStore>,
    pub max_image_bytes: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

impl From<WorkflowError> for ErrorResponse {
    fn from(e: WorkflowError) -> Self {
        let code = match &e {
            WorkflowError::Validation(_) => "VALIDATION_ERROR",
            WorkflowError::InvalidTransition { .. } => "INVALID_TRANSITION",
        };
        Self {
            error: e.to_string(),
            code: code.to_string(),
        }
    }
}

fn workflow_error(e: WorkflowError) -> ApiError {
    let status = match e {
        WorkflowError::Validation(_) => StatusCode::BAD_REQUEST,
        WorkflowError::InvalidTransition { .. } => StatusCode::CONFLICT,
    };
    (status, Json(e.into()))
}

fn validation_error(e: ValidationError) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, e.to_string(), "INVALID_IMAGE")
}

fn catalog_error(e: CatalogError) -> ApiError {
    match e {
        CatalogError::MissingKey => api_error(StatusCode::BAD_REQUEST, e.to_string(), "VALIDATION_ERROR"),
        CatalogError::Storage(e) => {
            error!(error = %e, "Object storage request failed");
            api_error(StatusCode::BAD_GATEWAY, "Failed to store image", "STORAGE_ERROR")
        }
        CatalogError::Records(e) => {
            error!(error = %e, "Record store request failed");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to access records",
                "QUERY_ERROR",
            )
        }
    }
}

/// Record with provenance flags
#[derive(Debug, Serialize)]
pub struct RecordResponse {
    #[serde(flatten)]
    pub record: ProcessedImageRecord,
    pub is_manual_upload: bool,
    pub is_local_processed: bool,
    pub is_provider_processed: bool,
}

impl From<ProcessedImageRecord> for RecordResponse {
    fn from(record: ProcessedImageRecord) -> Self {
        Self {
            is_manual_upload: record.provenance == Provenance::Manual,
            is_local_processed: record.provenance == Provenance::LocalModel,
            is_provider_processed: record.provenance == Provenance::ExternalProvider,
            record,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecordListResponse {
    pub records: Vec<RecordResponse>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct RecordListQuery {
    pub nic: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub nic: String,
}

/// Existing-image check result
#[derive(Debug, Serialize)]
pub struct LatestResponse {
    pub exists: bool,
    pub record: Option<RecordResponse>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
    pub storage_deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub nic: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProcessRequest {
    #[serde(default)]
    pub mode: ProcessingMode,
    pub background: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    // Multipart framing on top of the largest accepted image.
    let body_limit = state.max_image_bytes + 64 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/dealers/:nic", get(get_dealer))
        .route("/api/v1/workflows", post(create_workflow))
        .route(
            "/api/v1/workflows/:id",
            get(get_workflow).delete(delete_workflow),
        )
        .route("/api/v1/workflows/:id/events", get(workflow_events))
        .route("/api/v1/workflows/:id/verify", post(verify))
        .route("/api/v1/workflows/:id/image", post(attach_image))
        .route("/api/v1/workflows/:id/process", post(process))
        .route("/api/v1/workflows/:id/cancel", post(cancel))
        .route("/api/v1/workflows/:id/save", post(save))
        .route("/api/v1/workflows/:id/reset", post(reset))
        .route("/api/v1/records", get(list_records))
        .route("/api/v1/records/latest", get(latest_record))
        .route("/api/v1/records/manual", post(manual_upload))
        .route(
            "/api/v1/records/:id",
            get(get_record).delete(delete_record),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "dealer-photo-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.records.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state))]
async fn get_dealer(
    State(state): State<AppState>,
    Path(nic): Path<String>,
) -> Result<Json<Dealer>, ApiError> {
    match state.dealers.lookup(&nic).await {
        Ok(Some(dealer)) => Ok(Json(dealer)),
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            "dealer not available",
            "DEALER_NOT_FOUND",
        )),
        Err(e) => {
            error!(error = %e, "Dealer lookup failed");
            Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "dealer lookup unavailable",
                "LOOKUP_UNAVAILABLE",
            ))
        }
    }
}

fn find_workflow(state: &AppState, id: Uuid) -> Result<Arc<Workflow>, ApiError> {
    state
        .workflows
        .get(id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Workflow not found", "NOT_FOUND"))
}

async fn create_workflow(State(state): State<AppState>) -> impl IntoResponse {
    let workflow = state.workflows.create();
    (StatusCode::CREATED, Json(workflow.snapshot()))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowSnapshot>, ApiError> {
    Ok(Json(find_workflow(&state, id)?.snapshot()))
}

async fn delete_workflow(State(state): State<AppState>, Path(id): Path<Uuid>) -> StatusCode {
    if state.workflows.remove(id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Server-sent snapshots, starting with the current one
async fn workflow_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let workflow = find_workflow(&state, id)?;
    let stream = WatchStream::new(workflow.subscribe()).map(|snapshot| {
        Event::default()
            .event(snapshot.state.name())
            .json_data(&snapshot)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[instrument(skip(state, request), fields(nic = %request.nic))]
async fn verify(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<WorkflowSnapshot>, ApiError> {
    let workflow = find_workflow(&state, id)?;
    workflow
        .verify(&request.nic)
        .await
        .map(Json)
        .map_err(workflow_error)
}

/// A file field read from a multipart body
struct FilePart {
    data: Bytes,
    content_type: String,
}

async fn read_multipart(
    mut multipart: Multipart,
) -> Result<(Option<FilePart>, std::collections::HashMap<String, String>), ApiError> {
    let mut file = None;
    let mut fields = std::collections::HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text(), "INVALID_MULTIPART"))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let content_type = field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text(), "INVALID_MULTIPART"))?;
            file = Some(FilePart { data, content_type });
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.body_text(), "INVALID_MULTIPART"))?;
            fields.insert(name, value);
        }
    }

    Ok((file, fields))
}

#[instrument(skip(state, multipart))]
async fn attach_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> Result<Json<WorkflowSnapshot>, ApiError> {
    let workflow = find_workflow(&state, id)?;
    let (file, _) = read_multipart(multipart).await?;
    let file = file.ok_or_else(|| validation_error(ValidationError::Empty))?;

    validate_image(&file.data, &file.content_type, state.max_image_bytes).map_err(validation_error)?;

    workflow
        .attach_image(file.data, &file.content_type)
        .await
        .map(Json)
        .map_err(workflow_error)
}

#[instrument(skip(state, request))]
async fn process(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    request: Option<Json<ProcessRequest>>,
) -> Result<Json<WorkflowSnapshot>, ApiError> {
    let workflow = find_workflow(&state, id)?;
    let request = request.map(|Json(r)| r).unwrap_or_default();

    workflow
        .start_processing(request.mode, request.background)
        .await
        .map(Json)
        .map_err(workflow_error)
}

async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowSnapshot>, ApiError> {
    Ok(Json(find_workflow(&state, id)?.cancel()))
}

#[instrument(skip(state))]
async fn save(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowSnapshot>, ApiError> {
    let workflow = find_workflow(&state, id)?;
    workflow.confirm_save().await.map(Json).map_err(workflow_error)
}

async fn reset(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowSnapshot>, ApiError> {
    Ok(Json(find_workflow(&state, id)?.reset()))
}

#[instrument(skip(state))]
async fn list_records(
    State(state): State<AppState>,
    Query(params): Query<RecordListQuery>,
) -> Result<Json<RecordListResponse>, ApiError> {
    let records = state
        .catalog
        .history(params.nic.as_deref(), params.limit)
        .await
        .map_err(catalog_error)?;

    Ok(Json(RecordListResponse {
        count: records.len(),
        records: records.into_iter().map(Into::into).collect(),
    }))
}

#[instrument(skip(state))]
async fn latest_record(
    State(state): State<AppState>,
    Query(params): Query<LatestQuery>,
) -> Result<Json<LatestResponse>, ApiError> {
    let record = state
        .catalog
        .latest(&params.nic)
        .await
        .map_err(catalog_error)?;

    Ok(Json(LatestResponse {
        exists: record.is_some(),
        record: record.map(Into::into),
    }))
}

#[instrument(skip(state))]
async fn get_record(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RecordResponse>, ApiError> {
    match state.catalog.get(id).await.map_err(catalog_error)? {
        Some(record) => Ok(Json(record.into())),
        None => Err(api_error(StatusCode::NOT_FOUND, "Record not found", "NOT_FOUND")),
    }
}

#[instrument(skip(state))]
async fn delete_record(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeleteResponse>, ApiError> {
    match state.catalog.delete(id).await.map_err(catalog_error)? {
        Some(deletion) => Ok(Json(DeleteResponse {
            deleted: true,
            storage_deleted: deletion.storage_deleted,
        })),
        None => Err(api_error(StatusCode::NOT_FOUND, "Record not found", "NOT_FOUND")),
    }
}

#[instrument(skip(state, multipart))]
async fn manual_upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<RecordResponse>), ApiError> {
    let (file, mut fields) = read_multipart(multipart).await?;
    let file = file.ok_or_else(|| validation_error(ValidationError::Empty))?;

    validate_png(&file.data, &file.content_type, state.max_image_bytes).map_err(validation_error)?;

    let mut text = |name: &str| fields.remove(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    let upload = ManualUpload {
        business_key: text("nic").unwrap_or_default(),
        image: file.data,
        content_type: file.content_type,
        dealer: DealerSnapshot {
            dealer_name: text("dealer_name"),
            area: text("area"),
            classification: text("classification"),
        },
    };

    let record = state
        .catalog
        .manual_upload(upload)
        .await
        .map_err(catalog_error)?;

    Ok((StatusCode::CREATED, Json(record.into())))
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting dealer photo API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
