//! Axum REST API handlers

use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    routing::{get, post, delete},
    extract::{Path, State, Multipart, Query, DefaultBodyLimit},
    http::StatusCode,
    response::Json,
};
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::TraceLayer;
use tower_http::services::ServeDir;
use tracing::{error, warn};

use crate::service::{
    AnalyzeResult, CaptionResult, FaceGenderResult, InsightService, OcrResult, ServiceError,
};
use crate::storage::TaskStorage;

use super::dto::*;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: &str, code: &str) -> ApiError {
    (status, Json(ErrorResponse::new(message, code)))
}

/// Application state shared across handlers
pub struct AppState<S: TaskStorage> {
    pub service: Arc<InsightService<S>>,
    pub start_time: Instant,
}

impl<S: TaskStorage> AppState<S> {
    pub fn new(service: Arc<InsightService<S>>) -> Self {
        Self {
            service,
            start_time: Instant::now(),
        }
    }
}

/// Create the REST API router. Stored task images are served from `data_dir` under `/data`.
pub fn create_rest_router<S: TaskStorage>(
    state: Arc<AppState<S>>,
    body_limit_mb: usize,
    data_dir: &FsPath,
) -> Router {
    Router::new()
        .route("/", get(root_handler))
        // Inference
        .route("/predict", post(caption_handler::<S>))
        .route("/predict/face", post(face_handler::<S>))
        .route("/predict/ocr", post(ocr_handler::<S>))
        .route("/api/v1/analyze", post(analyze_handler::<S>))
        // Task history
        .route("/api/v1/tasks", get(list_tasks_handler::<S>).delete(delete_all_tasks_handler::<S>))
        .route("/api/v1/tasks/:task_id", delete(delete_task_handler::<S>))
        // System endpoints
        .route("/health", get(health_handler::<S>))
        .route("/api/v1/health", get(health_handler::<S>))
        .route("/metrics", get(metrics_handler::<S>))
        .nest_service("/data", ServeDir::new(data_dir))
        // Middleware
        .layer(DefaultBodyLimit::max(body_limit_mb * 1024 * 1024))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Pull the uploaded image out of a `file` or `image` field
async fn read_image(mut multipart: Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        api_error(StatusCode::BAD_REQUEST, &e.to_string(), "MULTIPART_ERROR")
    })? {
        let name = field.name().unwrap_or("").to_string();

        if name == "file" || name == "image" {
            let data = field.bytes().await.map_err(|e| {
                api_error(StatusCode::BAD_REQUEST, &e.to_string(), "READ_ERROR")
            })?;
            return Ok(data.to_vec());
        }
    }

    Err(api_error(StatusCode::BAD_REQUEST, "Missing file field", "MISSING_IMAGE"))
}

/// Invalid uploads are the client's fault; anything else is a backend failure reported under `code`
fn service_error(e: ServiceError, code: &str) -> ApiError {
    match e {
        ServiceError::InvalidImage(_) => {
            warn!("Rejected upload: {}", e);
            api_error(StatusCode::BAD_REQUEST, &e.to_string(), "INVALID_IMAGE")
        }
        ServiceError::Inference(ref inner) => {
            error!("{}: {:#}", code, inner);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, &format!("{:#}", inner), code)
        }
    }
}

async fn root_handler() -> Json<RootResponse> {
    Json(RootResponse {
        message: "API is running. Use POST /predict with an image.".to_string(),
    })
}

/// Caption an image and guess a gender from the caption
async fn caption_handler<S: TaskStorage>(
    State(state): State<Arc<AppState<S>>>,
    multipart: Multipart,
) -> Result<Json<CaptionResult>, ApiError> {
    let image_data = read_image(multipart).await?;
    let result = state
        .service
        .caption(&image_data)
        .await
        .map_err(|e| service_error(e, "CAPTION_FAILED"))?;
    Ok(Json(result))
}

async fn face_handler<S: TaskStorage>(
    State(state): State<Arc<AppState<S>>>,
    multipart: Multipart,
) -> Result<Json<FaceGenderResult>, ApiError> {
    let image_data = read_image(multipart).await?;
    let result = state
        .service
        .face_gender(&image_data)
        .await
        .map_err(|e| service_error(e, "FACE_ANALYSIS_FAILED"))?;
    Ok(Json(result))
}

async fn ocr_handler<S: TaskStorage>(
    State(state): State<Arc<AppState<S>>>,
    multipart: Multipart,
) -> Result<Json<OcrResult>, ApiError> {
    let image_data = read_image(multipart).await?;
    let result = state
        .service
        .ocr(&image_data)
        .await
        .map_err(|e| service_error(e, "OCR_FAILED"))?;
    Ok(Json(result))
}

/// Caption, face and OCR in one call
async fn analyze_handler<S: TaskStorage>(
    State(state): State<Arc<AppState<S>>>,
    multipart: Multipart,
) -> Result<Json<AnalyzeResult>, ApiError> {
    let image_data = read_image(multipart).await?;
    let result = state
        .service
        .analyze(&image_data)
        .await
        .map_err(|e| service_error(e, "ANALYSIS_FAILED"))?;
    Ok(Json(result))
}

/// List tasks handler
async fn list_tasks_handler<S: TaskStorage>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<TasksQuery>,
) -> Result<Json<Vec<TaskRecordDto>>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let task_type = query.task_type.as_deref().filter(|t| !t.is_empty() && *t != "all");

    let tasks = state.service.storage().list_tasks(limit, task_type).await.map_err(|e| {
        error!("Failed to list tasks: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string(), "LIST_FAILED")
    })?;

    Ok(Json(tasks.into_iter().map(TaskRecordDto::from).collect()))
}

/// Delete a single task
async fn delete_task_handler<S: TaskStorage>(
    State(state): State<Arc<AppState<S>>>,
    Path(task_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = state.service.storage().delete_task(&task_id).await.map_err(|e| {
        error!("Failed to delete task: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string(), "DELETE_FAILED")
    })?;

    if deleted {
        Ok(Json(DeleteResponse {
            success: true,
            message: "Task deleted successfully".to_string(),
        }))
    } else {
        Err(api_error(StatusCode::NOT_FOUND, "Task not found", "NOT_FOUND"))
    }
}

/// Delete all tasks
async fn delete_all_tasks_handler<S: TaskStorage>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<DeleteAllResponse>, ApiError> {
    let count = state.service.storage().delete_all_tasks().await.map_err(|e| {
        error!("Failed to delete all tasks: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string(), "DELETE_FAILED")
    })?;

    Ok(Json(DeleteAllResponse {
        success: true,
        message: format!("Deleted {} tasks", count),
        count,
    }))
}

/// Health check
async fn health_handler<S: TaskStorage>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    let health = state.service.health();

    Json(HealthResponse {
        healthy: health.healthy,
        version: health.version,
        models_loaded: health.models_loaded,
    })
}

/// Metrics
async fn metrics_handler<S: TaskStorage>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<MetricsResponse> {
    let health = state.service.health();
    let uptime = state.start_time.elapsed().as_secs();

    let total_tasks = match state.service.storage().count_tasks().await {
        Ok(count) => count,
        Err(e) => {
            warn!("Failed to count tasks: {}", e);
            0
        }
    };

    Json(MetricsResponse {
        total_tasks,
        models_loaded: health.models_loaded,
        uptime_seconds: uptime,
    })
}
