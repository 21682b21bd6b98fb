//! REST API request/response data transfer objects

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::storage::TaskRecord;

/// Root banner
#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub message: String,
}

/// Query parameters for listing tasks
#[derive(Debug, Deserialize)]
pub struct TasksQuery {
    pub limit: Option<i64>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
}

/// Task history entry
#[derive(Debug, Serialize)]
pub struct TaskRecordDto {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub result: Option<String>,
    pub image_path: Option<String>,
    pub details: Option<serde_json::Value>,
    pub duration_ms: i64,
    pub created_at: i64,
}

impl From<TaskRecord> for TaskRecordDto {
    fn from(t: TaskRecord) -> Self {
        Self {
            details: t
                .details_json
                .as_deref()
                .and_then(|json| serde_json::from_str(json).ok()),
            id: t.id,
            task_type: t.task_type,
            result: t.result,
            image_path: t.image_path,
            duration_ms: t.duration_ms,
            created_at: t.created_at,
        }
    }
}

/// Delete response
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteAllResponse {
    pub success: bool,
    pub message: String,
    pub count: u64,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub models_loaded: HashMap<String, bool>,
}

/// Metrics response
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub total_tasks: i64,
    pub models_loaded: HashMap<String, bool>,
    pub uptime_seconds: u64,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            code: code.to_string(),
        }
    }
}
