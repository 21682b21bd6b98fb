//! Storage abstraction traits
//!
//! Defines the interface for task history persistence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use anyhow::Result;

/// One completed analysis request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task ID (UUID)
    pub id: String,
    /// `caption`, `face`, `ocr` or `analyze`
    pub task_type: String,
    /// Short human-readable outcome, e.g. the resolved gender
    pub result: Option<String>,
    /// Public URL of the stored upload (`/data/tasks/<id>.jpg`)
    pub image_path: Option<String>,
    /// Full response body as JSON
    pub details_json: Option<String>,
    pub duration_ms: i64,
    /// Unix seconds
    pub created_at: i64,
}

/// Task history storage
/// Implementations must be thread-safe and async-compatible
#[async_trait]
pub trait TaskStorage: Send + Sync + 'static {
    /// Save a new task record
    async fn save_task(&self, task: &TaskRecord) -> Result<()>;

    /// Most recent tasks first, optionally filtered by type
    async fn list_tasks(&self, limit: i64, task_type: Option<&str>) -> Result<Vec<TaskRecord>>;

    /// Get total task count
    async fn count_tasks(&self) -> Result<i64>;

    /// Delete a task and its stored image. Returns false when the task does not exist.
    async fn delete_task(&self, task_id: &str) -> Result<bool>;

    /// Delete every task and stored image
    async fn delete_all_tasks(&self) -> Result<u64>;
}
