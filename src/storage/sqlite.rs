//! SQLite storage implementation

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::{sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow}, Row};
use anyhow::{Result, Context};
use tracing::{info, debug, warn};

use super::traits::{TaskStorage, TaskRecord};

/// URL prefix under which stored task images are served
pub const TASK_IMAGE_PREFIX: &str = "/data/tasks/";

/// On-disk location of a stored task image
pub fn task_image_file(data_dir: &Path, task_id: &str) -> PathBuf {
    data_dir.join("tasks").join(format!("{}.jpg", task_id))
}

/// SQLite-based task storage
pub struct SqliteStorage {
    pool: SqlitePool,
    data_dir: PathBuf,
}

impl SqliteStorage {
    /// Create a new SQLite storage. Task images live under `data_dir/tasks`.
    pub async fn new(db_path: &str, data_dir: impl Into<PathBuf>) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .context("Failed to connect to SQLite database")?;

        let storage = Self {
            pool,
            data_dir: data_dir.into(),
        };
        storage.initialize().await?;

        Ok(storage)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Initialize database schema
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                result TEXT,
                image_path TEXT,
                details_json TEXT,
                duration_ms INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks(task_type)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite database initialized");
        Ok(())
    }

    /// Remove a stored image file; failures are logged, never returned
    async fn remove_file(file_path: &Path) {
        if let Err(e) = tokio::fs::remove_file(file_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove task image {:?}: {}", file_path, e);
            }
        }
    }

    async fn remove_image(&self, image_path: &str) {
        let Some(filename) = image_path.strip_prefix(TASK_IMAGE_PREFIX) else {
            return;
        };
        Self::remove_file(&self.data_dir.join("tasks").join(filename)).await;
    }
}

fn row_to_task(row: SqliteRow) -> TaskRecord {
    TaskRecord {
        id: row.get("id"),
        task_type: row.get("task_type"),
        result: row.get("result"),
        image_path: row.get("image_path"),
        details_json: row.get("details_json"),
        duration_ms: row.get("duration_ms"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl TaskStorage for SqliteStorage {
    async fn save_task(&self, task: &TaskRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, result, image_path, details_json, duration_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.task_type)
        .bind(&task.result)
        .bind(&task.image_path)
        .bind(&task.details_json)
        .bind(task.duration_ms)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;

        debug!("Saved task: {}", task.id);
        Ok(())
    }

    async fn list_tasks(&self, limit: i64, task_type: Option<&str>) -> Result<Vec<TaskRecord>> {
        let rows = if let Some(t) = task_type {
            sqlx::query(
                r#"
                SELECT id, task_type, result, image_path, details_json, duration_ms, created_at
                FROM tasks
                WHERE task_type = ?
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?
                "#,
            )
            .bind(t)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                SELECT id, task_type, result, image_path, details_json, duration_ms, created_at
                FROM tasks
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows.into_iter().map(row_to_task).collect())
    }

    async fn count_tasks(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM tasks")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("count"))
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool> {
        // Row first, so a failed delete never leaves a row pointing at a removed image
        let row = sqlx::query("DELETE FROM tasks WHERE id = ? RETURNING image_path")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(false);
        };
        if let Some(path) = row.get::<Option<String>, _>("image_path") {
            self.remove_image(&path).await;
        }

        Ok(true)
    }

    async fn delete_all_tasks(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tasks")
            .execute(&self.pool)
            .await?;

        let tasks_dir = self.data_dir.join("tasks");
        match tokio::fs::read_dir(&tasks_dir).await {
            Ok(mut entries) => loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => Self::remove_file(&entry.path()).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to list task images in {:?}: {}", tasks_dir, e);
                        break;
                    }
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to list task images in {:?}: {}", tasks_dir, e),
        }

        info!("Deleted {} tasks", result.rows_affected());
        Ok(result.rows_affected())
    }
}
