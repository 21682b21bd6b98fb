//! Storage module for task history persistence

pub mod traits;
pub mod sqlite;

pub use traits::{TaskStorage, TaskRecord};
pub use sqlite::{SqliteStorage, TASK_IMAGE_PREFIX, task_image_file};
