//! Fake backends and fixtures shared by service and API tests

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, RgbImage};

use crate::config::StorageConfig;
use crate::engine::{text_detector::TextBox, Gender, TextLine};
use crate::storage::{SqliteStorage, TaskRecord, TaskStorage};

use super::backends::{Captioner, FaceAnalyzer, TextReader};
use super::insight_service::Backends;
use super::types::FaceSummary;

/// `None` makes the backend fail
pub struct FakeCaptioner(pub Option<String>);
pub struct FakeFaces(pub Option<Vec<FaceSummary>>);
pub struct FakeText(pub Option<Vec<String>>);

#[async_trait]
impl Captioner for FakeCaptioner {
    async fn caption(&self, _image_data: &[u8]) -> Result<String> {
        self.0.clone().ok_or_else(|| anyhow!("caption backend unavailable"))
    }
}

#[async_trait]
impl FaceAnalyzer for FakeFaces {
    async fn analyze_faces(&self, _image: Arc<DynamicImage>) -> Result<Vec<FaceSummary>> {
        self.0.clone().ok_or_else(|| anyhow!("face backend unavailable"))
    }

    fn loaded_models(&self) -> Vec<(String, bool)> {
        vec![("fake_faces".to_string(), true)]
    }
}

#[async_trait]
impl TextReader for FakeText {
    async fn read_text(&self, _image: Arc<DynamicImage>) -> Result<Vec<TextLine>> {
        let lines = self.0.clone().ok_or_else(|| anyhow!("ocr backend unavailable"))?;
        Ok(lines
            .into_iter()
            .enumerate()
            .map(|(i, text)| TextLine {
                text,
                confidence: 0.9,
                bbox: TextBox {
                    x1: 0.0,
                    y1: i as f32 * 20.0,
                    x2: 100.0,
                    y2: i as f32 * 20.0 + 15.0,
                    score: 0.8,
                },
            })
            .collect())
    }

    fn loaded_models(&self) -> Vec<(String, bool)> {
        vec![("fake_text".to_string(), false)]
    }
}

/// Storage whose every call fails
pub struct FailingStorage;

#[async_trait]
impl TaskStorage for FailingStorage {
    async fn save_task(&self, _task: &TaskRecord) -> Result<()> {
        Err(anyhow!("database is locked"))
    }

    async fn list_tasks(&self, _limit: i64, _task_type: Option<&str>) -> Result<Vec<TaskRecord>> {
        Err(anyhow!("database is locked"))
    }

    async fn count_tasks(&self) -> Result<i64> {
        Err(anyhow!("database is locked"))
    }

    async fn delete_task(&self, _task_id: &str) -> Result<bool> {
        Err(anyhow!("database is locked"))
    }

    async fn delete_all_tasks(&self) -> Result<u64> {
        Err(anyhow!("database is locked"))
    }
}

pub fn backends(caption: Option<&str>, faces: Option<Vec<FaceSummary>>, lines: Option<Vec<&str>>) -> Backends {
    Backends {
        captioner: Arc::new(FakeCaptioner(caption.map(str::to_string))),
        faces: Arc::new(FakeFaces(faces)),
        text: Arc::new(FakeText(
            lines.map(|l| l.into_iter().map(str::to_string).collect()),
        )),
    }
}

pub fn face(x1: f32, y1: f32, x2: f32, y2: f32, gender: Gender, age: i32) -> FaceSummary {
    FaceSummary {
        x1,
        y1,
        x2,
        y2,
        confidence: 0.9,
        gender,
        gender_confidence: 0.95,
        age,
    }
}

/// A black PNG
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::new(width, height))
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

pub fn storage_config(dir: &Path) -> StorageConfig {
    StorageConfig {
        sqlite_path: dir.join("insight.db"),
        data_dir: dir.join("data"),
        save_images: false,
    }
}

pub async fn test_storage(dir: &Path) -> Arc<SqliteStorage> {
    let config = storage_config(dir);
    let storage = SqliteStorage::new(config.sqlite_path.to_str().unwrap(), config.data_dir)
        .await
        .unwrap();
    Arc::new(storage)
}
