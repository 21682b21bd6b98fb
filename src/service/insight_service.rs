//! Insight Service - Core business logic
//!
//! Validates uploads, dispatches them to the model backends, applies the
//! keyword heuristics and records each request in the task history.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::engine::{preprocess::decode_image, Gender, TextLine};
use crate::storage::{task_image_file, TaskRecord, TaskStorage, TASK_IMAGE_PREFIX};

use super::backends::{Captioner, FaceAnalyzer, TextReader};
use super::keywords::{gender_from_caption, sex_from_text};
use super::types::*;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Empty or undecodable upload
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    /// A model backend failed
    #[error(transparent)]
    Inference(#[from] anyhow::Error),
}

/// The three model backends
#[derive(Clone)]
pub struct Backends {
    pub captioner: Arc<dyn Captioner>,
    pub faces: Arc<dyn FaceAnalyzer>,
    pub text: Arc<dyn TextReader>,
}

pub struct InsightService<S: TaskStorage> {
    backends: Backends,
    storage: Arc<S>,
    storage_config: StorageConfig,
}

async fn timed<T>(future: impl Future<Output = T>) -> (T, u64) {
    let start = Instant::now();
    let output = future.await;
    (output, start.elapsed().as_millis() as u64)
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn caption_result(caption: String, inference_time_ms: u64) -> CaptionResult {
    let gender = gender_from_caption(&caption);
    CaptionResult {
        caption,
        gender,
        inference_time_ms,
    }
}

/// The dominant face is the one with the largest box
fn face_result(faces: Vec<FaceSummary>, inference_time_ms: u64) -> FaceGenderResult {
    let dominant = faces.iter().max_by(|a, b| a.area().total_cmp(&b.area()));

    FaceGenderResult {
        gender: dominant.map(|f| f.gender),
        confidence: dominant.map_or(0.0, |f| f.gender_confidence),
        age: dominant.map(|f| f.age),
        faces,
        inference_time_ms,
    }
}

fn ocr_result(lines: Vec<TextLine>, inference_time_ms: u64) -> OcrResult {
    let text = lines
        .iter()
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let sex = sex_from_text(&text);

    OcrResult {
        text,
        lines: lines.into_iter().map(OcrLine::from).collect(),
        sex,
        inference_time_ms,
    }
}

/// OCR sex field first, then the face model, then the caption keywords
pub fn resolve_gender(ocr: &OcrResult, face: &FaceGenderResult, caption: &CaptionResult) -> Option<Gender> {
    ocr.sex.or(face.gender).or(caption.gender)
}

impl<S: TaskStorage> InsightService<S> {
    pub fn new(backends: Backends, storage: Arc<S>, storage_config: StorageConfig) -> Self {
        Self {
            backends,
            storage,
            storage_config,
        }
    }

    /// Get a reference to the storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    fn decode(&self, image_data: &[u8]) -> Result<Arc<DynamicImage>, ServiceError> {
        if image_data.is_empty() {
            return Err(ServiceError::InvalidImage("empty upload".to_string()));
        }
        decode_image(image_data)
            .map(Arc::new)
            .map_err(|e| ServiceError::InvalidImage(e.to_string()))
    }

    /// Caption the image and guess a gender from the caption
    pub async fn caption(&self, image_data: &[u8]) -> Result<CaptionResult, ServiceError> {
        let start = Instant::now();
        let image = self.decode(image_data)?;

        let caption = self.backends.captioner.caption(image_data).await?;
        let result = caption_result(caption, elapsed_ms(start));

        info!("Caption {:?} -> {}", result.caption, gender_or_unknown::label(result.gender));
        self.record("caption", result.gender, &result, result.inference_time_ms, image)
            .await;
        Ok(result)
    }

    /// Gender and age of the dominant face
    pub async fn face_gender(&self, image_data: &[u8]) -> Result<FaceGenderResult, ServiceError> {
        let start = Instant::now();
        let image = self.decode(image_data)?;

        let faces = self.backends.faces.analyze_faces(image.clone()).await?;
        let result = face_result(faces, elapsed_ms(start));

        info!(
            "Analyzed {} faces -> {}",
            result.faces.len(),
            gender_or_unknown::label(result.gender)
        );
        self.record("face", result.gender, &result, result.inference_time_ms, image)
            .await;
        Ok(result)
    }

    /// Read the text and parse its sex field
    pub async fn ocr(&self, image_data: &[u8]) -> Result<OcrResult, ServiceError> {
        let start = Instant::now();
        let image = self.decode(image_data)?;

        let lines = self.backends.text.read_text(image.clone()).await?;
        let result = ocr_result(lines, elapsed_ms(start));

        info!(
            "Read {} text lines -> sex {}",
            result.lines.len(),
            gender_or_unknown::label(result.sex)
        );
        self.record("ocr", result.sex, &result, result.inference_time_ms, image)
            .await;
        Ok(result)
    }

    /// Run all backends concurrently and resolve one gender
    pub async fn analyze(&self, image_data: &[u8]) -> Result<AnalyzeResult, ServiceError> {
        let start = Instant::now();
        let image = self.decode(image_data)?;

        let ((caption, caption_ms), (faces, face_ms), (lines, ocr_ms)) = tokio::join!(
            timed(self.backends.captioner.caption(image_data)),
            timed(self.backends.faces.analyze_faces(image.clone())),
            timed(self.backends.text.read_text(image.clone())),
        );

        let caption = caption_result(caption?, caption_ms);
        let face = face_result(faces?, face_ms);
        let ocr = ocr_result(lines?, ocr_ms);
        let gender = resolve_gender(&ocr, &face, &caption);

        let result = AnalyzeResult {
            caption,
            face,
            ocr,
            gender,
            inference_time_ms: elapsed_ms(start),
        };

        info!("Analyze -> {}", gender_or_unknown::label(result.gender));
        self.record("analyze", result.gender, &result, result.inference_time_ms, image)
            .await;
        Ok(result)
    }

    /// Health of the service and its models
    pub fn health(&self) -> HealthResult {
        let models_loaded: HashMap<String, bool> = self
            .backends
            .captioner
            .loaded_models()
            .into_iter()
            .chain(self.backends.faces.loaded_models())
            .chain(self.backends.text.loaded_models())
            .collect();

        HealthResult {
            healthy: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
            models_loaded,
        }
    }

    /// Save the request to the task history. Failures are logged only.
    async fn record<T: Serialize>(
        &self,
        task_type: &str,
        gender: Option<Gender>,
        details: &T,
        duration_ms: u64,
        image: Arc<DynamicImage>,
    ) {
        let id = Uuid::new_v4().to_string();

        let image_path = if self.storage_config.save_images {
            match self.save_image(&id, image).await {
                Ok(()) => Some(format!("{}{}.jpg", TASK_IMAGE_PREFIX, id)),
                Err(e) => {
                    warn!("Failed to store image for task {}: {:#}", id, e);
                    None
                }
            }
        } else {
            None
        };

        let task = TaskRecord {
            id,
            task_type: task_type.to_string(),
            result: Some(gender_or_unknown::label(gender).to_string()),
            image_path,
            details_json: serde_json::to_string(details).ok(),
            duration_ms: duration_ms as i64,
            created_at: chrono::Utc::now().timestamp(),
        };

        if let Err(e) = self.storage.save_task(&task).await {
            warn!("Failed to record {} task {}: {:#}", task_type, task.id, e);
        }
    }

    async fn save_image(&self, task_id: &str, image: Arc<DynamicImage>) -> anyhow::Result<()> {
        let path = task_image_file(&self.storage_config.data_dir, task_id);
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            DynamicImage::ImageRgb8(image.to_rgb8()).save_with_format(&path, ImageFormat::Jpeg)?;
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::*;
    use crate::storage::SqliteStorage;

    async fn service(dir: &std::path::Path, backends: Backends, save_images: bool) -> InsightService<SqliteStorage> {
        let storage = test_storage(dir).await;
        let mut config = storage_config(dir);
        config.save_images = save_images;
        InsightService::new(backends, storage, config)
    }

    #[tokio::test]
    async fn test_caption_keyword_gender() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), backends(Some("a woman reading a book"), Some(vec![]), Some(vec![])), false).await;

        let result = svc.caption(&png_bytes(32, 32)).await.unwrap();
        assert_eq!(result.caption, "a woman reading a book");
        assert_eq!(result.gender, Some(Gender::Female));

        let tasks = svc.storage().list_tasks(10, Some("caption")).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].result.as_deref(), Some("female"));
        assert_eq!(tasks[0].image_path, None);
    }

    #[tokio::test]
    async fn test_invalid_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), backends(Some("a man"), Some(vec![]), Some(vec![])), false).await;

        assert!(matches!(svc.caption(&[]).await, Err(ServiceError::InvalidImage(_))));
        assert!(matches!(svc.ocr(b"not an image").await, Err(ServiceError::InvalidImage(_))));
        assert_eq!(svc.storage().count_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_is_inference_error() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), backends(None, None, None), false).await;

        assert!(matches!(svc.caption(&png_bytes(8, 8)).await, Err(ServiceError::Inference(_))));
        assert!(matches!(svc.face_gender(&png_bytes(8, 8)).await, Err(ServiceError::Inference(_))));
        assert!(matches!(svc.analyze(&png_bytes(8, 8)).await, Err(ServiceError::Inference(_))));
    }

    #[tokio::test]
    async fn test_face_gender_uses_largest_face() {
        let dir = tempfile::tempdir().unwrap();
        let faces = vec![
            face(0.0, 0.0, 10.0, 10.0, Gender::Male, 30),
            face(20.0, 20.0, 80.0, 90.0, Gender::Female, 25),
        ];
        let svc = service(dir.path(), backends(Some(""), Some(faces), Some(vec![])), false).await;

        let result = svc.face_gender(&png_bytes(100, 100)).await.unwrap();
        assert_eq!(result.gender, Some(Gender::Female));
        assert_eq!(result.age, Some(25));
        assert_eq!(result.faces.len(), 2);
    }

    #[tokio::test]
    async fn test_face_gender_without_faces() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), backends(Some(""), Some(vec![]), Some(vec![])), false).await;

        let result = svc.face_gender(&png_bytes(100, 100)).await.unwrap();
        assert_eq!(result.gender, None);
        assert_eq!(result.age, None);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_ocr_joins_lines_and_parses_sex() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(
            dir.path(),
            backends(Some(""), Some(vec![]), Some(vec!["DRIVER LICENSE", "SEX: M"])),
            false,
        )
        .await;

        let result = svc.ocr(&png_bytes(64, 64)).await.unwrap();
        assert_eq!(result.text, "DRIVER LICENSE\nSEX: M");
        assert_eq!(result.sex, Some(Gender::Male));
        assert_eq!(result.lines.len(), 2);
    }

    #[tokio::test]
    async fn test_analyze_gender_priority() {
        let dir = tempfile::tempdir().unwrap();

        // OCR beats the face and the caption
        let svc = service(
            dir.path(),
            backends(
                Some("a man in a suit"),
                Some(vec![face(0.0, 0.0, 50.0, 50.0, Gender::Male, 40)]),
                Some(vec!["SEX F"]),
            ),
            false,
        )
        .await;
        let result = svc.analyze(&png_bytes(64, 64)).await.unwrap();
        assert_eq!(result.gender, Some(Gender::Female));
        assert_eq!(result.caption.gender, Some(Gender::Male));

        // face beats the caption when OCR has nothing
        let svc = service(
            dir.path(),
            backends(
                Some("a man in a suit"),
                Some(vec![face(0.0, 0.0, 50.0, 50.0, Gender::Female, 40)]),
                Some(vec!["HELLO"]),
            ),
            false,
        )
        .await;
        assert_eq!(svc.analyze(&png_bytes(64, 64)).await.unwrap().gender, Some(Gender::Female));

        // caption is the last resort
        let svc = service(dir.path(), backends(Some("a businessman"), Some(vec![]), Some(vec![])), false).await;
        assert_eq!(svc.analyze(&png_bytes(64, 64)).await.unwrap().gender, Some(Gender::Male));
    }

    #[tokio::test]
    async fn test_records_stored_image() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), backends(Some("a girl"), Some(vec![]), Some(vec![])), true).await;

        svc.caption(&png_bytes(16, 16)).await.unwrap();

        let tasks = svc.storage().list_tasks(10, None).await.unwrap();
        let task = &tasks[0];
        let url = task.image_path.clone().unwrap();
        assert_eq!(url, format!("{}{}.jpg", TASK_IMAGE_PREFIX, task.id));
        assert!(task_image_file(&dir.path().join("data"), &task.id).exists());

        let details: serde_json::Value = serde_json::from_str(task.details_json.as_deref().unwrap()).unwrap();
        assert_eq!(details["caption"], "a girl");
    }

    #[tokio::test]
    async fn test_health_lists_backend_models() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), backends(Some(""), Some(vec![]), Some(vec![])), false).await;

        let health = svc.health();
        assert!(health.healthy);
        assert_eq!(health.models_loaded.get("fake_faces"), Some(&true));
        assert_eq!(health.models_loaded.get("fake_text"), Some(&false));
    }
}
