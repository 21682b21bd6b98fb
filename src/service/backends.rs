//! Model backends behind the service
//!
//! The service only sees these traits, so the REST layer can be tested
//! with fakes and without model files.

use std::ops::RangeInclusive;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use image::DynamicImage;

use crate::config::FaceConfig;
use crate::engine::{
    AttributeAnalyzer, FaceDetector, ModelPool, ModelType, OcrEngine, RemoteCaptioner, TextLine,
    detector::FaceBox,
    preprocess::{align_face, crop_face},
};

use super::types::FaceSummary;

/// Images with both sides in this range are analyzed whole when no face is detected
pub const FACE_CROP_SIDE: RangeInclusive<u32> = 20..=600;

#[async_trait]
pub trait Captioner: Send + Sync + 'static {
    /// Caption the encoded upload
    async fn caption(&self, image_data: &[u8]) -> Result<String>;

    fn loaded_models(&self) -> Vec<(String, bool)> {
        Vec::new()
    }
}

#[async_trait]
pub trait FaceAnalyzer: Send + Sync + 'static {
    /// Gender and age for every face in the image
    async fn analyze_faces(&self, image: Arc<DynamicImage>) -> Result<Vec<FaceSummary>>;

    fn loaded_models(&self) -> Vec<(String, bool)> {
        Vec::new()
    }
}

#[async_trait]
pub trait TextReader: Send + Sync + 'static {
    /// Text lines in reading order
    async fn read_text(&self, image: Arc<DynamicImage>) -> Result<Vec<TextLine>>;

    fn loaded_models(&self) -> Vec<(String, bool)> {
        Vec::new()
    }
}

#[async_trait]
impl Captioner for RemoteCaptioner {
    async fn caption(&self, image_data: &[u8]) -> Result<String> {
        RemoteCaptioner::caption(self, image_data).await
    }

    fn loaded_models(&self) -> Vec<(String, bool)> {
        vec![(format!("caption:{}", self.model()), true)]
    }
}

fn pool_status(pool: &ModelPool, models: &[ModelType]) -> Vec<(String, bool)> {
    models
        .iter()
        .map(|&m| (m.as_str().to_string(), pool.is_loaded(m)))
        .collect()
}

/// SCRFD detection followed by gender-age estimation on aligned crops
pub struct OpenVinoFaceAnalyzer {
    pool: Arc<ModelPool>,
    detector: Arc<FaceDetector>,
    attribute: Arc<AttributeAnalyzer>,
}

impl OpenVinoFaceAnalyzer {
    pub fn new(pool: Arc<ModelPool>, config: &FaceConfig) -> Self {
        Self {
            detector: Arc::new(FaceDetector::new(
                pool.clone(),
                config.confidence_threshold,
                config.nms_threshold,
            )),
            attribute: Arc::new(AttributeAnalyzer::new(pool.clone())),
            pool,
        }
    }
}

/// Attribute-model input for a detected face: aligned on its landmarks,
/// or the plain box crop for exports without keypoints
fn face_input(image: &DynamicImage, face: &FaceBox) -> Result<DynamicImage> {
    match &face.landmarks {
        Some(landmarks) => align_face(image, landmarks),
        None => crop_face(image, (face.x1, face.y1, face.x2, face.y2)),
    }
}

fn analyze_blocking(
    detector: &FaceDetector,
    attribute: &AttributeAnalyzer,
    image: &DynamicImage,
) -> Result<Vec<FaceSummary>> {
    let faces = detector.detect(image)?;

    if faces.is_empty() {
        let (width, height) = (image.width(), image.height());
        if !(FACE_CROP_SIDE.contains(&width) && FACE_CROP_SIDE.contains(&height)) {
            return Ok(Vec::new());
        }

        tracing::debug!("No face detected, analyzing {}x{} image as a face crop", width, height);
        let attrs = attribute.analyze(image)?;
        return Ok(vec![FaceSummary {
            x1: 0.0,
            y1: 0.0,
            x2: width as f32,
            y2: height as f32,
            confidence: 0.0,
            gender: attrs.gender,
            gender_confidence: attrs.gender_confidence,
            age: attrs.age,
        }]);
    }

    faces
        .iter()
        .map(|face| {
            let input = face_input(image, face)?;
            let attrs = attribute.analyze(&input)?;
            Ok(FaceSummary {
                x1: face.x1,
                y1: face.y1,
                x2: face.x2,
                y2: face.y2,
                confidence: face.confidence,
                gender: attrs.gender,
                gender_confidence: attrs.gender_confidence,
                age: attrs.age,
            })
        })
        .collect()
}

#[async_trait]
impl FaceAnalyzer for OpenVinoFaceAnalyzer {
    async fn analyze_faces(&self, image: Arc<DynamicImage>) -> Result<Vec<FaceSummary>> {
        let detector = self.detector.clone();
        let attribute = self.attribute.clone();
        tokio::task::spawn_blocking(move || analyze_blocking(&detector, &attribute, &image)).await?
    }

    fn loaded_models(&self) -> Vec<(String, bool)> {
        pool_status(&self.pool, &[ModelType::FaceDetector, ModelType::GenderAge])
    }
}

/// PaddleOCR detection and recognition
pub struct OpenVinoTextReader {
    pool: Arc<ModelPool>,
    engine: Arc<OcrEngine>,
}

impl OpenVinoTextReader {
    pub fn new(pool: Arc<ModelPool>, engine: OcrEngine) -> Self {
        Self {
            pool,
            engine: Arc::new(engine),
        }
    }
}

#[async_trait]
impl TextReader for OpenVinoTextReader {
    async fn read_text(&self, image: Arc<DynamicImage>) -> Result<Vec<TextLine>> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.read(&image)).await?
    }

    fn loaded_models(&self) -> Vec<(String, bool)> {
        pool_status(&self.pool, &[ModelType::TextDetector, ModelType::TextRecognizer])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InferenceConfig, ModelsConfig};

    fn empty_pool() -> Arc<ModelPool> {
        let dir = tempfile::tempdir().unwrap();
        let missing = |name: &str| dir.path().join(name);
        let models = ModelsConfig {
            face_detector: missing("det.onnx"),
            gender_age: missing("ga.onnx"),
            text_detector: missing("tdet.onnx"),
            text_recognizer: missing("trec.onnx"),
            text_dictionary: missing("dict.txt"),
        };
        Arc::new(ModelPool::new(&InferenceConfig::default(), &models))
    }

    #[test]
    fn test_face_crop_range() {
        assert!(FACE_CROP_SIDE.contains(&20));
        assert!(FACE_CROP_SIDE.contains(&600));
        assert!(!FACE_CROP_SIDE.contains(&19));
        assert!(!FACE_CROP_SIDE.contains(&601));
    }

    fn detected(landmarks: Option<[(f32, f32); 5]>) -> FaceBox {
        FaceBox { x1: 40.0, y1: 30.0, x2: 120.0, y2: 130.0, confidence: 0.9, landmarks }
    }

    #[test]
    fn test_face_input_without_landmarks_crops_box() {
        let image = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(200, 160, image::Rgb([90, 60, 30])));
        let input = face_input(&image, &detected(None)).unwrap();
        assert_eq!((input.width(), input.height()), (112, 112));
        assert_eq!(input.to_rgb8().get_pixel(56, 56), &image::Rgb([90, 60, 30]));
    }

    #[test]
    fn test_face_input_with_landmarks_aligns() {
        let image = DynamicImage::ImageRgb8(image::RgbImage::new(200, 160));
        let landmarks = [(60.0, 70.0), (100.0, 70.0), (80.0, 90.0), (65.0, 110.0), (95.0, 110.0)];
        let input = face_input(&image, &detected(Some(landmarks))).unwrap();
        assert_eq!((input.width(), input.height()), (112, 112));
    }

    #[test]
    fn test_face_input_empty_box_is_error() {
        let image = DynamicImage::ImageRgb8(image::RgbImage::new(50, 50));
        let mut face = detected(None);
        face.x1 = 60.0;
        face.x2 = 80.0;
        assert!(face_input(&image, &face).is_err());
    }

    #[tokio::test]
    async fn test_face_analyzer_reports_unloaded_models() {
        let analyzer = OpenVinoFaceAnalyzer::new(empty_pool(), &FaceConfig::default());
        assert_eq!(
            analyzer.loaded_models(),
            vec![("face_detector".to_string(), false), ("gender_age".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_face_analyzer_missing_model_is_error() {
        let analyzer = OpenVinoFaceAnalyzer::new(empty_pool(), &FaceConfig::default());
        let image = Arc::new(DynamicImage::ImageRgb8(image::RgbImage::new(64, 64)));
        let err = analyzer.analyze_faces(image).await.unwrap_err();
        assert!(err.to_string().contains("face_detector"));
    }
}
