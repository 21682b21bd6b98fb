//! Inference engine module
//!
//! - OpenVINO model pool with lazy loading and idle unloading
//! - Face detection and gender/age estimation
//! - Text detection and recognition
//! - Captioning through a hosted endpoint

pub mod pool;
pub mod tensor;
pub mod preprocess;
pub mod detector;
pub mod attribute;
pub mod text_detector;
pub mod text_recognizer;
pub mod ocr;
pub mod captioner;

pub use pool::{ModelPool, ModelType};
pub use detector::FaceDetector;
pub use attribute::{AttributeAnalyzer, Gender};
pub use ocr::{OcrEngine, TextLine};
pub use text_recognizer::Dictionary;
pub use captioner::RemoteCaptioner;
