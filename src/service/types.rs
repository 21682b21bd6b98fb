//! Service layer types

use serde::{Deserialize, Serialize};

use crate::engine::{Gender, TextLine};

/// `Option<Gender>` as `"male"`, `"female"` or `"unknown"`
pub mod gender_or_unknown {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::engine::Gender;

    pub fn serialize<S: Serializer>(gender: &Option<Gender>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(label(*gender))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Gender>, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(match value.as_str() {
            "male" => Some(Gender::Male),
            "female" => Some(Gender::Female),
            _ => None,
        })
    }

    pub fn label(gender: Option<Gender>) -> &'static str {
        gender.map_or("unknown", |g| g.as_str())
    }
}

/// Caption with the keyword gender guessed from it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionResult {
    pub caption: String,
    #[serde(with = "gender_or_unknown")]
    pub gender: Option<Gender>,
    pub inference_time_ms: u64,
}

/// One analyzed face
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceSummary {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// Detector score, 0 when the whole image was analyzed as a face crop
    pub confidence: f32,
    pub gender: Gender,
    pub gender_confidence: f32,
    pub age: i32,
}

impl FaceSummary {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Gender of the dominant face
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceGenderResult {
    #[serde(with = "gender_or_unknown")]
    pub gender: Option<Gender>,
    pub confidence: f32,
    pub age: Option<i32>,
    pub faces: Vec<FaceSummary>,
    pub inference_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrLine {
    pub text: String,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl From<TextLine> for OcrLine {
    fn from(line: TextLine) -> Self {
        Self {
            text: line.text,
            confidence: line.confidence,
            x1: line.bbox.x1,
            y1: line.bbox.y1,
            x2: line.bbox.x2,
            y2: line.bbox.y2,
        }
    }
}

/// OCR text with the sex field parsed from it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    pub lines: Vec<OcrLine>,
    #[serde(with = "gender_or_unknown")]
    pub sex: Option<Gender>,
    pub inference_time_ms: u64,
}

/// All backends over one image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeResult {
    pub caption: CaptionResult,
    pub face: FaceGenderResult,
    pub ocr: OcrResult,
    /// OCR sex field, else face gender, else caption gender
    #[serde(with = "gender_or_unknown")]
    pub gender: Option<Gender>,
    pub inference_time_ms: u64,
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub healthy: bool,
    pub version: String,
    pub models_loaded: std::collections::HashMap<String, bool>,
}
