//! OCR pipeline: text detection, reading order, line recognition

use std::sync::Arc;

use anyhow::Result;
use image::DynamicImage;

use super::pool::ModelPool;
use super::text_detector::{sort_reading_order, TextBox, TextDetector};
use super::text_recognizer::{Dictionary, Recognition, TextRecognizer};
use crate::config::OcrConfig;

/// One recognized line of text
#[derive(Debug, Clone, PartialEq)]
pub struct TextLine {
    pub text: String,
    pub confidence: f32,
    pub bbox: TextBox,
}

pub struct OcrEngine {
    detector: TextDetector,
    recognizer: TextRecognizer,
    min_confidence: f32,
}

impl OcrEngine {
    pub fn new(pool: Arc<ModelPool>, dictionary: Dictionary, config: &OcrConfig) -> Self {
        Self {
            detector: TextDetector::new(pool.clone(), config),
            recognizer: TextRecognizer::new(pool, dictionary, config.max_rec_width),
            min_confidence: config.min_confidence,
        }
    }

    /// Read all text lines in reading order
    pub fn read(&self, image: &DynamicImage) -> Result<Vec<TextLine>> {
        let boxes = self.detector.detect(image)?;
        recognize_lines(image, boxes, self.min_confidence, |crop| self.recognizer.recognize(crop))
    }
}

/// Sort boxes into reading order, recognize each crop and keep the lines
/// that pass [`keep_line`]
fn recognize_lines<F>(
    image: &DynamicImage,
    mut boxes: Vec<TextBox>,
    min_confidence: f32,
    mut recognize: F,
) -> Result<Vec<TextLine>>
where
    F: FnMut(&DynamicImage) -> Result<Recognition>,
{
    sort_reading_order(&mut boxes);

    let mut lines = Vec::with_capacity(boxes.len());
    for bbox in boxes {
        let recognition = recognize(&crop_box(image, &bbox))?;
        let Some(text) = keep_line(&recognition, min_confidence) else {
            tracing::debug!(
                "Dropping line {:?} with confidence {:.3}",
                recognition.text,
                recognition.confidence
            );
            continue;
        };

        lines.push(TextLine {
            text,
            confidence: recognition.confidence,
            bbox,
        });
    }

    Ok(lines)
}

/// Trimmed text of a recognized line, `None` if it is blank or under `min_confidence`
fn keep_line(recognition: &Recognition, min_confidence: f32) -> Option<String> {
    let text = recognition.text.trim();
    if text.is_empty() || recognition.confidence < min_confidence {
        return None;
    }
    Some(text.to_string())
}

fn crop_box(image: &DynamicImage, bbox: &TextBox) -> DynamicImage {
    let x = bbox.x1.max(0.0) as u32;
    let y = bbox.y1.max(0.0) as u32;
    let w = (bbox.x2 as u32).min(image.width()).saturating_sub(x).max(1);
    let h = (bbox.y2 as u32).min(image.height()).saturating_sub(y).max(1);
    image.crop_imm(x, y, w, h)
}
