//! CTC Text Recognizer
//!
//! Reads a single text line with a PaddleOCR recognition model and greedy CTC decoding.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use image::DynamicImage;

use super::pool::{ModelPool, ModelType};
use super::preprocess::preprocess_for_recognition;
use super::tensor::{first_output, infer_nchw};
use crate::utils::math::argmax;

/// Character table for CTC output classes. Class 0 is the blank.
#[derive(Debug, Clone)]
pub struct Dictionary {
    symbols: Vec<String>,
}

impl Dictionary {
    /// One symbol per line; a space symbol is appended after the file entries
    pub fn parse(content: &str) -> Self {
        let mut symbols: Vec<String> = content
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .filter(|line| !line.is_empty())
            .collect();
        symbols.push(" ".to_string());
        Self { symbols }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read OCR dictionary {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    /// Symbol for a model class, `None` for the blank or out-of-range classes
    pub fn symbol(&self, class: usize) -> Option<&str> {
        class
            .checked_sub(1)
            .and_then(|i| self.symbols.get(i))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// A recognized line and its mean character confidence
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub confidence: f32,
}

pub struct TextRecognizer {
    pool: Arc<ModelPool>,
    dictionary: Dictionary,
    max_width: u32,
}

impl TextRecognizer {
    pub fn new(pool: Arc<ModelPool>, dictionary: Dictionary, max_width: u32) -> Self {
        Self {
            pool,
            dictionary,
            max_width,
        }
    }

    /// Recognize the text in one cropped line
    pub fn recognize(&self, crop: &DynamicImage) -> Result<Recognition> {
        let input = preprocess_for_recognition(crop, self.max_width);

        let model = self.pool.get_model(ModelType::TextRecognizer)?;
        let request = infer_nchw(&model, &input).context("Text recognizer inference failed")?;
        let output = first_output(&request)?;

        // [1, T, C]
        let classes = match output.dims.as_slice() {
            [.., c] if *c > 0 => *c as usize,
            _ => anyhow::bail!("Unexpected text recognizer output shape {:?}", output.dims),
        };
        if classes != self.dictionary.len() + 1 {
            anyhow::bail!(
                "Dictionary has {} symbols but the recognizer predicts {} classes",
                self.dictionary.len(),
                classes
            );
        }

        Ok(ctc_greedy_decode(&output.data, classes, &self.dictionary))
    }
}

/// Greedy CTC decoding over `steps x classes` probabilities.
///
/// Takes the best class per step, collapses consecutive repeats and drops blanks.
pub fn ctc_greedy_decode(probs: &[f32], classes: usize, dictionary: &Dictionary) -> Recognition {
    let mut text = String::new();
    let mut confidences = Vec::new();
    let mut previous = None;

    for step in probs.chunks_exact(classes) {
        let Some((class, prob)) = argmax(step) else { continue };
        if previous != Some(class) {
            if let Some(symbol) = dictionary.symbol(class) {
                text.push_str(symbol);
                confidences.push(prob);
            }
        }
        previous = Some(class);
    }

    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f32>() / confidences.len() as f32
    };

    Recognition { text, confidence }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(classes: usize, hot: &[(usize, f32)]) -> Vec<f32> {
        hot.iter()
            .flat_map(|&(class, prob)| {
                let mut step = vec![0.0; classes];
                step[class] = prob;
                step
            })
            .collect()
    }

    #[test]
    fn test_dictionary() {
        let dict = Dictionary::parse("a\nb\r\nc\n");
        assert_eq!(dict.len(), 4);
        assert_eq!(dict.symbol(0), None);
        assert_eq!(dict.symbol(1), Some("a"));
        assert_eq!(dict.symbol(2), Some("b"));
        assert_eq!(dict.symbol(4), Some(" "));
        assert_eq!(dict.symbol(5), None);
    }

    #[test]
    fn test_collapse_repeats_and_blanks() {
        // classes: 0 blank, 1 'S', 2 'E', 3 'X', 4 ' '
        let dict = Dictionary::parse("S\nE\nX");
        let probs = one_hot(5, &[(1, 0.9), (1, 0.8), (0, 0.99), (2, 0.7), (0, 0.9), (3, 1.0), (3, 0.6)]);
        let rec = ctc_greedy_decode(&probs, 5, &dict);
        assert_eq!(rec.text, "SEX");
        assert!((rec.confidence - (0.9 + 0.7 + 1.0) / 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_blank_separates_doubled_letters() {
        let dict = Dictionary::parse("o\nk");
        let probs = one_hot(4, &[(1, 1.0), (0, 1.0), (1, 1.0), (2, 1.0)]);
        assert_eq!(ctc_greedy_decode(&probs, 4, &dict).text, "ook");
    }

    #[test]
    fn test_all_blank() {
        let dict = Dictionary::parse("a");
        let rec = ctc_greedy_decode(&one_hot(3, &[(0, 1.0), (0, 1.0)]), 3, &dict);
        assert_eq!(rec.text, "");
        assert_eq!(rec.confidence, 0.0);
    }

    #[test]
    fn test_load_missing_dictionary() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Dictionary::load(&dir.path().join("none.txt")).is_err());
    }
}
