//! Face Attribute Analyzer
//!
//! Gender and age estimation with the InsightFace gender-age model.

use std::sync::Arc;

use anyhow::{Context, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use super::pool::{ModelPool, ModelType};
use super::preprocess::preprocess_for_attribute;
use super::tensor::{first_output, infer_nchw};
use crate::utils::math::{sigmoid, softmax};

/// Gender classification result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

/// Face attribute analysis result
#[derive(Debug, Clone, PartialEq)]
pub struct FaceAttributes {
    pub age: i32,
    pub gender: Gender,
    pub gender_confidence: f32,
}

/// Face Attribute Analyzer
pub struct AttributeAnalyzer {
    pool: Arc<ModelPool>,
}

impl AttributeAnalyzer {
    pub fn new(pool: Arc<ModelPool>) -> Self {
        Self { pool }
    }

    /// Analyze an aligned face crop
    pub fn analyze(&self, aligned_face: &DynamicImage) -> Result<FaceAttributes> {
        let input = preprocess_for_attribute(aligned_face);

        let model = self.pool.get_model(ModelType::GenderAge)?;
        let request = infer_nchw(&model, &input).context("Gender-age inference failed")?;
        let output = first_output(&request)?;

        tracing::debug!("GenderAge raw output: {:?}", output.data);
        decode_gender_age(&output.data)
    }
}

/// Decode the gender-age model output.
///
/// Three values are `[female_logit, male_logit, age / 100]`. Two values are
/// `[signed_gender, age]` where a positive gender value means female and the age
/// is either in years or scaled to `[0, 1]`.
pub fn decode_gender_age(output: &[f32]) -> Result<FaceAttributes> {
    let (gender, gender_confidence, age) = match *output {
        [female_logit, male_logit, age_scale] => {
            let probs = softmax(&[female_logit, male_logit]);
            let (gender, conf) = if male_logit > female_logit {
                (Gender::Male, probs[1])
            } else {
                (Gender::Female, probs[0])
            };
            (gender, conf, (age_scale * 100.0).round() as i32)
        }
        [gender_val, age_factor] => {
            let female_prob = sigmoid(gender_val);
            let (gender, conf) = if female_prob > 0.5 {
                (Gender::Female, female_prob)
            } else {
                (Gender::Male, 1.0 - female_prob)
            };
            let age = if age_factor > 1.0 {
                age_factor.round() as i32
            } else {
                (age_factor * 100.0).round() as i32
            };
            (gender, conf, age)
        }
        _ => anyhow::bail!("Unexpected gender-age output length: {}", output.len()),
    };

    Ok(FaceAttributes {
        age: age.clamp(1, 100),
        gender,
        gender_confidence,
    })
}
