//! DB Text Detector
//!
//! Finds text regions with a PaddleOCR differentiable-binarization model.
//! The model returns a per-pixel text probability map; boxes are recovered
//! from its connected components.

use std::sync::Arc;

use anyhow::{Context, Result};
use image::DynamicImage;

use super::pool::{ModelPool, ModelType};
use super::preprocess::{preprocess_for_text_detection, TextResize};
use super::tensor::{first_output, infer_nchw};
use crate::config::OcrConfig;

/// Axis-aligned text region in source image coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct TextBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
}

impl TextBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// Thresholds for turning a probability map into boxes
#[derive(Debug, Clone, Copy)]
pub struct DbParams {
    pub det_threshold: f32,
    pub box_threshold: f32,
    pub unclip_ratio: f32,
    pub min_side: f32,
}

impl From<&OcrConfig> for DbParams {
    fn from(config: &OcrConfig) -> Self {
        Self {
            det_threshold: config.det_threshold,
            box_threshold: config.box_threshold,
            unclip_ratio: config.unclip_ratio,
            min_side: 3.0,
        }
    }
}

pub struct TextDetector {
    pool: Arc<ModelPool>,
    params: DbParams,
    max_side_len: u32,
}

impl TextDetector {
    pub fn new(pool: Arc<ModelPool>, config: &OcrConfig) -> Self {
        Self {
            pool,
            params: DbParams::from(config),
            max_side_len: config.max_side_len,
        }
    }

    /// Detect text regions in a decoded image
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<TextBox>> {
        let (input, resize) = preprocess_for_text_detection(image, self.max_side_len);

        let model = self.pool.get_model(ModelType::TextDetector)?;
        let request = infer_nchw(&model, &input).context("Text detector inference failed")?;
        let output = first_output(&request)?;

        // [1, 1, H, W]
        let (map_h, map_w) = match output.dims.as_slice() {
            [.., h, w] => (*h as usize, *w as usize),
            _ => anyhow::bail!("Unexpected text detector output shape {:?}", output.dims),
        };

        let boxes = boxes_from_probability_map(
            &output.data,
            map_w,
            map_h,
            &resize,
            (image.width(), image.height()),
            &self.params,
        );
        tracing::debug!("Detected {} text regions", boxes.len());
        Ok(boxes)
    }
}

/// Extract text boxes from a probability map of `width * height` values.
///
/// Pixels above `det_threshold` are grouped into 4-connected components. A
/// component becomes a box when its mean probability reaches `box_threshold`;
/// the box is then grown by `area * unclip_ratio / perimeter` on every side,
/// since DB models predict shrunken text kernels.
pub fn boxes_from_probability_map(
    map: &[f32],
    width: usize,
    height: usize,
    resize: &TextResize,
    original: (u32, u32),
    params: &DbParams,
) -> Vec<TextBox> {
    if map.len() < width * height {
        return Vec::new();
    }

    let mut visited = vec![false; width * height];
    let mut stack = Vec::new();
    let mut boxes = Vec::new();

    for start in 0..width * height {
        if visited[start] || map[start] <= params.det_threshold {
            continue;
        }

        visited[start] = true;
        stack.push(start);
        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0usize, 0usize);
        let mut score_sum = 0.0f32;
        let mut count = 0usize;

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % width, idx / width);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            score_sum += map[idx];
            count += 1;

            let neighbors = [
                (x > 0).then(|| idx - 1),
                (x + 1 < width).then(|| idx + 1),
                (y > 0).then(|| idx - width),
                (y + 1 < height).then(|| idx + width),
            ];
            for n in neighbors.into_iter().flatten() {
                if !visited[n] && map[n] > params.det_threshold {
                    visited[n] = true;
                    stack.push(n);
                }
            }
        }

        let box_w = (max_x - min_x + 1) as f32;
        let box_h = (max_y - min_y + 1) as f32;
        if box_w.min(box_h) < params.min_side {
            continue;
        }

        let score = score_sum / count as f32;
        if score < params.box_threshold {
            continue;
        }

        let distance = box_w * box_h * params.unclip_ratio / (2.0 * (box_w + box_h));
        let (x1, y1) = resize.to_original(min_x as f32 - distance, min_y as f32 - distance);
        let (x2, y2) = resize.to_original(max_x as f32 + 1.0 + distance, max_y as f32 + 1.0 + distance);

        let text_box = TextBox {
            x1: x1.clamp(0.0, original.0 as f32),
            y1: y1.clamp(0.0, original.1 as f32),
            x2: x2.clamp(0.0, original.0 as f32),
            y2: y2.clamp(0.0, original.1 as f32),
            score,
        };
        if text_box.width().min(text_box.height()) >= params.min_side {
            boxes.push(text_box);
        }
    }

    boxes
}

/// Sort boxes top-to-bottom, then left-to-right within a 10 px line tolerance
pub fn sort_reading_order(boxes: &mut [TextBox]) {
    boxes.sort_by(|a, b| a.y1.total_cmp(&b.y1).then(a.x1.total_cmp(&b.x1)));

    // one bubble pass per box, as boxes on the same line may start at slightly different y
    for i in 0..boxes.len() {
        for j in (0..i).rev() {
            let same_line = (boxes[j + 1].y1 - boxes[j].y1).abs() < 10.0;
            if same_line && boxes[j + 1].x1 < boxes[j].x1 {
                boxes.swap(j, j + 1);
            } else {
                break;
            }
        }
    }
}
