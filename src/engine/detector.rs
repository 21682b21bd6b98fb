//! SCRFD Face Detector
//!
//! Face detection with the InsightFace SCRFD model family.
//! Outputs bounding boxes, and 5-point landmarks when the export has them,
//! in source image coordinates.

use std::sync::Arc;

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use openvino::InferRequest;

use super::pool::{ModelPool, ModelType};
use super::preprocess::{preprocess_for_detection, ResizeInfo, DETECTOR_INPUT_SIZE};
use super::tensor::{infer_nchw, read_f32};
use crate::utils::math::iou;

/// Face detection result
#[derive(Debug, Clone)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    /// `None` for exports without a keypoint head
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn corners(&self) -> (f32, f32, f32, f32) {
        (self.x1, self.y1, self.x2, self.y2)
    }
}

/// Output layout of an SCRFD export, derived from its output count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutputLayout {
    strides: &'static [i32],
    with_keypoints: bool,
    anchors_per_cell: usize,
}

impl OutputLayout {
    fn from_output_count(count: usize) -> Option<Self> {
        const THREE: &[i32] = &[8, 16, 32];
        const FIVE: &[i32] = &[8, 16, 32, 64, 128];
        let layout = match count {
            6 => (THREE, false, 2),
            9 => (THREE, true, 2),
            10 => (FIVE, false, 1),
            15 => (FIVE, true, 1),
            _ => return None,
        };
        Some(Self {
            strides: layout.0,
            with_keypoints: layout.1,
            anchors_per_cell: layout.2,
        })
    }
}

/// Raw per-stride outputs
struct StrideOutputs<'a> {
    stride: i32,
    scores: &'a [f32],
    bboxes: &'a [f32],
    keypoints: Option<&'a [f32]>,
}

/// SCRFD Face Detector
pub struct FaceDetector {
    pool: Arc<ModelPool>,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl FaceDetector {
    pub fn new(pool: Arc<ModelPool>, confidence_threshold: f32, nms_threshold: f32) -> Self {
        Self {
            pool,
            confidence_threshold,
            nms_threshold,
        }
    }

    /// Detect faces in a decoded image
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let resize_info = ResizeInfo::new(image.dimensions(), DETECTOR_INPUT_SIZE);
        let input = preprocess_for_detection(image);

        let model = self.pool.get_model(ModelType::FaceDetector)?;
        let request = infer_nchw(&model, &input).context("Face detector inference failed")?;

        let candidates = self.parse_outputs(&request, &resize_info)?;
        let faces = nms(candidates, self.nms_threshold);

        tracing::debug!("Detected {} faces after NMS", faces.len());
        Ok(faces)
    }

    fn parse_outputs(&self, request: &InferRequest, resize_info: &ResizeInfo) -> Result<Vec<FaceBox>> {
        let mut outputs = Vec::new();
        while outputs.len() < 16 {
            match request.get_output_tensor_by_index(outputs.len()) {
                Ok(tensor) => outputs.push(read_f32(&tensor)?.data),
                Err(_) => break,
            }
        }

        let layout = OutputLayout::from_output_count(outputs.len())
            .with_context(|| format!("Unsupported SCRFD export with {} outputs", outputs.len()))?;
        let fmc = layout.strides.len();

        let mut boxes = Vec::new();
        for (idx, &stride) in layout.strides.iter().enumerate() {
            let stride_outputs = StrideOutputs {
                stride,
                scores: &outputs[idx],
                bboxes: &outputs[idx + fmc],
                keypoints: layout.with_keypoints.then(|| outputs[idx + fmc * 2].as_slice()),
            };
            self.decode_stride(&stride_outputs, layout.anchors_per_cell, resize_info, &mut boxes);
        }

        tracing::debug!("{} face candidates before NMS", boxes.len());
        Ok(boxes)
    }

    /// Decode distance-encoded boxes and keypoints around each anchor center
    fn decode_stride(
        &self,
        out: &StrideOutputs<'_>,
        anchors_per_cell: usize,
        resize_info: &ResizeInfo,
        boxes: &mut Vec<FaceBox>,
    ) {
        let (input_w, input_h) = (DETECTOR_INPUT_SIZE.0 as i32, DETECTOR_INPUT_SIZE.1 as i32);
        let (feat_w, feat_h) = (input_w / out.stride, input_h / out.stride);
        let stride = out.stride as f32;
        let max_w = resize_info.original_width as f32;
        let max_h = resize_info.original_height as f32;

        let anchors = (0..feat_h).flat_map(move |y| {
            (0..feat_w).flat_map(move |x| {
                std::iter::repeat((x as f32 * stride, y as f32 * stride)).take(anchors_per_cell)
            })
        });

        for (i, (cx, cy)) in anchors.enumerate() {
            let Some(&score) = out.scores.get(i) else { break };
            if score < self.confidence_threshold {
                continue;
            }
            let Some(d) = out.bboxes.get(i * 4..i * 4 + 4) else { continue };

            let (x1, y1) = resize_info.to_original(cx - d[0] * stride, cy - d[1] * stride);
            let (x2, y2) = resize_info.to_original(cx + d[2] * stride, cy + d[3] * stride);

            let landmarks = out.keypoints.and_then(|k| k.get(i * 10..i * 10 + 10)).map(|kps| {
                std::array::from_fn(|j| {
                    resize_info.to_original(cx + kps[j * 2] * stride, cy + kps[j * 2 + 1] * stride)
                })
            });

            boxes.push(FaceBox {
                x1: x1.clamp(0.0, max_w),
                y1: y1.clamp(0.0, max_h),
                x2: x2.clamp(0.0, max_w),
                y2: y2.clamp(0.0, max_h),
                confidence: score,
                landmarks,
            });
        }
    }
}

/// Greedy non-maximum suppression, highest confidence first
pub fn nms(mut boxes: Vec<FaceBox>, threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| iou(k.corners(), candidate.corners()) <= threshold) {
            keep.push(candidate);
        }
    }
    keep
}
