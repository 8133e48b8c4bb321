//! MTCNN-style three-stage cascade detector.
//!
//! P-Net proposes candidate windows over a scale pyramid, R-Net re-scores
//! and regresses square crops of those candidates, and O-Net produces the
//! final boxes with five landmarks. Each network is reached through
//! [`InferenceBackend`] and its input size and output heads are introspected
//! at construction.

mod pyramid;
mod tensor;

pub use pyramid::{scale_pyramid, ScaleLevel};

use crate::backend::{
    discover_heads, face_probability, image_to_tensor, require_image_input, HeadKind, InferenceBackend,
    InferenceError, TensorLayout,
};
use crate::detector::{DetectorKind, FaceDetector};
use crate::geometry::{nms, Point, Rect};
use crate::raster::ImageBuffer;
use crate::types::{FaceBox, Landmarks};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tensor::{head_values, output, Grid};

const CASCADE_MEAN: f32 = 127.5;
const CASCADE_SCALE: f32 = 0.0078125;
const PNET_CELL_SIZE: u32 = 12;
const PNET_STRIDE: u32 = 2;
const RNET_DEFAULT_SIZE: u32 = 24;
const ONET_DEFAULT_SIZE: u32 = 48;

/// Order of the ten O-Net landmark values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandmarkLayout {
    /// `[x1..x5, y1..y5]` (original Caffe export).
    #[default]
    Planar,
    /// `[x1, y1, x2, y2, ...]`.
    Interleaved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Smallest face (pixels) the pyramid is built to find.
    pub min_face_size: f32,
    pub scale_factor: f32,
    pub proposal_threshold: f32,
    pub proposal_nms: f32,
    pub refine_threshold: f32,
    pub refine_nms: f32,
    /// Lowered threshold applied to the top-K proposals when nothing
    /// survives refinement at `refine_threshold`.
    pub refine_retry_threshold: f32,
    pub refine_retry_top_k: usize,
    pub output_threshold: f32,
    pub output_nms: f32,
    /// Crops narrower or shorter than this (after clamping) are rejected.
    pub min_crop_size: u32,
    pub landmark_layout: LandmarkLayout,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            min_face_size: 20.0,
            scale_factor: 0.709,
            proposal_threshold: 0.6,
            proposal_nms: 0.5,
            refine_threshold: 0.7,
            refine_nms: 0.7,
            refine_retry_threshold: 0.3,
            refine_retry_top_k: 20,
            output_threshold: 0.7,
            output_nms: 0.7,
            min_crop_size: 5,
            landmark_layout: LandmarkLayout::Planar,
        }
    }
}

/// One network plus the facts introspected from it.
struct Stage {
    net: Arc<dyn InferenceBackend>,
    layout: TensorLayout,
    input_size: u32,
    heads: Vec<usize>,
}

impl Stage {
    fn new(
        net: Arc<dyn InferenceBackend>,
        heads: &[HeadKind],
        default_size: u32,
    ) -> Result<Self, InferenceError> {
        let layout = require_image_input(net.as_ref())?;
        let (h, w) = net.input_shape().spatial(layout);
        let input_size = match (h, w) {
            (Some(h), Some(w)) if h != w => {
                return Err(InferenceError::ShapeMismatch {
                    model: net.name().to_string(),
                    detail: format!("expected square input, got {h}x{w}"),
                })
            }
            (Some(h), _) | (_, Some(h)) => h as u32,
            (None, None) => default_size,
        };
        let heads = discover_heads(net.outputs(), heads, layout);
        Ok(Self {
            net,
            layout,
            input_size,
            heads,
        })
    }

    fn run(&self, image: &ImageBuffer) -> Result<Vec<ndarray::ArrayD<f32>>, InferenceError> {
        let input = image_to_tensor(image, self.layout, normalize_cascade);
        let outputs = self.net.run(input.view())?;
        if let Some(&max) = self.heads.iter().max() {
            output(&outputs, max, self.net.name())?;
        }
        Ok(outputs)
    }
}

fn normalize_cascade(v: u8) -> f32 {
    (v as f32 - CASCADE_MEAN) * CASCADE_SCALE
}

/// Square crop around `face`, clamped to the image and resized for a stage.
///
/// Returns the pixel region actually sampled (the reference frame for that
/// stage's regression and landmark outputs) and the resized patch.
fn crop_patch(image: &ImageBuffer, face: &FaceBox, size: u32, min_crop: u32) -> Option<(Rect, ImageBuffer)> {
    let square = face.rect().to_square();
    if !square.is_valid() {
        return None;
    }
    let clamped = square.clamp_to(image.width() as f32, image.height() as f32)?;
    let left = clamped.x.floor();
    let top = clamped.y.floor();
    let right = clamped.right().ceil().min(image.width() as f32);
    let bottom = clamped.bottom().ceil().min(image.height() as f32);
    let region = Rect::from_edges(left, top, right, bottom);
    if region.width < min_crop as f32 || region.height < min_crop as f32 {
        return None;
    }
    let patch = image.crop(&region, min_crop)?;
    Some((region, patch.resize(size, size)))
}

/// Three-stage cascade face detector. Owns its three networks for its lifetime.
pub struct CascadeDetector {
    pnet: Stage,
    rnet: Stage,
    onet: Stage,
    config: CascadeConfig,
}

impl CascadeDetector {
    pub fn new(
        pnet: Arc<dyn InferenceBackend>,
        rnet: Arc<dyn InferenceBackend>,
        onet: Arc<dyn InferenceBackend>,
        config: CascadeConfig,
    ) -> Result<Self, InferenceError> {
        let pnet = Stage::new(pnet, &[HeadKind::Score, HeadKind::BoxRegression], PNET_CELL_SIZE)?;
        let rnet = Stage::new(rnet, &[HeadKind::Score, HeadKind::BoxRegression], RNET_DEFAULT_SIZE)?;
        let onet = Stage::new(
            onet,
            &[HeadKind::Score, HeadKind::BoxRegression, HeadKind::Landmarks],
            ONET_DEFAULT_SIZE,
        )?;

        tracing::debug!(
            rnet_input = rnet.input_size,
            onet_input = onet.input_size,
            pnet_heads = ?pnet.heads,
            rnet_heads = ?rnet.heads,
            onet_heads = ?onet.heads,
            "cascade detector ready"
        );

        Ok(Self {
            pnet,
            rnet,
            onet,
            config,
        })
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Run all three stages. An empty result means no stage produced a face.
    pub fn detect(&self, image: &ImageBuffer) -> Result<Vec<FaceBox>, InferenceError> {
        let proposals = self.propose(image)?;
        tracing::debug!(count = proposals.len(), "P-stage proposals");
        if proposals.is_empty() {
            return Ok(proposals);
        }

        let refined = self.refine(image, &proposals)?;
        tracing::debug!(count = refined.len(), "R-stage survivors");
        if refined.is_empty() {
            return Ok(refined);
        }

        let faces = self.finalize(image, &refined)?;
        tracing::debug!(count = faces.len(), "O-stage detections");
        Ok(faces)
    }

    /// P stage: dense proposals over the scale pyramid, merged by NMS.
    pub fn propose(&self, image: &ImageBuffer) -> Result<Vec<FaceBox>, InferenceError> {
        let cfg = &self.config;
        let levels = scale_pyramid(
            image.width(),
            image.height(),
            cfg.min_face_size,
            cfg.scale_factor,
            PNET_CELL_SIZE,
        );

        let mut all = Vec::new();
        for level in &levels {
            let scaled = image.resize(level.width, level.height);
            let outputs = self.pnet.run(&scaled)?;
            let name = self.pnet.net.name();
            let scores = Grid::new(&outputs[self.pnet.heads[0]], self.pnet.layout, 2, name)?;
            let deltas = Grid::new(&outputs[self.pnet.heads[1]], self.pnet.layout, 4, name)?;

            let mut level_boxes = Vec::new();
            for gy in 0..scores.height.min(deltas.height) {
                for gx in 0..scores.width.min(deltas.width) {
                    let p = face_probability(scores.get(0, gy, gx), scores.get(1, gy, gx));
                    if p <= cfg.proposal_threshold {
                        continue;
                    }
                    let cell = Rect::new(
                        (PNET_STRIDE * gx as u32) as f32 / level.scale,
                        (PNET_STRIDE * gy as u32) as f32 / level.scale,
                        PNET_CELL_SIZE as f32 / level.scale,
                        PNET_CELL_SIZE as f32 / level.scale,
                    );
                    let reg = [
                        deltas.get(0, gy, gx),
                        deltas.get(1, gy, gx),
                        deltas.get(2, gy, gx),
                        deltas.get(3, gy, gx),
                    ];
                    let mut candidate = FaceBox::new(cell, p);
                    candidate.set_rect(cell.regress(reg));
                    if candidate.rect().is_valid() {
                        level_boxes.push(candidate);
                    }
                }
            }

            let kept = nms(level_boxes, cfg.proposal_nms);
            tracing::trace!(scale = level.scale, kept = kept.len(), "pyramid level");
            all.extend(kept);
        }

        Ok(nms(all, cfg.proposal_nms))
    }

    /// R stage: re-score each proposal on a square crop and regress it.
    ///
    /// When nothing passes `refine_threshold`, the `refine_retry_top_k`
    /// most confident proposals are reconsidered at `refine_retry_threshold`.
    pub fn refine(&self, image: &ImageBuffer, proposals: &[FaceBox]) -> Result<Vec<FaceBox>, InferenceError> {
        let cfg = &self.config;
        let name = self.rnet.net.name();

        // (proposal index, score, regressed box)
        let mut scored: Vec<(usize, f32, FaceBox)> = Vec::with_capacity(proposals.len());
        for (i, proposal) in proposals.iter().enumerate() {
            let Some((region, patch)) = crop_patch(image, proposal, self.rnet.input_size, cfg.min_crop_size) else {
                continue;
            };
            let outputs = self.rnet.run(&patch)?;
            let score = head_values(&outputs[self.rnet.heads[0]], 2, name)?;
            let reg = head_values(&outputs[self.rnet.heads[1]], 4, name)?;
            let p = face_probability(score[0], score[1]);

            let mut refined = proposal.clone();
            refined.confidence = p;
            refined.set_rect(region.regress([reg[0], reg[1], reg[2], reg[3]]));
            if refined.rect().is_valid() {
                scored.push((i, p, refined));
            }
        }

        let mut survivors: Vec<FaceBox> = scored
            .iter()
            .filter(|(_, p, _)| *p > cfg.refine_threshold)
            .map(|(_, _, b)| b.clone())
            .collect();

        if survivors.is_empty() && !scored.is_empty() {
            let top_k = top_k_indices(proposals, cfg.refine_retry_top_k);
            survivors = scored
                .iter()
                .filter(|(i, p, _)| top_k.contains(i) && *p > cfg.refine_retry_threshold)
                .map(|(_, _, b)| b.clone())
                .collect();
            tracing::warn!(
                threshold = cfg.refine_threshold,
                retry_threshold = cfg.refine_retry_threshold,
                top_k = cfg.refine_retry_top_k,
                recovered = survivors.len(),
                "no R-stage survivors, retried top proposals at lowered threshold"
            );
        }

        Ok(nms(survivors, cfg.refine_nms))
    }

    /// O stage: final scoring, regression and landmark decoding.
    pub fn finalize(&self, image: &ImageBuffer, candidates: &[FaceBox]) -> Result<Vec<FaceBox>, InferenceError> {
        let cfg = &self.config;
        let name = self.onet.net.name();

        let mut faces = Vec::new();
        for candidate in candidates {
            let Some((region, patch)) = crop_patch(image, candidate, self.onet.input_size, cfg.min_crop_size) else {
                continue;
            };
            let outputs = self.onet.run(&patch)?;
            let score = head_values(&outputs[self.onet.heads[0]], 2, name)?;
            let p = face_probability(score[0], score[1]);
            if p <= cfg.output_threshold {
                continue;
            }
            let reg = head_values(&outputs[self.onet.heads[1]], 4, name)?;
            let lms = head_values(&outputs[self.onet.heads[2]], 10, name)?;

            let mut face = candidate.clone();
            face.confidence = p;
            face.landmarks = Some(decode_landmarks(&lms, &region, cfg.landmark_layout));
            face.set_rect(region.regress([reg[0], reg[1], reg[2], reg[3]]));
            if face.rect().is_valid() {
                faces.push(face);
            }
        }

        Ok(nms(faces, cfg.output_nms))
    }
}

impl FaceDetector for CascadeDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Cascade
    }

    fn detect(&self, image: &ImageBuffer) -> Result<Vec<FaceBox>, InferenceError> {
        CascadeDetector::detect(self, image)
    }
}

/// Indices of the `k` most confident boxes.
fn top_k_indices(boxes: &[FaceBox], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| {
        boxes[b]
            .confidence
            .partial_cmp(&boxes[a].confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(k);
    order
}

/// Convert landmark offsets (fractions of the crop region) to image coordinates.
fn decode_landmarks(values: &[f32], region: &Rect, layout: LandmarkLayout) -> Landmarks {
    let points = std::array::from_fn(|i| {
        let (fx, fy) = match layout {
            LandmarkLayout::Planar => (values[i], values[i + 5]),
            LandmarkLayout::Interleaved => (values[2 * i], values[2 * i + 1]),
        };
        Point::new(region.x + fx * region.width, region.y + fy * region.height)
    });
    Landmarks::new(points)
}
