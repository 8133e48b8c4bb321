//! Face embedding extraction.
//!
//! [`NetworkExtractor`] runs a MobileFaceNet-style network on a padded (or
//! landmark-aligned) face crop. [`ContentAwareMockExtractor`] is the
//! model-free demo embedder: deterministic, sensitive to image content, and
//! always tagged [`EmbeddingSource::Mock`].

use crate::alignment;
use crate::backend::{image_to_tensor, require_image_input, InferenceBackend, InferenceError, TensorLayout};
use crate::raster::ImageBuffer;
use crate::types::{l2_norm, Embedding, EmbeddingSource, FaceBox};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const EMBEDDING_DEFAULT_SIZE: u32 = 112;
const MOCK_DEFAULT_DIMENSION: usize = 128;
const MOCK_MODEL_VERSION: &str = "content-aware-mock";
const MOCK_GRID: u32 = 4;
const MOCK_CELL: u32 = 8;
const MOCK_FEATURES: usize = (MOCK_GRID * MOCK_GRID * 4) as usize;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("embedding has zero norm")]
    ZeroNorm,
    #[error("face crop is empty after clamping to the image")]
    EmptyCrop,
    #[error("expected {expected}-dim embedding, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Expected output length. `None` adopts whatever the network reports.
    pub dimension: Option<usize>,
    /// Symmetric padding around the face box, as a fraction of its size.
    pub padding: f32,
    /// Warp faces with landmarks onto the canonical template.
    pub align: bool,
    pub mock_seed: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: None,
            padding: 0.15,
            align: true,
            mock_seed: 0x5eed_face,
        }
    }
}

/// L2-normalize `values`. Zero or non-finite norms are an error, never a
/// silently un-normalized vector.
pub fn normalize(values: &[f32]) -> Result<Vec<f32>, EmbeddingError> {
    let norm = l2_norm(values);
    if norm == 0.0 || !norm.is_finite() {
        return Err(EmbeddingError::ZeroNorm);
    }
    Ok(values.iter().map(|v| v / norm).collect())
}

/// Padded crop of `face`, clamped to the image and resized to `size`.
pub fn face_crop(image: &ImageBuffer, face: &FaceBox, padding: f32, size: u32) -> Result<ImageBuffer, EmbeddingError> {
    let region = face.rect().pad(padding);
    let crop = image.crop(&region, 1).ok_or(EmbeddingError::EmptyCrop)?;
    Ok(crop.resize(size, size))
}

/// Turns a face into an [`Embedding`].
pub trait FaceEmbedder: Send + Sync {
    fn source(&self) -> EmbeddingSource;

    /// Output length, when known ahead of the first call.
    fn dimension(&self) -> Option<usize>;

    /// Embed the face at `face` within `image`.
    fn embed(&self, image: &ImageBuffer, face: &FaceBox) -> Result<Embedding, EmbeddingError>;

    /// Embed an image that is already a face crop.
    fn embed_image(&self, face_image: &ImageBuffer) -> Result<Embedding, EmbeddingError>;
}

/// Embedding network behind an [`InferenceBackend`].
pub struct NetworkExtractor {
    net: Arc<dyn InferenceBackend>,
    layout: TensorLayout,
    input_size: u32,
    dimension: Option<usize>,
    config: EmbeddingConfig,
}

impl NetworkExtractor {
    pub fn new(net: Arc<dyn InferenceBackend>, config: EmbeddingConfig) -> Result<Self, InferenceError> {
        let layout = require_image_input(net.as_ref())?;
        let input_size = match net.input_shape().spatial(layout) {
            (Some(h), Some(w)) if h != w => {
                return Err(InferenceError::ShapeMismatch {
                    model: net.name().to_string(),
                    detail: format!("expected square input, got {h}x{w}"),
                })
            }
            (Some(h), _) | (_, Some(h)) => h as u32,
            (None, None) => EMBEDDING_DEFAULT_SIZE,
        };

        let reported = net.outputs().first().and_then(|o| o.shape.per_item_len());
        let dimension = match (config.dimension, reported) {
            (Some(want), Some(got)) if want != got => {
                return Err(InferenceError::ShapeMismatch {
                    model: net.name().to_string(),
                    detail: format!("configured {want}-dim embedding, model outputs {got}"),
                })
            }
            (want, got) => want.or(got),
        };

        tracing::debug!(model = net.name(), input_size, ?dimension, "embedding extractor ready");

        Ok(Self {
            net,
            layout,
            input_size,
            dimension,
            config,
        })
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    fn prepare(&self, image: &ImageBuffer, face: &FaceBox) -> Result<ImageBuffer, EmbeddingError> {
        if self.config.align {
            if let Some(landmarks) = &face.landmarks {
                match alignment::align_face(image, landmarks, self.input_size) {
                    Some(aligned) => return Ok(aligned),
                    None => tracing::debug!("degenerate landmarks, using padded crop"),
                }
            }
        }
        face_crop(image, face, self.config.padding, self.input_size)
    }
}

fn normalize_embedding_input(v: u8) -> f32 {
    v as f32 / 255.0 * 2.0 - 1.0
}

impl FaceEmbedder for NetworkExtractor {
    fn source(&self) -> EmbeddingSource {
        EmbeddingSource::Network
    }

    fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    fn embed(&self, image: &ImageBuffer, face: &FaceBox) -> Result<Embedding, EmbeddingError> {
        let crop = self.prepare(image, face)?;
        self.embed_image(&crop)
    }

    fn embed_image(&self, face_image: &ImageBuffer) -> Result<Embedding, EmbeddingError> {
        let resized = face_image.resize(self.input_size, self.input_size);
        let input = image_to_tensor(&resized, self.layout, normalize_embedding_input);
        let outputs = self.net.run(input.view())?;
        let raw: Vec<f32> = outputs
            .first()
            .ok_or_else(|| {
                EmbeddingError::Inference(InferenceError::InferenceFailed(format!(
                    "{} returned no outputs",
                    self.net.name()
                )))
            })?
            .iter()
            .copied()
            .collect();

        if let Some(expected) = self.dimension {
            if raw.len() != expected {
                return Err(EmbeddingError::Dimension {
                    expected,
                    actual: raw.len(),
                });
            }
        }

        Ok(Embedding {
            values: normalize(&raw)?,
            model_version: Some(self.net.name().to_string()),
            source: EmbeddingSource::Network,
        })
    }
}

/// Deterministic model-free embedder for demo and offline use.
///
/// Summarizes the crop as a 4x4 grid of per-channel means plus the local
/// luminance spread of each cell, then projects that summary through a
/// seeded random matrix. Identical crops give identical embeddings and
/// unrelated content gives near-orthogonal ones.
pub struct ContentAwareMockExtractor {
    dimension: usize,
    projection: Vec<f32>,
    padding: f32,
}

impl ContentAwareMockExtractor {
    pub fn new(config: &EmbeddingConfig) -> Self {
        let dimension = config.dimension.unwrap_or(MOCK_DEFAULT_DIMENSION).max(1);
        let mut rng = StdRng::seed_from_u64(config.mock_seed);
        let projection = (0..dimension * MOCK_FEATURES)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();
        Self {
            dimension,
            projection,
            padding: config.padding,
        }
    }

    fn features(face_image: &ImageBuffer) -> Vec<f32> {
        let side = MOCK_GRID * MOCK_CELL;
        let small = face_image.resize(side, side);
        let mut features = Vec::with_capacity(MOCK_FEATURES);
        let mut spreads = Vec::with_capacity((MOCK_GRID * MOCK_GRID) as usize);

        for gy in 0..MOCK_GRID {
            for gx in 0..MOCK_GRID {
                let mut sum = [0.0f32; 3];
                let mut luma = Vec::with_capacity((MOCK_CELL * MOCK_CELL) as usize);
                for y in gy * MOCK_CELL..(gy + 1) * MOCK_CELL {
                    for x in gx * MOCK_CELL..(gx + 1) * MOCK_CELL {
                        let [r, g, b] = small.pixel(x, y).map(|c| c as f32 / 255.0);
                        sum[0] += r;
                        sum[1] += g;
                        sum[2] += b;
                        luma.push(0.299 * r + 0.587 * g + 0.114 * b);
                    }
                }
                let n = luma.len() as f32;
                features.extend(sum.iter().map(|s| s / n));
                let mean = luma.iter().sum::<f32>() / n;
                let var = luma.iter().map(|l| (l - mean).powi(2)).sum::<f32>() / n;
                spreads.push(var.sqrt());
            }
        }
        features.extend(spreads);
        features
    }
}

impl FaceEmbedder for ContentAwareMockExtractor {
    fn source(&self) -> EmbeddingSource {
        EmbeddingSource::Mock
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    fn embed(&self, image: &ImageBuffer, face: &FaceBox) -> Result<Embedding, EmbeddingError> {
        let crop = face_crop(image, face, self.padding, MOCK_GRID * MOCK_CELL)?;
        self.embed_image(&crop)
    }

    fn embed_image(&self, face_image: &ImageBuffer) -> Result<Embedding, EmbeddingError> {
        let features = Self::features(face_image);
        let raw: Vec<f32> = self
            .projection
            .chunks_exact(MOCK_FEATURES)
            .map(|row| row.iter().zip(&features).map(|(w, f)| w * f).sum())
            .collect();

        Ok(Embedding {
            values: normalize(&raw)?,
            model_version: Some(MOCK_MODEL_VERSION.to_string()),
            source: EmbeddingSource::Mock,
        })
    }
}
