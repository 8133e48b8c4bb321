//! Embedding comparison and match decisions.

use crate::types::{Embedding, SimilarityScale, VerificationMode, VerificationResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum VerificationError {
    #[error("cannot compare embeddings of length {left} and {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Verification settings. Unset fields fall back to the active mode's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub scale: Option<SimilarityScale>,
    pub threshold: Option<f32>,
}

/// Dot product of two equal-length unit vectors. `None` when lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.iter().zip(b).map(|(x, y)| x * y).sum())
}

/// L2 distance, or `f32::INFINITY` when lengths differ.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt()
}

/// Confidence in the decision for `similarity` against `threshold`.
///
/// Matches map linearly from 0.5 at the threshold to 1.0 at similarity 1;
/// non-matches from 0.0 at similarity 0 to 0.5 at the threshold.
pub fn match_confidence(similarity: f32, threshold: f32, matched: bool) -> f32 {
    let confidence = if matched {
        if threshold >= 1.0 {
            1.0
        } else {
            0.5 + 0.5 * (similarity - threshold) / (1.0 - threshold)
        }
    } else if threshold <= 0.0 {
        0.0
    } else {
        0.5 * similarity / threshold
    };
    if matched {
        confidence.clamp(0.5, 1.0)
    } else {
        confidence.clamp(0.0, 0.5)
    }
}

/// Compares embeddings under one [`VerificationMode`] and threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerificationEngine {
    mode: VerificationMode,
    threshold: f32,
}

impl VerificationEngine {
    pub fn new(mode: VerificationMode, threshold: f32) -> Self {
        Self { mode, threshold }
    }

    /// Engine using the scale's default threshold.
    pub fn with_default_threshold(mode: VerificationMode) -> Self {
        Self::new(mode, mode.scale.default_threshold())
    }

    pub fn mode(&self) -> VerificationMode {
        self.mode
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn verify(&self, a: &Embedding, b: &Embedding) -> Result<VerificationResult, VerificationError> {
        self.verify_with_threshold(a, b, self.threshold)
    }

    /// Compare `a` and `b` with a per-call threshold, expressed in this
    /// engine's similarity scale.
    pub fn verify_with_threshold(
        &self,
        a: &Embedding,
        b: &Embedding,
        threshold: f32,
    ) -> Result<VerificationResult, VerificationError> {
        let dot = cosine_similarity(&a.values, &b.values).ok_or(VerificationError::DimensionMismatch {
            left: a.dimension(),
            right: b.dimension(),
        })?;
        let similarity = self.mode.scale.apply(dot);
        let distance = euclidean_distance(&a.values, &b.values);
        let matched = similarity > threshold;
        let confidence = match_confidence(similarity, threshold, matched);

        tracing::debug!(similarity, distance, threshold, matched, "verification");

        Ok(VerificationResult {
            similarity,
            distance,
            matched,
            confidence,
            threshold,
            mode: self.mode,
            mock: a.is_mock() || b.is_mock(),
        })
    }
}
