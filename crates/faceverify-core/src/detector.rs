//! Detection strategies and the fallback chain that runs them.

use crate::backend::InferenceError;
use crate::raster::ImageBuffer;
use crate::types::FaceBox;
use serde::{Deserialize, Serialize};

/// Which detector produced a set of faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Cascade,
    HeuristicAdvanced,
    HeuristicSimple,
}

/// Pluggable face detection strategy.
pub trait FaceDetector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    /// Detect faces. An empty vector is a valid "nothing found" answer;
    /// errors are reserved for runtime failures.
    fn detect(&self, image: &ImageBuffer) -> Result<Vec<FaceBox>, InferenceError>;
}

/// Faces found in one image and the detector that found them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub faces: Vec<FaceBox>,
    pub detector: Option<DetectorKind>,
}

impl Detection {
    /// Highest-confidence face, ties broken by larger area.
    pub fn best(&self) -> Option<&FaceBox> {
        self.faces.iter().max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.area().partial_cmp(&b.area()).unwrap_or(std::cmp::Ordering::Equal))
        })
    }
}

/// Ordered list of detectors tried until one finds a face.
///
/// A detector that errors is skipped in favour of the next one, except for
/// the last detector in the chain whose error is returned.
pub struct DetectorChain {
    detectors: Vec<Box<dyn FaceDetector>>,
}

impl DetectorChain {
    pub fn new(detectors: Vec<Box<dyn FaceDetector>>) -> Self {
        Self { detectors }
    }

    pub fn kinds(&self) -> Vec<DetectorKind> {
        self.detectors.iter().map(|d| d.kind()).collect()
    }

    pub fn detect(&self, image: &ImageBuffer) -> Result<Detection, InferenceError> {
        let last = self.detectors.len().saturating_sub(1);
        for (i, detector) in self.detectors.iter().enumerate() {
            match detector.detect(image) {
                Ok(faces) if !faces.is_empty() => {
                    if i > 0 {
                        tracing::info!(detector = ?detector.kind(), count = faces.len(), "fallback detector found faces");
                    }
                    return Ok(Detection {
                        faces,
                        detector: Some(detector.kind()),
                    });
                }
                Ok(_) => {
                    tracing::debug!(detector = ?detector.kind(), "no faces, trying next detector");
                }
                Err(e) if i < last => {
                    tracing::warn!(detector = ?detector.kind(), error = %e, "detector failed, falling back");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Detection {
            faces: Vec::new(),
            detector: None,
        })
    }
}
