//! Optional anti-spoofing check.

use crate::backend::{image_to_tensor, require_image_input, InferenceBackend, InferenceError, TensorLayout};
use crate::embedding::face_crop;
use crate::raster::ImageBuffer;
use crate::types::FaceBox;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const ANTISPOOF_DEFAULT_SIZE: u32 = 80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Output class that means "real face".
    pub live_class_index: usize,
    pub padding: f32,
    pub threshold: f32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            live_class_index: 1,
            padding: 0.2,
            threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessScore {
    /// Probability of the live class.
    pub score: f32,
    pub live: bool,
}

/// Runs the anti-spoofing network on a padded face crop.
pub struct LivenessChecker {
    net: Arc<dyn InferenceBackend>,
    layout: TensorLayout,
    input_size: u32,
    config: LivenessConfig,
}

impl LivenessChecker {
    pub fn new(net: Arc<dyn InferenceBackend>, config: LivenessConfig) -> Result<Self, InferenceError> {
        let layout = require_image_input(net.as_ref())?;
        let input_size = match net.input_shape().spatial(layout) {
            (Some(h), Some(w)) if h != w => {
                return Err(InferenceError::ShapeMismatch {
                    model: net.name().to_string(),
                    detail: format!("expected square input, got {h}x{w}"),
                })
            }
            (Some(h), _) | (_, Some(h)) => h as u32,
            (None, None) => ANTISPOOF_DEFAULT_SIZE,
        };
        Ok(Self {
            net,
            layout,
            input_size,
            config,
        })
    }

    pub fn check(&self, image: &ImageBuffer, face: &FaceBox) -> Result<Option<LivenessScore>, InferenceError> {
        let Ok(crop) = face_crop(image, face, self.config.padding, self.input_size) else {
            return Ok(None);
        };
        let input = image_to_tensor(&crop, self.layout, |v| v as f32 / 255.0);
        let outputs = self.net.run(input.view())?;
        let logits: Vec<f32> = outputs.first().map(|t| t.iter().copied().collect()).unwrap_or_default();

        let index = self.config.live_class_index;
        if logits.len() <= index {
            return Err(InferenceError::ShapeMismatch {
                model: self.net.name().to_string(),
                detail: format!("live class {index} out of range for {} outputs", logits.len()),
            });
        }

        let score = class_probabilities(&logits)[index];
        Ok(Some(LivenessScore {
            score,
            live: score > self.config.threshold,
        }))
    }
}

/// Pass probabilities through, softmax anything else.
fn class_probabilities(values: &[f32]) -> Vec<f32> {
    let sum: f32 = values.iter().sum();
    if values.iter().all(|v| (0.0..=1.0).contains(v)) && (sum - 1.0).abs() < 1e-3 {
        return values.to_vec();
    }
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.iter().map(|e| e / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FnBackend, OutputInfo, TensorShape};
    use crate::geometry::Rect;
    use ndarray::{ArrayD, IxDyn};

    fn checker(output: Vec<f32>) -> LivenessChecker {
        let n = output.len();
        let net = Arc::new(FnBackend::new(
            "antispoof",
            TensorShape::fixed(&[1, 3, 80, 80]),
            vec![OutputInfo::new("out", TensorShape::fixed(&[1, n]))],
            move |input| {
                assert_eq!(input.shape(), &[1, 3, 80, 80]);
                Ok(vec![ArrayD::from_shape_vec(IxDyn(&[1, n]), output.clone()).unwrap()])
            },
        ));
        LivenessChecker::new(net, LivenessConfig::default()).unwrap()
    }

    fn face() -> FaceBox {
        FaceBox::new(Rect::new(20.0, 20.0, 40.0, 40.0), 0.9)
    }

    #[test]
    fn test_probabilities_pass_through() {
        let img = ImageBuffer::filled(100, 100, [120, 90, 80]).unwrap();
        let result = checker(vec![0.1, 0.8, 0.1]).check(&img, &face()).unwrap().unwrap();
        assert!((result.score - 0.8).abs() < 1e-6);
        assert!(result.live);
    }

    #[test]
    fn test_logits_are_softmaxed() {
        let img = ImageBuffer::filled(100, 100, [120, 90, 80]).unwrap();
        let result = checker(vec![4.0, -4.0]).check(&img, &face()).unwrap().unwrap();
        assert!(result.score < 0.01);
        assert!(!result.live);
    }

    #[test]
    fn test_face_outside_image_is_unknown() {
        let img = ImageBuffer::filled(10, 10, [0, 0, 0]).unwrap();
        let far = FaceBox::new(Rect::new(50.0, 50.0, 10.0, 10.0), 0.9);
        assert_eq!(checker(vec![0.5, 0.5]).check(&img, &far).unwrap(), None);
    }

    #[test]
    fn test_non_square_input_rejected() {
        let net = Arc::new(FnBackend::new(
            "antispoof",
            TensorShape::fixed(&[1, 3, 80, 64]),
            vec![OutputInfo::new("out", TensorShape::fixed(&[1, 2]))],
            |_| Ok(vec![ArrayD::zeros(IxDyn(&[1, 2]))]),
        ));
        let err = LivenessChecker::new(net, LivenessConfig::default()).err().unwrap();
        assert!(matches!(err, InferenceError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_class_index_out_of_range() {
        let img = ImageBuffer::filled(100, 100, [120, 90, 80]).unwrap();
        assert!(checker(vec![1.0]).check(&img, &face()).is_err());
    }
}
