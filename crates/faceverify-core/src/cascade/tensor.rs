//! Readers for cascade network outputs.

use crate::backend::{InferenceError, TensorLayout};
use ndarray::ArrayD;

/// Dense per-location output of the proposal network.
pub(crate) struct Grid<'a> {
    tensor: &'a ArrayD<f32>,
    layout: TensorLayout,
    pub height: usize,
    pub width: usize,
}

impl<'a> Grid<'a> {
    pub fn new(
        tensor: &'a ArrayD<f32>,
        layout: TensorLayout,
        channels: usize,
        model: &str,
    ) -> Result<Self, InferenceError> {
        let shape = tensor.shape();
        let (c, height, width) = match (shape.len(), layout) {
            (4, TensorLayout::Nchw) => (shape[1], shape[2], shape[3]),
            (4, TensorLayout::Nhwc) => (shape[3], shape[1], shape[2]),
            _ => {
                return Err(InferenceError::ShapeMismatch {
                    model: model.to_string(),
                    detail: format!("expected rank-4 grid output, got {shape:?}"),
                })
            }
        };
        if c < channels {
            return Err(InferenceError::ShapeMismatch {
                model: model.to_string(),
                detail: format!("expected {channels} grid channels, got {c}"),
            });
        }
        Ok(Self {
            tensor,
            layout,
            height,
            width,
        })
    }

    pub fn get(&self, channel: usize, y: usize, x: usize) -> f32 {
        match self.layout {
            TensorLayout::Nchw => self.tensor[&[0, channel, y, x][..]],
            TensorLayout::Nhwc => self.tensor[&[0, y, x, channel][..]],
        }
    }
}

/// Flatten a per-crop head (e.g. `[1, 4]` or `[1, 4, 1, 1]`) and check its length.
pub(crate) fn head_values(tensor: &ArrayD<f32>, expected: usize, model: &str) -> Result<Vec<f32>, InferenceError> {
    let values: Vec<f32> = tensor.iter().copied().collect();
    if values.len() < expected {
        return Err(InferenceError::ShapeMismatch {
            model: model.to_string(),
            detail: format!("expected {expected} values, got {} ({:?})", values.len(), tensor.shape()),
        });
    }
    Ok(values)
}

/// Fetch output `index`, failing with a shape error if the model returned fewer.
pub(crate) fn output<'a>(outputs: &'a [ArrayD<f32>], index: usize, model: &str) -> Result<&'a ArrayD<f32>, InferenceError> {
    outputs.get(index).ok_or_else(|| InferenceError::ShapeMismatch {
        model: model.to_string(),
        detail: format!("missing output {index}, model returned {}", outputs.len()),
    })
}
