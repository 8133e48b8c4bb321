//! ONNX Runtime backend.

use crate::backend::{InferenceBackend, InferenceError, OutputInfo, TensorShape};
use ndarray::{ArrayD, ArrayView4, IxDyn};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

/// A model file loaded into an ONNX Runtime session.
///
/// `Session::run` needs exclusive access, so the session sits behind a
/// mutex; the handle itself is shared read-only between callers.
pub struct OnnxBackend {
    name: String,
    session: Mutex<Session>,
    input_shape: TensorShape,
    outputs: Vec<OutputInfo>,
}

impl OnnxBackend {
    /// Load a model and introspect its first input and all outputs.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, InferenceError> {
        if !model_path.exists() {
            return Err(InferenceError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let name = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| model_path.display().to_string());

        let input_shape = session
            .inputs()
            .first()
            .and_then(|i| i.dtype().tensor_shape())
            .map(|shape| TensorShape::from_onnx(shape))
            .ok_or_else(|| InferenceError::ShapeMismatch {
                model: name.clone(),
                detail: "model has no tensor input".to_string(),
            })?;

        let outputs: Vec<OutputInfo> = session
            .outputs()
            .iter()
            .map(|o| {
                let shape = o
                    .dtype()
                    .tensor_shape()
                    .map(|s| TensorShape::from_onnx(s))
                    .unwrap_or_default();
                OutputInfo::new(o.name(), shape)
            })
            .collect();

        tracing::info!(
            path = %model_path.display(),
            input = %input_shape,
            outputs = ?outputs.iter().map(|o| format!("{}{}", o.name, o.shape)).collect::<Vec<_>>(),
            "loaded ONNX model"
        );

        Ok(Self {
            name,
            session: Mutex::new(session),
            input_shape,
            outputs,
        })
    }
}

impl InferenceBackend for OnnxBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_shape(&self) -> &TensorShape {
        &self.input_shape
    }

    fn outputs(&self) -> &[OutputInfo] {
        &self.outputs
    }

    fn run(&self, input: ArrayView4<'_, f32>) -> Result<Vec<ArrayD<f32>>, InferenceError> {
        let mut session = self
            .session
            .lock()
            .map_err(|e| InferenceError::Poisoned(e.to_string()))?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input)?])?;

        let mut tensors = Vec::with_capacity(self.outputs.len());
        for i in 0..self.outputs.len() {
            let (shape, data) = outputs[i]
                .try_extract_tensor::<f32>()
                .map_err(|e| InferenceError::InferenceFailed(format!("{} output {i}: {e}", self.name)))?;
            let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
            let tensor = ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec()).map_err(|e| {
                InferenceError::ShapeMismatch {
                    model: self.name.clone(),
                    detail: format!("output {i}: {e}"),
                }
            })?;
            tensors.push(tensor);
        }

        Ok(tensors)
    }
}
