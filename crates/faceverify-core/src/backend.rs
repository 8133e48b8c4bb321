//! Inference runtime seam.
//!
//! Every network in the pipeline is reached through [`InferenceBackend`]:
//! one image tensor in, a list of flat `ndarray` tensors out. Shapes are
//! introspected from the backend rather than assumed, because exported
//! variants of the same network disagree on layout and dynamic axes.

use crate::raster::ImageBuffer;
use ndarray::{Array4, ArrayD, ArrayView4};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("shape mismatch in {model}: {detail}")]
    ShapeMismatch { model: String, detail: String },
    #[error("model session lock poisoned: {0}")]
    Poisoned(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Tensor shape as reported by a model. Dynamic axes are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TensorShape(Vec<Option<usize>>);

impl TensorShape {
    pub fn new(dims: Vec<Option<usize>>) -> Self {
        Self(dims)
    }

    /// Fully static shape.
    pub fn fixed(dims: &[usize]) -> Self {
        Self(dims.iter().map(|&d| Some(d)).collect())
    }

    /// From ONNX-style dims where any non-positive value marks a dynamic axis.
    pub fn from_onnx(dims: &[i64]) -> Self {
        Self(dims.iter().map(|&d| (d > 0).then_some(d as usize)).collect())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.0.get(axis).copied().flatten()
    }

    pub fn dims(&self) -> &[Option<usize>] {
        &self.0
    }

    /// Element count excluding the batch axis, if every such axis is static.
    pub fn per_item_len(&self) -> Option<usize> {
        self.0.iter().skip(1).try_fold(1usize, |acc, d| d.map(|d| acc * d))
    }

    /// Rank-4 image layout, judged by which axis carries 3 channels.
    pub fn layout(&self) -> Option<TensorLayout> {
        if self.rank() != 4 {
            return None;
        }
        match (self.dim(1), self.dim(3)) {
            (Some(3), _) => Some(TensorLayout::Nchw),
            (_, Some(3)) => Some(TensorLayout::Nhwc),
            _ => None,
        }
    }

    /// Static (height, width) of a rank-4 image tensor in `layout`.
    pub fn spatial(&self, layout: TensorLayout) -> (Option<usize>, Option<usize>) {
        match layout {
            TensorLayout::Nchw => (self.dim(2), self.dim(3)),
            TensorLayout::Nhwc => (self.dim(1), self.dim(2)),
        }
    }

    /// Channel count of a rank-4 tensor in `layout`, or the last axis otherwise.
    pub fn channels(&self, layout: TensorLayout) -> Option<usize> {
        match (self.rank(), layout) {
            (4, TensorLayout::Nchw) => self.dim(1),
            (4, TensorLayout::Nhwc) => self.dim(3),
            (r, _) if r > 0 => self.dim(r - 1),
            _ => None,
        }
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match d {
                Some(d) => write!(f, "{d}")?,
                None => f.write_str("?")?,
            }
        }
        f.write_str("]")
    }
}

/// Memory order of a rank-4 image tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

/// Name and shape of one model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    pub name: String,
    pub shape: TensorShape,
}

impl OutputInfo {
    pub fn new(name: impl Into<String>, shape: TensorShape) -> Self {
        Self { name: name.into(), shape }
    }
}

/// A loaded network. Implementations must be safe to share across threads:
/// weights are read-only after load.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;
    fn input_shape(&self) -> &TensorShape;
    fn outputs(&self) -> &[OutputInfo];
    fn run(&self, input: ArrayView4<'_, f32>) -> Result<Vec<ArrayD<f32>>, InferenceError>;

    /// Input layout, defaulting to NCHW when the shape does not say.
    fn layout(&self) -> TensorLayout {
        self.input_shape().layout().unwrap_or(TensorLayout::Nchw)
    }
}

type RunFn = dyn Fn(ArrayView4<'_, f32>) -> Result<Vec<ArrayD<f32>>, InferenceError> + Send + Sync;

/// Backend driven by a closure, for runtimes other than ONNX and for tests.
pub struct FnBackend {
    name: String,
    input_shape: TensorShape,
    outputs: Vec<OutputInfo>,
    run: Box<RunFn>,
}

impl FnBackend {
    pub fn new<F>(name: impl Into<String>, input_shape: TensorShape, outputs: Vec<OutputInfo>, run: F) -> Self
    where
        F: Fn(ArrayView4<'_, f32>) -> Result<Vec<ArrayD<f32>>, InferenceError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            input_shape,
            outputs,
            run: Box::new(run),
        }
    }
}

impl InferenceBackend for FnBackend {
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
        (self.run)(input)
    }
}

/// Build a batch-of-one image tensor, mapping each 8-bit channel through `normalize`.
pub fn image_to_tensor(image: &ImageBuffer, layout: TensorLayout, normalize: impl Fn(u8) -> f32) -> Array4<f32> {
    let w = image.width() as usize;
    let h = image.height() as usize;
    let mut tensor = match layout {
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, h, w)),
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, h, w, 3)),
    };

    for (i, px) in image.pixels().chunks_exact(3).enumerate() {
        let (y, x) = (i / w, i % w);
        for c in 0..3 {
            let v = normalize(px[c]);
            match layout {
                TensorLayout::Nchw => tensor[[0, c, y, x]] = v,
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = v,
            }
        }
    }

    tensor
}

/// Check that a backend takes a rank-4, 3-channel image and return its layout.
pub fn require_image_input(backend: &dyn InferenceBackend) -> Result<TensorLayout, InferenceError> {
    let shape = backend.input_shape();
    if shape.rank() != 4 {
        return Err(InferenceError::ShapeMismatch {
            model: backend.name().to_string(),
            detail: format!("expected rank-4 image input, got {shape}"),
        });
    }
    Ok(backend.layout())
}

/// What a network output head carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadKind {
    /// Two-class face / not-face scores.
    Score,
    /// Four box-regression deltas.
    BoxRegression,
    /// Ten landmark offsets.
    Landmarks,
}

impl HeadKind {
    fn channels(self) -> usize {
        match self {
            HeadKind::Score => 2,
            HeadKind::BoxRegression => 4,
            HeadKind::Landmarks => 10,
        }
    }

    fn name_hints(self) -> &'static [&'static str] {
        match self {
            HeadKind::Score => &["prob", "score", "cls", "conf"],
            HeadKind::BoxRegression => &["bbox", "reg", "box", "conv4-2", "conv5-2", "conv6-2"],
            HeadKind::Landmarks => &["landmark", "lmk", "kps", "conv6-3"],
        }
    }
}

/// Locate the output index of each requested head.
///
/// Tries output names first, then static channel counts, and finally falls
/// back to the positional order `heads` is given in.
pub fn discover_heads(outputs: &[OutputInfo], heads: &[HeadKind], layout: TensorLayout) -> Vec<usize> {
    let by_name = |kind: HeadKind| -> Option<usize> {
        outputs.iter().position(|o| {
            let name = o.name.to_ascii_lowercase();
            kind.name_hints().iter().any(|hint| name.contains(hint))
        })
    };
    let by_channels = |kind: HeadKind| -> Option<usize> {
        let mut matches = outputs
            .iter()
            .enumerate()
            .filter(|(_, o)| o.shape.channels(layout) == Some(kind.channels()));
        match (matches.next(), matches.next()) {
            (Some((i, _)), None) => Some(i),
            _ => None,
        }
    };

    let resolve = |find: &dyn Fn(HeadKind) -> Option<usize>| -> Option<Vec<usize>> {
        let found: Option<Vec<usize>> = heads.iter().map(|&k| find(k)).collect();
        found.filter(|idx| {
            let mut sorted = idx.clone();
            sorted.sort_unstable();
            sorted.dedup();
            sorted.len() == idx.len()
        })
    };

    if let Some(idx) = resolve(&by_name) {
        tracing::debug!(?heads, ?idx, "output heads mapped by name");
        return idx;
    }
    if let Some(idx) = resolve(&by_channels) {
        tracing::debug!(?heads, ?idx, "output heads mapped by channel count");
        return idx;
    }
    tracing::debug!(
        ?heads,
        names = ?outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
        "output names not recognized, using positional mapping"
    );
    (0..heads.len()).collect()
}

/// Face probability from a two-class head.
///
/// Scores that already form a probability pair are used directly; anything
/// else is treated as logits and softmaxed.
pub fn face_probability(background: f32, face: f32) -> f32 {
    let is_prob = (0.0..=1.0).contains(&background)
        && (0.0..=1.0).contains(&face)
        && (background + face - 1.0).abs() < 1e-3;
    if is_prob {
        face
    } else {
        let m = background.max(face);
        let eb = (background - m).exp();
        let ef = (face - m).exp();
        ef / (eb + ef)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_from_onnx_marks_dynamic_axes() {
        let shape = TensorShape::from_onnx(&[-1, 3, -1, -1]);
        assert_eq!(shape.dims(), &[None, Some(3), None, None]);
        assert_eq!(shape.layout(), Some(TensorLayout::Nchw));
        assert_eq!(shape.to_string(), "[?, 3, ?, ?]");
    }

    #[test]
    fn test_shape_layout_nhwc() {
        let shape = TensorShape::fixed(&[1, 112, 112, 3]);
        assert_eq!(shape.layout(), Some(TensorLayout::Nhwc));
        assert_eq!(shape.spatial(TensorLayout::Nhwc), (Some(112), Some(112)));
    }

    #[test]
    fn test_per_item_len() {
        assert_eq!(TensorShape::from_onnx(&[-1, 128]).per_item_len(), Some(128));
        assert_eq!(TensorShape::from_onnx(&[1, -1]).per_item_len(), None);
    }

    #[test]
    fn test_image_to_tensor_layouts() {
        let img = ImageBuffer::from_fn(3, 2, |x, y| [x as u8, y as u8, 9]).unwrap();
        let nchw = image_to_tensor(&img, TensorLayout::Nchw, |v| v as f32);
        assert_eq!(nchw.shape(), &[1, 3, 2, 3]);
        assert_eq!(nchw[[0, 0, 1, 2]], 2.0);
        assert_eq!(nchw[[0, 1, 1, 2]], 1.0);
        assert_eq!(nchw[[0, 2, 1, 2]], 9.0);

        let nhwc = image_to_tensor(&img, TensorLayout::Nhwc, |v| v as f32);
        assert_eq!(nhwc.shape(), &[1, 2, 3, 3]);
        assert_eq!(nhwc[[0, 1, 2, 0]], 2.0);
        assert_eq!(nhwc[[0, 1, 2, 2]], 9.0);
    }

    #[test]
    fn test_discover_heads_by_name() {
        let outputs = vec![
            OutputInfo::new("conv6-2", TensorShape::fixed(&[1, 4])),
            OutputInfo::new("conv6-3", TensorShape::fixed(&[1, 10])),
            OutputInfo::new("prob1", TensorShape::fixed(&[1, 2])),
        ];
        let idx = discover_heads(
            &outputs,
            &[HeadKind::Score, HeadKind::BoxRegression, HeadKind::Landmarks],
            TensorLayout::Nchw,
        );
        assert_eq!(idx, vec![2, 0, 1]);
    }

    #[test]
    fn test_discover_heads_by_channels() {
        let outputs = vec![
            OutputInfo::new("421", TensorShape::from_onnx(&[1, 4, -1, -1])),
            OutputInfo::new("422", TensorShape::from_onnx(&[1, 2, -1, -1])),
        ];
        let idx = discover_heads(&outputs, &[HeadKind::Score, HeadKind::BoxRegression], TensorLayout::Nchw);
        assert_eq!(idx, vec![1, 0]);
    }

    #[test]
    fn test_discover_heads_positional_fallback() {
        let outputs = vec![
            OutputInfo::new("a", TensorShape::default()),
            OutputInfo::new("b", TensorShape::default()),
        ];
        let idx = discover_heads(&outputs, &[HeadKind::Score, HeadKind::BoxRegression], TensorLayout::Nchw);
        assert_eq!(idx, vec![0, 1]);
    }

    #[test]
    fn test_face_probability_passthrough_and_softmax() {
        assert!((face_probability(0.2, 0.8) - 0.8).abs() < 1e-6);
        // Equal logits -> 0.5
        assert!((face_probability(3.0, 3.0) - 0.5).abs() < 1e-6);
        assert!(face_probability(-4.0, 4.0) > 0.99);
    }
}
