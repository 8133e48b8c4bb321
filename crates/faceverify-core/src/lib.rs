//! faceverify-core: face detection, embedding and verification.
//!
//! An MTCNN cascade (P-Net, R-Net, O-Net) finds faces, with a model-free
//! heuristic detector as fallback. Faces are embedded by a MobileFaceNet-style
//! network (or a tagged mock embedder in demo mode) and compared by cosine
//! similarity. Networks run through ONNX Runtime or any other
//! [`InferenceBackend`].

pub mod alignment;
pub mod backend;
pub mod cascade;
pub mod config;
pub mod detector;
pub mod embedding;
pub mod geometry;
pub mod heuristic;
pub mod liveness;
pub mod models;
pub mod onnx;
pub mod pipeline;
pub mod raster;
pub mod service;
pub mod types;
pub mod verification;

pub use backend::{FnBackend, InferenceBackend, InferenceError, OutputInfo, TensorLayout, TensorShape};
pub use cascade::{CascadeConfig, CascadeDetector};
pub use config::{ConfigError, LoadPolicy, PipelineConfig};
pub use detector::{Detection, DetectorChain, DetectorKind, FaceDetector};
pub use embedding::{ContentAwareMockExtractor, EmbeddingConfig, EmbeddingError, FaceEmbedder, NetworkExtractor};
pub use geometry::{Point, Rect};
pub use heuristic::{HeuristicConfig, HeuristicDetector, HeuristicMode};
pub use models::{default_model_dir, ModelBundle, ModelConfig, ModelKind, ModelLoadError, ModelLoader};
pub use pipeline::{FaceAnalysis, FacePipeline, PipelineError, PipelineStatus};
pub use raster::{ImageBuffer, ImageError};
pub use service::FaceService;
pub use types::{
    Embedding, EmbeddingSource, FaceBox, LandmarkId, Landmarks, SimilarityScale, Strategy, VerificationMode,
    VerificationResult,
};
pub use verification::{VerificationConfig, VerificationEngine, VerificationError};
