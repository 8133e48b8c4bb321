//! End-to-end face pipeline: decode, detect, embed, verify.
//!
//! [`FacePipeline::new`] resolves which [`Strategy`] can actually run given
//! the models that loaded, and records why it had to degrade when the
//! configured one could not.

use crate::backend::InferenceError;
use crate::cascade::CascadeDetector;
use crate::config::PipelineConfig;
use crate::detector::{Detection, DetectorChain, DetectorKind, FaceDetector};
use crate::embedding::{ContentAwareMockExtractor, EmbeddingError, FaceEmbedder, NetworkExtractor};
use crate::heuristic::{HeuristicDetector, HeuristicMode};
use crate::liveness::{LivenessChecker, LivenessScore};
use crate::models::{ModelBundle, ModelFailure, ModelKind, ModelLoadError};
use crate::raster::{ImageBuffer, ImageError};
use crate::types::{Embedding, FaceBox, SimilarityScale, Strategy, VerificationMode, VerificationResult};
use crate::verification::{VerificationEngine, VerificationError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] ImageError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    DimensionMismatch(#[from] VerificationError),
    #[error("embedding failed: {0}")]
    Embedding(EmbeddingError),
}

impl From<EmbeddingError> for PipelineError {
    fn from(e: EmbeddingError) -> Self {
        match e {
            EmbeddingError::Inference(e) => PipelineError::Inference(e),
            other => PipelineError::Embedding(other),
        }
    }
}

/// The best face in an image and everything derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceAnalysis {
    pub face: FaceBox,
    pub detector: DetectorKind,
    pub face_count: usize,
    pub embedding: Embedding,
    pub liveness: Option<LivenessScore>,
}

/// What the pipeline is running and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub configured_strategy: Strategy,
    pub effective_strategy: Strategy,
    /// Why the effective strategy differs from the configured one.
    pub degraded_reason: Option<String>,
    pub detectors: Vec<DetectorKind>,
    pub cascade_only: bool,
    pub models_loaded: Vec<ModelKind>,
    pub model_failures: Vec<ModelFailure>,
    pub embedding_dimension: Option<usize>,
    pub mode: VerificationMode,
    pub threshold: f32,
    pub liveness: bool,
}

pub struct FacePipeline {
    chain: DetectorChain,
    embedder: Box<dyn FaceEmbedder>,
    liveness: Option<LivenessChecker>,
    engine: VerificationEngine,
    status: PipelineStatus,
}

impl FacePipeline {
    /// Build the pipeline from whatever `models` provides. `None` means no
    /// models at all, which leaves the heuristic detector and mock embedder.
    ///
    /// Fails only when `cascade_only` is set and the cascade is unavailable.
    pub fn new(config: &PipelineConfig, models: Option<&ModelBundle>) -> Result<Self, PipelineError> {
        let empty = ModelBundle::new();
        let bundle = models.unwrap_or(&empty);
        let configured = config.strategy;

        let cascade = match Self::build_cascade(config, bundle) {
            Ok(c) => Some(c),
            Err(e) if config.cascade_only => return Err(e),
            Err(e) => {
                if configured == Strategy::CascadeAndNetEmbedding {
                    tracing::warn!(error = %e, "cascade detector unavailable");
                }
                None
            }
        };

        let network_embedder = if configured.uses_network_embedding() {
            match Self::build_embedder(config, bundle) {
                Ok(e) => Some(e),
                Err(e) => {
                    tracing::warn!(error = %e, "embedding network unavailable");
                    return Self::assemble(
                        config,
                        bundle,
                        cascade,
                        None,
                        Some(format!("embedding network unavailable ({e}), using content-aware mock embeddings")),
                    );
                }
            }
        } else {
            None
        };

        let degraded = match (configured, &cascade) {
            (Strategy::CascadeAndNetEmbedding, None) => {
                Some("cascade models unavailable, using heuristic detection".to_string())
            }
            (Strategy::HeuristicAndNetEmbedding, Some(_)) if config.cascade_only => {
                Some("cascade_only is set, using cascade detection instead of heuristic".to_string())
            }
            _ => None,
        };
        Self::assemble(config, bundle, cascade, network_embedder, degraded)
    }

    fn build_cascade(config: &PipelineConfig, bundle: &ModelBundle) -> Result<CascadeDetector, PipelineError> {
        let pnet = bundle.require(ModelKind::Proposal)?;
        let rnet = bundle.require(ModelKind::Refine)?;
        let onet = bundle.require(ModelKind::Output)?;
        Ok(CascadeDetector::new(pnet, rnet, onet, config.cascade.clone())?)
    }

    fn build_embedder(config: &PipelineConfig, bundle: &ModelBundle) -> Result<NetworkExtractor, PipelineError> {
        let net = bundle.require(ModelKind::Embedding)?;
        Ok(NetworkExtractor::new(net, config.embedding.clone())?)
    }

    fn assemble(
        config: &PipelineConfig,
        bundle: &ModelBundle,
        cascade: Option<CascadeDetector>,
        network_embedder: Option<NetworkExtractor>,
        degraded: Option<String>,
    ) -> Result<Self, PipelineError> {
        let effective = match (&network_embedder, &cascade, config.strategy) {
            (None, _, _) => Strategy::ContentAwareMockEmbedding,
            (Some(_), Some(_), Strategy::CascadeAndNetEmbedding) => Strategy::CascadeAndNetEmbedding,
            // The heuristic is off the table, so the cascade detects.
            (Some(_), Some(_), _) if config.cascade_only => Strategy::CascadeAndNetEmbedding,
            (Some(_), _, _) => Strategy::HeuristicAndNetEmbedding,
        };

        let mut detectors: Vec<Box<dyn FaceDetector>> = Vec::new();
        if let Some(cascade) = cascade {
            if effective != Strategy::HeuristicAndNetEmbedding {
                detectors.push(Box::new(cascade));
            }
        }
        if !config.cascade_only {
            let heuristic = &config.heuristic;
            detectors.push(Box::new(HeuristicDetector::new(heuristic.mode, heuristic.clone())));
            if heuristic.mode == HeuristicMode::Advanced && heuristic.simple_fallback {
                detectors.push(Box::new(HeuristicDetector::new(HeuristicMode::Simple, heuristic.clone())));
            }
        }
        if detectors.is_empty() {
            return Err(ModelLoadError::Missing {
                kind: ModelKind::Proposal,
                reason: "cascade_only is set but no cascade detector could be built".to_string(),
            }
            .into());
        }
        let chain = DetectorChain::new(detectors);

        let embedder: Box<dyn FaceEmbedder> = match network_embedder {
            Some(e) => Box::new(e),
            None => Box::new(ContentAwareMockExtractor::new(&config.embedding)),
        };

        let liveness = bundle.get(ModelKind::AntiSpoof).and_then(|net| {
            LivenessChecker::new(net.clone(), config.liveness.clone())
                .map_err(|e| tracing::warn!(error = %e, "anti-spoof model unusable, liveness disabled"))
                .ok()
        });

        let scale = config.verification.scale.unwrap_or(if effective.uses_network_embedding() {
            SimilarityScale::Cosine
        } else {
            SimilarityScale::UnitInterval
        });
        let mode = VerificationMode {
            strategy: effective,
            scale,
        };
        let threshold = config.verification.threshold.unwrap_or(scale.default_threshold());
        let engine = VerificationEngine::new(mode, threshold);

        let status = PipelineStatus {
            configured_strategy: config.strategy,
            effective_strategy: effective,
            degraded_reason: degraded,
            detectors: chain.kinds(),
            cascade_only: config.cascade_only,
            models_loaded: bundle.loaded(),
            model_failures: bundle.failures().to_vec(),
            embedding_dimension: embedder.dimension(),
            mode,
            threshold,
            liveness: liveness.is_some(),
        };

        match &status.degraded_reason {
            Some(reason) => tracing::warn!(
                configured = %status.configured_strategy,
                effective = %status.effective_strategy,
                reason = %reason,
                "pipeline degraded"
            ),
            None => tracing::info!(
                strategy = %status.effective_strategy,
                detectors = ?status.detectors,
                ?scale,
                threshold,
                "pipeline ready"
            ),
        }

        Ok(Self {
            chain,
            embedder,
            liveness,
            engine,
            status,
        })
    }

    pub fn status(&self) -> &PipelineStatus {
        &self.status
    }

    pub fn engine(&self) -> &VerificationEngine {
        &self.engine
    }

    pub fn detect(&self, image: &ImageBuffer) -> Result<Detection, PipelineError> {
        Ok(self.chain.detect(image)?)
    }

    pub fn detect_bytes(&self, bytes: &[u8]) -> Result<Detection, PipelineError> {
        self.detect(&ImageBuffer::decode(bytes)?)
    }

    /// Detect, pick the best face and embed it.
    pub fn analyze(&self, image: &ImageBuffer) -> Result<FaceAnalysis, PipelineError> {
        let detection = self.detect(image)?;
        let (face, detector) = match (detection.best(), detection.detector) {
            (Some(face), Some(detector)) => (face.clone(), detector),
            _ => return Err(PipelineError::NoFaceDetected),
        };
        tracing::debug!(
            ?detector,
            confidence = face.confidence,
            faces = detection.faces.len(),
            "best face selected"
        );

        let embedding = self.embedder.embed(image, &face)?;

        let liveness = match &self.liveness {
            Some(checker) => checker.check(image, &face).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "liveness check failed");
                None
            }),
            None => None,
        };

        Ok(FaceAnalysis {
            face,
            detector,
            face_count: detection.faces.len(),
            embedding,
            liveness,
        })
    }

    pub fn analyze_bytes(&self, bytes: &[u8]) -> Result<FaceAnalysis, PipelineError> {
        self.analyze(&ImageBuffer::decode(bytes)?)
    }

    pub fn embed(&self, image: &ImageBuffer) -> Result<Embedding, PipelineError> {
        Ok(self.analyze(image)?.embedding)
    }

    pub fn compare_embeddings(
        &self,
        a: &Embedding,
        b: &Embedding,
        threshold: Option<f32>,
    ) -> Result<VerificationResult, PipelineError> {
        let threshold = threshold.unwrap_or(self.engine.threshold());
        Ok(self.engine.verify_with_threshold(a, b, threshold)?)
    }

    /// Embed the best face of each image and verify them against each other.
    pub fn compare(
        &self,
        a: &ImageBuffer,
        b: &ImageBuffer,
        threshold: Option<f32>,
    ) -> Result<VerificationResult, PipelineError> {
        let ea = self.embed(a)?;
        let eb = self.embed(b)?;
        self.compare_embeddings(&ea, &eb, threshold)
    }

    pub fn compare_bytes(&self, a: &[u8], b: &[u8], threshold: Option<f32>) -> Result<VerificationResult, PipelineError> {
        self.compare(&ImageBuffer::decode(a)?, &ImageBuffer::decode(b)?, threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FnBackend, InferenceBackend, OutputInfo, TensorShape};
    use ndarray::{ArrayD, IxDyn};
    use std::sync::Arc;

    fn embedding_net() -> Arc<dyn InferenceBackend> {
        Arc::new(FnBackend::new(
            "mobilefacenet",
            TensorShape::fixed(&[1, 3, 112, 112]),
            vec![OutputInfo::new("embedding", TensorShape::fixed(&[1, 128]))],
            |input| {
                let mean = input.mean().unwrap_or(0.0);
                let values = (0..128).map(|i| 1.0 + mean * i as f32 / 128.0).collect();
                Ok(vec![ArrayD::from_shape_vec(IxDyn(&[1, 128]), values).unwrap()])
            },
        ))
    }

    /// Cascade nets that never see a face.
    fn cascade_bundle() -> ModelBundle {
        let pnet: Arc<dyn InferenceBackend> = Arc::new(FnBackend::new(
            "pnet",
            TensorShape::new(vec![Some(1), Some(3), None, None]),
            vec![
                OutputInfo::new("prob1", TensorShape::from_onnx(&[1, 2, -1, -1])),
                OutputInfo::new("conv4-2", TensorShape::from_onnx(&[1, 4, -1, -1])),
            ],
            |input| {
                let (gh, gw) = ((input.shape()[2] - 12) / 2 + 1, (input.shape()[3] - 12) / 2 + 1);
                let prob = ArrayD::from_shape_fn(IxDyn(&[1, 2, gh, gw]), |ix| if ix[1] == 0 { 1.0 } else { 0.0 });
                Ok(vec![prob, ArrayD::zeros(IxDyn(&[1, 4, gh, gw]))])
            },
        ));
        let crop = |name: &str, size: usize| -> Arc<dyn InferenceBackend> {
            Arc::new(FnBackend::new(
                name,
                TensorShape::fixed(&[1, 3, size, size]),
                vec![
                    OutputInfo::new("prob1", TensorShape::fixed(&[1, 2])),
                    OutputInfo::new("bbox", TensorShape::fixed(&[1, 4])),
                    OutputInfo::new("landmark", TensorShape::fixed(&[1, 10])),
                ],
                |_| {
                    Ok(vec![
                        ArrayD::from_shape_vec(IxDyn(&[1, 2]), vec![1.0, 0.0]).unwrap(),
                        ArrayD::zeros(IxDyn(&[1, 4])),
                        ArrayD::zeros(IxDyn(&[1, 10])),
                    ])
                },
            ))
        };
        ModelBundle::new()
            .with(ModelKind::Proposal, pnet)
            .with(ModelKind::Refine, crop("rnet", 24))
            .with(ModelKind::Output, crop("onet", 48))
            .with(ModelKind::Embedding, embedding_net())
    }

    fn portrait() -> ImageBuffer {
        ImageBuffer::filled(480, 640, [90, 90, 90]).unwrap()
    }

    #[test]
    fn test_no_models_degrades_to_mock() {
        let pipeline = FacePipeline::new(&PipelineConfig::default(), None).unwrap();
        let status = pipeline.status();
        assert_eq!(status.configured_strategy, Strategy::CascadeAndNetEmbedding);
        assert_eq!(status.effective_strategy, Strategy::ContentAwareMockEmbedding);
        assert!(status.degraded_reason.is_some());
        assert_eq!(
            status.detectors,
            vec![DetectorKind::HeuristicAdvanced, DetectorKind::HeuristicSimple]
        );
        assert_eq!(status.mode.scale, SimilarityScale::UnitInterval);
        assert_eq!(status.threshold, 0.75);
        assert_eq!(status.embedding_dimension, Some(128));
    }

    #[test]
    fn test_embedding_only_uses_heuristic_with_network() {
        let bundle = ModelBundle::new().with(ModelKind::Embedding, embedding_net());
        let pipeline = FacePipeline::new(&PipelineConfig::default(), Some(&bundle)).unwrap();
        let status = pipeline.status();
        assert_eq!(status.effective_strategy, Strategy::HeuristicAndNetEmbedding);
        assert_eq!(status.mode.scale, SimilarityScale::Cosine);
        assert_eq!(status.threshold, 0.5);
        assert!(status.degraded_reason.as_deref().unwrap().contains("cascade"));
    }

    #[test]
    fn test_mock_strategy_is_not_degraded() {
        let config = PipelineConfig {
            strategy: Strategy::ContentAwareMockEmbedding,
            ..PipelineConfig::default()
        };
        let bundle = ModelBundle::new().with(ModelKind::Embedding, embedding_net());
        let pipeline = FacePipeline::new(&config, Some(&bundle)).unwrap();
        assert_eq!(pipeline.status().effective_strategy, Strategy::ContentAwareMockEmbedding);
        assert_eq!(pipeline.status().degraded_reason, None);
    }

    #[test]
    fn test_cascade_only_without_models_fails() {
        let config = PipelineConfig {
            cascade_only: true,
            ..PipelineConfig::default()
        };
        let err = FacePipeline::new(&config, None).err().unwrap();
        assert!(matches!(err, PipelineError::ModelLoad(ModelLoadError::Missing { kind: ModelKind::Proposal, .. })));
    }

    #[test]
    fn test_cascade_only_overrides_heuristic_strategy() {
        let config = PipelineConfig {
            strategy: Strategy::HeuristicAndNetEmbedding,
            cascade_only: true,
            ..PipelineConfig::default()
        };
        let pipeline = FacePipeline::new(&config, Some(&cascade_bundle())).unwrap();
        let status = pipeline.status();
        assert_eq!(status.detectors, vec![DetectorKind::Cascade]);
        assert_eq!(status.effective_strategy, Strategy::CascadeAndNetEmbedding);
        assert!(status.degraded_reason.as_deref().unwrap().contains("cascade_only"));
    }

    #[test]
    fn test_heuristic_strategy_skips_loaded_cascade() {
        let config = PipelineConfig {
            strategy: Strategy::HeuristicAndNetEmbedding,
            ..PipelineConfig::default()
        };
        let pipeline = FacePipeline::new(&config, Some(&cascade_bundle())).unwrap();
        let status = pipeline.status();
        assert_eq!(status.effective_strategy, Strategy::HeuristicAndNetEmbedding);
        assert!(!status.detectors.contains(&DetectorKind::Cascade));
        assert_eq!(status.degraded_reason, None);
    }

    #[test]
    fn test_explicit_verification_config_wins() {
        let mut config = PipelineConfig::default();
        config.verification.scale = Some(SimilarityScale::Cosine);
        config.verification.threshold = Some(0.6);
        let pipeline = FacePipeline::new(&config, None).unwrap();
        assert_eq!(pipeline.status().mode.scale, SimilarityScale::Cosine);
        assert_eq!(pipeline.status().threshold, 0.6);
    }

    #[test]
    fn test_analyze_portrait_with_simple_fallback() {
        let bundle = ModelBundle::new().with(ModelKind::Embedding, embedding_net());
        let pipeline = FacePipeline::new(&PipelineConfig::default(), Some(&bundle)).unwrap();
        let analysis = pipeline.analyze(&portrait()).unwrap();
        assert_eq!(analysis.detector, DetectorKind::HeuristicSimple);
        assert_eq!(analysis.embedding.dimension(), 128);
        assert!(!analysis.embedding.is_mock());
        assert!(analysis.liveness.is_none());
    }

    #[test]
    fn test_landscape_flat_image_has_no_face() {
        let pipeline = FacePipeline::new(&PipelineConfig::default(), None).unwrap();
        let flat = ImageBuffer::filled(640, 480, [90, 90, 90]).unwrap();
        assert!(matches!(pipeline.analyze(&flat), Err(PipelineError::NoFaceDetected)));
    }

    #[test]
    fn test_undecodable_bytes() {
        let pipeline = FacePipeline::new(&PipelineConfig::default(), None).unwrap();
        assert!(matches!(pipeline.analyze_bytes(b"not an image"), Err(PipelineError::Decode(_))));
    }

    #[test]
    fn test_compare_self_is_match() {
        let bundle = ModelBundle::new().with(ModelKind::Embedding, embedding_net());
        let pipeline = FacePipeline::new(&PipelineConfig::default(), Some(&bundle)).unwrap();
        let img = portrait();
        let result = pipeline.compare(&img, &img, None).unwrap();
        assert!(result.matched);
        assert!((result.similarity - 1.0).abs() < 1e-5);
        assert!(!result.mock);
        assert_eq!(result.mode.strategy, Strategy::HeuristicAndNetEmbedding);
    }

    #[test]
    fn test_embedding_error_mapping() {
        let e: PipelineError = EmbeddingError::ZeroNorm.into();
        assert!(matches!(e, PipelineError::Embedding(EmbeddingError::ZeroNorm)));
        let e: PipelineError = EmbeddingError::Inference(InferenceError::InferenceFailed("x".into())).into();
        assert!(matches!(e, PipelineError::Inference(_)));
    }
}
