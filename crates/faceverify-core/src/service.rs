//! Shared, cheaply cloneable handle to the face pipeline.
//!
//! Construct one [`FaceService`] at startup and pass clones to every call
//! site. Models are loaded once; compute runs on the blocking pool so
//! async callers are never stalled by tensor math.

use crate::backend::InferenceError;
use crate::config::{LoadPolicy, PipelineConfig};
use crate::detector::Detection;
use crate::models::ModelLoader;
use crate::pipeline::{FaceAnalysis, FacePipeline, PipelineError, PipelineStatus};
use crate::types::VerificationResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

struct Inner {
    config: PipelineConfig,
    loader: ModelLoader,
    full: OnceCell<Arc<FacePipeline>>,
    fallback: OnceCell<Arc<FacePipeline>>,
    /// Set while a fail-fast background load is in flight.
    loading: AtomicBool,
}

/// Clone-safe handle to the loaded pipeline.
#[derive(Clone)]
pub struct FaceService {
    inner: Arc<Inner>,
}

impl FaceService {
    /// Service that loads ONNX models from `config.models`.
    pub fn new(config: PipelineConfig) -> Self {
        let loader = ModelLoader::new(config.models.clone());
        Self::with_loader(config, loader)
    }

    /// Service with a custom model loader.
    pub fn with_loader(config: PipelineConfig, loader: ModelLoader) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                loader,
                full: OnceCell::new(),
                fallback: OnceCell::new(),
                loading: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.loader.is_loaded()
    }

    /// Load models now and build the full pipeline.
    pub async fn warm_up(&self) -> Result<PipelineStatus, PipelineError> {
        Ok(self.full_pipeline().await?.status().clone())
    }

    async fn full_pipeline(&self) -> Result<Arc<FacePipeline>, PipelineError> {
        let inner = &self.inner;
        inner
            .full
            .get_or_try_init(|| async {
                let bundle = inner.loader.load().await?;
                Ok::<_, PipelineError>(Arc::new(FacePipeline::new(&inner.config, Some(&bundle))?))
            })
            .await
            .cloned()
    }

    fn fallback_pipeline(&self) -> Result<Arc<FacePipeline>, PipelineError> {
        let inner = &self.inner;
        if let Some(p) = inner.fallback.get() {
            return Ok(p.clone());
        }
        let pipeline = Arc::new(FacePipeline::new(&inner.config, None)?);
        // A concurrent caller may have won the race; either copy is equivalent.
        let _ = inner.fallback.set(pipeline.clone());
        Ok(pipeline)
    }

    /// Pipeline for the next request, according to the load policy.
    async fn pipeline(&self) -> Result<Arc<FacePipeline>, PipelineError> {
        match self.inner.config.load_policy {
            LoadPolicy::Await => self.full_pipeline().await,
            LoadPolicy::FailFast => {
                if self.inner.loader.is_loaded() {
                    return self.full_pipeline().await;
                }
                if !self.inner.loading.swap(true, Ordering::AcqRel) {
                    let background = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = background.full_pipeline().await {
                            tracing::warn!(error = %e, "background model load failed");
                        }
                        background.inner.loading.store(false, Ordering::Release);
                    });
                }
                tracing::debug!("models still loading, serving from model-free pipeline");
                self.fallback_pipeline()
            }
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(&FacePipeline) -> Result<T, PipelineError> + Send + 'static,
    {
        let pipeline = self.pipeline().await?;
        tokio::task::spawn_blocking(move || f(&pipeline))
            .await
            .map_err(|e| PipelineError::Inference(InferenceError::InferenceFailed(format!("pipeline task failed: {e}"))))?
    }

    pub async fn status(&self) -> Result<PipelineStatus, PipelineError> {
        Ok(self.pipeline().await?.status().clone())
    }

    pub async fn detect(&self, image: Vec<u8>) -> Result<Detection, PipelineError> {
        self.run(move |p| p.detect_bytes(&image)).await
    }

    pub async fn analyze(&self, image: Vec<u8>) -> Result<FaceAnalysis, PipelineError> {
        self.run(move |p| p.analyze_bytes(&image)).await
    }

    pub async fn compare(&self, a: Vec<u8>, b: Vec<u8>, threshold: Option<f32>) -> Result<VerificationResult, PipelineError> {
        self.run(move |p| p.compare_bytes(&a, &b, threshold)).await
    }
}
