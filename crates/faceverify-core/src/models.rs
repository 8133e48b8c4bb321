//! Model discovery and one-time asynchronous loading.

use crate::backend::{InferenceBackend, InferenceError};
use crate::onnx::OnnxBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

/// The five independently loadable networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Proposal,
    Refine,
    Output,
    Embedding,
    AntiSpoof,
}

impl ModelKind {
    pub const ALL: [ModelKind; 5] = [
        ModelKind::Proposal,
        ModelKind::Refine,
        ModelKind::Output,
        ModelKind::Embedding,
        ModelKind::AntiSpoof,
    ];

    /// Only the anti-spoofing net may be absent without degrading the pipeline.
    pub fn is_optional(self) -> bool {
        matches!(self, ModelKind::AntiSpoof)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Proposal => "proposal",
            ModelKind::Refine => "refine",
            ModelKind::Output => "output",
            ModelKind::Embedding => "embedding",
            ModelKind::AntiSpoof => "anti_spoof",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("{kind} model unavailable: {reason}")]
    Missing { kind: ModelKind, reason: String },
    #[error("model loading task failed: {0}")]
    Task(String),
}

/// Default model directory: `$FACEVERIFY_MODEL_DIR`, then
/// `$XDG_DATA_HOME/faceverify/models`, then `~/.local/share/faceverify/models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FACEVERIFY_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceverify/models")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub dir: PathBuf,
    pub pnet: String,
    pub rnet: String,
    pub onet: String,
    pub embedding: String,
    pub antispoof: String,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dir: default_model_dir(),
            pnet: "pnet.onnx".to_string(),
            rnet: "rnet.onnx".to_string(),
            onet: "onet.onnx".to_string(),
            embedding: "mobilefacenet.onnx".to_string(),
            antispoof: "antispoof.onnx".to_string(),
            intra_threads: 2,
        }
    }
}

impl ModelConfig {
    pub fn file_name(&self, kind: ModelKind) -> &str {
        match kind {
            ModelKind::Proposal => &self.pnet,
            ModelKind::Refine => &self.rnet,
            ModelKind::Output => &self.onet,
            ModelKind::Embedding => &self.embedding,
            ModelKind::AntiSpoof => &self.antispoof,
        }
    }

    pub fn path(&self, kind: ModelKind) -> PathBuf {
        self.dir.join(self.file_name(kind))
    }
}

/// A model that failed to load, kept for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFailure {
    pub kind: ModelKind,
    pub error: String,
}

/// Whatever loaded successfully, plus what didn't.
#[derive(Clone, Default)]
pub struct ModelBundle {
    pnet: Option<Arc<dyn InferenceBackend>>,
    rnet: Option<Arc<dyn InferenceBackend>>,
    onet: Option<Arc<dyn InferenceBackend>>,
    embedding: Option<Arc<dyn InferenceBackend>>,
    antispoof: Option<Arc<dyn InferenceBackend>>,
    failures: Vec<ModelFailure>,
}

impl ModelBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mainly for custom runtimes and tests.
    pub fn with(mut self, kind: ModelKind, net: Arc<dyn InferenceBackend>) -> Self {
        *self.slot_mut(kind) = Some(net);
        self
    }

    fn slot_mut(&mut self, kind: ModelKind) -> &mut Option<Arc<dyn InferenceBackend>> {
        match kind {
            ModelKind::Proposal => &mut self.pnet,
            ModelKind::Refine => &mut self.rnet,
            ModelKind::Output => &mut self.onet,
            ModelKind::Embedding => &mut self.embedding,
            ModelKind::AntiSpoof => &mut self.antispoof,
        }
    }

    pub fn get(&self, kind: ModelKind) -> Option<&Arc<dyn InferenceBackend>> {
        match kind {
            ModelKind::Proposal => self.pnet.as_ref(),
            ModelKind::Refine => self.rnet.as_ref(),
            ModelKind::Output => self.onet.as_ref(),
            ModelKind::Embedding => self.embedding.as_ref(),
            ModelKind::AntiSpoof => self.antispoof.as_ref(),
        }
    }

    /// The model, or the reason it is unavailable.
    pub fn require(&self, kind: ModelKind) -> Result<Arc<dyn InferenceBackend>, ModelLoadError> {
        self.get(kind).cloned().ok_or_else(|| ModelLoadError::Missing {
            kind,
            reason: self
                .failures
                .iter()
                .find(|f| f.kind == kind)
                .map(|f| f.error.clone())
                .unwrap_or_else(|| "not loaded".to_string()),
        })
    }

    pub fn loaded(&self) -> Vec<ModelKind> {
        ModelKind::ALL.into_iter().filter(|&k| self.get(k).is_some()).collect()
    }

    pub fn failures(&self) -> &[ModelFailure] {
        &self.failures
    }

    /// All mandatory models are present.
    pub fn is_complete(&self) -> bool {
        ModelKind::ALL
            .into_iter()
            .all(|k| k.is_optional() || self.get(k).is_some())
    }
}

impl fmt::Debug for ModelBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelBundle")
            .field("loaded", &self.loaded())
            .field("failures", &self.failures)
            .finish()
    }
}

type Opener = dyn Fn(ModelKind, &Path, usize) -> Result<Arc<dyn InferenceBackend>, InferenceError> + Send + Sync;

/// Loads every model exactly once and hands out the shared bundle.
///
/// Individual model failures are recorded in the bundle rather than
/// failing the load. If the future returned by [`load`](Self::load) is
/// dropped before it completes, the loader stays unloaded and the next
/// call starts over.
pub struct ModelLoader {
    config: ModelConfig,
    opener: Arc<Opener>,
    cell: OnceCell<Arc<ModelBundle>>,
}

impl ModelLoader {
    /// Loader that opens ONNX files from `config.dir`.
    pub fn new(config: ModelConfig) -> Self {
        Self::with_opener(config, |_, path, threads| {
            OnnxBackend::load(path, threads).map(|b| Arc::new(b) as Arc<dyn InferenceBackend>)
        })
    }

    /// Loader with a custom model opener.
    pub fn with_opener<F>(config: ModelConfig, opener: F) -> Self
    where
        F: Fn(ModelKind, &Path, usize) -> Result<Arc<dyn InferenceBackend>, InferenceError> + Send + Sync + 'static,
    {
        Self {
            config,
            opener: Arc::new(opener),
            cell: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Load all models, or return the bundle from an earlier load.
    pub async fn load(&self) -> Result<Arc<ModelBundle>, ModelLoadError> {
        self.cell.get_or_try_init(|| self.load_all()).await.cloned()
    }

    /// The bundle if loading has completed. Never waits.
    pub fn get(&self) -> Option<Arc<ModelBundle>> {
        self.cell.get().cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    async fn load_all(&self) -> Result<Arc<ModelBundle>, ModelLoadError> {
        tracing::info!(dir = %self.config.dir.display(), "loading models");

        let handles: Vec<_> = ModelKind::ALL
            .into_iter()
            .map(|kind| {
                let opener = Arc::clone(&self.opener);
                let path = self.config.path(kind);
                let threads = self.config.intra_threads;
                let handle = tokio::task::spawn_blocking(move || {
                    let result = (*opener)(kind, &path, threads);
                    (path, result)
                });
                (kind, handle)
            })
            .collect();

        let mut bundle = ModelBundle::new();
        for (kind, handle) in handles {
            let (path, result) = handle.await.map_err(|e| ModelLoadError::Task(e.to_string()))?;
            match result {
                Ok(net) => {
                    tracing::info!(
                        model = %kind,
                        path = %path.display(),
                        input = %net.input_shape(),
                        outputs = ?net.outputs().iter().map(|o| format!("{}{}", o.name, o.shape)).collect::<Vec<_>>(),
                        "model loaded"
                    );
                    *bundle.slot_mut(kind) = Some(net);
                }
                Err(e) if kind.is_optional() => {
                    tracing::warn!(model = %kind, path = %path.display(), error = %e, "optional model not loaded");
                    bundle.failures.push(ModelFailure {
                        kind,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(model = %kind, path = %path.display(), error = %e, "model failed to load");
                    bundle.failures.push(ModelFailure {
                        kind,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(loaded = ?bundle.loaded(), complete = bundle.is_complete(), "model loading finished");
        Ok(Arc::new(bundle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FnBackend, TensorShape};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn stub(kind: ModelKind) -> Arc<dyn InferenceBackend> {
        Arc::new(FnBackend::new(kind.as_str(), TensorShape::fixed(&[1, 3, 12, 12]), vec![], |_| Ok(vec![])))
    }

    fn config() -> ModelConfig {
        ModelConfig {
            dir: PathBuf::from("/models"),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_paths_and_defaults() {
        let cfg = config();
        assert_eq!(cfg.path(ModelKind::Proposal), PathBuf::from("/models/pnet.onnx"));
        assert_eq!(cfg.path(ModelKind::Embedding), PathBuf::from("/models/mobilefacenet.onnx"));
        assert!(ModelKind::AntiSpoof.is_optional());
        assert!(!ModelKind::Embedding.is_optional());
    }

    #[test]
    fn test_bundle_require_reports_reason() {
        let mut bundle = ModelBundle::new().with(ModelKind::Proposal, stub(ModelKind::Proposal));
        bundle.failures.push(ModelFailure {
            kind: ModelKind::Refine,
            error: "file not found".into(),
        });
        assert!(bundle.require(ModelKind::Proposal).is_ok());
        let err = bundle.require(ModelKind::Refine).err().unwrap();
        assert!(err.to_string().contains("file not found"), "{err}");
        assert!(!bundle.is_complete());
        assert_eq!(bundle.loaded(), vec![ModelKind::Proposal]);
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let loader = ModelLoader::with_opener(config(), move |kind, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(stub(kind))
        });

        assert!(!loader.is_loaded());
        assert!(loader.get().is_none());
        let first = loader.load().await.unwrap();
        let second = loader.load().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(first.is_complete());
        assert!(loader.get().is_some());
    }

    #[tokio::test]
    async fn test_optional_failure_is_recorded_not_fatal() {
        let loader = ModelLoader::with_opener(config(), |kind, path, _| {
            if kind == ModelKind::AntiSpoof {
                Err(InferenceError::ModelNotFound(path.display().to_string()))
            } else {
                Ok(stub(kind))
            }
        });
        let bundle = loader.load().await.unwrap();
        assert!(bundle.is_complete());
        assert!(bundle.get(ModelKind::AntiSpoof).is_none());
        assert_eq!(bundle.failures().len(), 1);
        assert_eq!(bundle.failures()[0].kind, ModelKind::AntiSpoof);
    }

    #[tokio::test]
    async fn test_missing_directory_degrades_instead_of_failing() {
        let loader = ModelLoader::new(ModelConfig {
            dir: PathBuf::from("/nonexistent/faceverify/models"),
            ..ModelConfig::default()
        });
        let bundle = loader.load().await.unwrap();
        assert!(bundle.loaded().is_empty());
        assert_eq!(bundle.failures().len(), 5);
        assert!(!bundle.is_complete());
    }

    #[tokio::test]
    async fn test_cancelled_load_is_retryable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let loader = ModelLoader::with_opener(config(), move |kind, _, _| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            // First round is slow enough to be cancelled.
            if n < 5 {
                std::thread::sleep(Duration::from_millis(200));
            }
            Ok(stub(kind))
        });

        let timed_out = tokio::time::timeout(Duration::from_millis(20), loader.load()).await;
        assert!(timed_out.is_err());
        assert!(!loader.is_loaded());

        let bundle = loader.load().await.unwrap();
        assert!(bundle.is_complete());
        assert!(loader.is_loaded());
    }
}
