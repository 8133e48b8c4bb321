//! Pipeline configuration, loadable from TOML.

use crate::cascade::CascadeConfig;
use crate::embedding::EmbeddingConfig;
use crate::heuristic::HeuristicConfig;
use crate::liveness::LivenessConfig;
use crate::models::ModelConfig;
use crate::types::Strategy;
use crate::verification::VerificationConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// What a request does when models are still loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPolicy {
    /// Wait for model loading to finish.
    #[default]
    Await,
    /// Serve from the model-free pipeline until loading completes.
    FailFast,
}

impl std::str::FromStr for LoadPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "await" | "wait" => Ok(LoadPolicy::Await),
            "fail_fast" | "failfast" => Ok(LoadPolicy::FailFast),
            other => Err(format!("unknown load policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub strategy: Strategy,
    /// Never fall back from the cascade to the heuristic detector.
    pub cascade_only: bool,
    pub load_policy: LoadPolicy,
    pub models: ModelConfig,
    pub cascade: CascadeConfig,
    pub heuristic: HeuristicConfig,
    pub embedding: EmbeddingConfig,
    pub verification: VerificationConfig,
    pub liveness: LivenessConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SimilarityScale;

    #[test]
    fn test_empty_toml_is_default() {
        let cfg = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.strategy, Strategy::CascadeAndNetEmbedding);
        assert_eq!(cfg.load_policy, LoadPolicy::Await);
        assert_eq!(cfg.cascade.min_face_size, 20.0);
        assert_eq!(cfg.embedding.dimension, None);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let cfg = PipelineConfig::from_toml_str(
            r#"
strategy = "content_aware_mock_embedding"
load_policy = "fail_fast"

[models]
dir = "/opt/models"
embedding = "mobilefacenet_512.onnx"

[cascade]
min_face_size = 12.0

[embedding]
dimension = 512

[verification]
scale = "unit_interval"
threshold = 0.8
"#,
        )
        .unwrap();

        assert_eq!(cfg.strategy, Strategy::ContentAwareMockEmbedding);
        assert_eq!(cfg.load_policy, LoadPolicy::FailFast);
        assert_eq!(cfg.models.dir, PathBuf::from("/opt/models"));
        assert_eq!(cfg.models.pnet, "pnet.onnx");
        assert_eq!(cfg.cascade.min_face_size, 12.0);
        assert_eq!(cfg.cascade.scale_factor, 0.709);
        assert_eq!(cfg.embedding.dimension, Some(512));
        assert_eq!(cfg.verification.scale, Some(SimilarityScale::UnitInterval));
        assert_eq!(cfg.verification.threshold, Some(0.8));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(matches!(
            PipelineConfig::from_toml_str("strategy = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = PipelineConfig::from_file(Path::new("/nonexistent/faceverify.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_policy_parse() {
        assert_eq!("fail-fast".parse::<LoadPolicy>().unwrap(), LoadPolicy::FailFast);
        assert!("later".parse::<LoadPolicy>().is_err());
    }
}
