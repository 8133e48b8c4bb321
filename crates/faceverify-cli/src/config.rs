use anyhow::{Context, Result};
use faceverify_core::{LoadPolicy, PipelineConfig, SimilarityScale, Strategy};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Command-line overrides, applied last.
#[derive(Debug, Default)]
pub struct Overrides {
    pub model_dir: Option<PathBuf>,
    pub strategy: Option<Strategy>,
    pub cascade_only: bool,
}

/// Build the pipeline configuration: TOML file (or defaults), then
/// `FACEVERIFY_*` environment variables, then command-line flags.
pub fn load(path: Option<&Path>, overrides: Overrides) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    apply_env(&mut config, |key| std::env::var(key).ok());

    if let Some(dir) = overrides.model_dir {
        config.models.dir = dir;
    }
    if let Some(strategy) = overrides.strategy {
        config.strategy = strategy;
    }
    if overrides.cascade_only {
        config.cascade_only = true;
    }
    Ok(config)
}

/// Layer environment overrides onto `config`. Unparseable values are
/// ignored with a warning.
fn apply_env(config: &mut PipelineConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(dir) = var("FACEVERIFY_MODEL_DIR") {
        config.models.dir = PathBuf::from(dir);
    }
    if let Some(v) = env_parse::<Strategy>(&var, "FACEVERIFY_STRATEGY") {
        config.strategy = v;
    }
    if let Some(v) = env_parse::<f32>(&var, "FACEVERIFY_THRESHOLD") {
        config.verification.threshold = Some(v);
    }
    if let Some(v) = env_parse::<usize>(&var, "FACEVERIFY_EMBEDDING_DIM") {
        config.embedding.dimension = Some(v);
    }
    if let Some(v) = env_parse::<SimilarityScale>(&var, "FACEVERIFY_SIMILARITY_SCALE") {
        config.verification.scale = Some(v);
    }
    if let Some(v) = var("FACEVERIFY_CASCADE_ONLY") {
        config.cascade_only = v != "0" && !v.eq_ignore_ascii_case("false");
    }
    if let Some(v) = env_parse::<LoadPolicy>(&var, "FACEVERIFY_LOAD_POLICY") {
        config.load_policy = v;
    }
}

fn env_parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid environment override");
            None
        }
    }
}
