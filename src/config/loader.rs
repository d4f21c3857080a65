//! Configuration file loading and parsing.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::EnrichmentMode;
use crate::errors::Error;
use crate::index::DistanceMetric;
use crate::llm::LlmBackend;

/// One configuration layer: every field is optional so layers can be stacked.
///
/// Deserialized from TOML; the environment layer is built from `AMEM_*`
/// variables into the same shape.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub database_path: Option<PathBuf>,
    /// An empty path disables the snapshot.
    pub index_path: Option<PathBuf>,
    pub embedding_model: Option<String>,
    pub model_cache: Option<PathBuf>,
    pub distance_metric: Option<DistanceMetric>,
    #[serde(default)]
    pub llm: LlmFile,
    pub llm_timeout_secs: Option<u64>,
    pub embed_timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub link_similarity_threshold: Option<f64>,
    pub search_similarity_floor: Option<f64>,
    pub link_candidates: Option<usize>,
    pub enrichment_concurrency: Option<usize>,
    pub enrichment_mode: Option<EnrichmentMode>,
}

/// `[llm]` table.
#[derive(Debug, Default, Deserialize)]
pub struct LlmFile {
    pub backend: Option<LlmBackend>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

/// `<config dir>/amem/config.toml`, if a config directory can be determined.
pub fn default_config_path() -> Option<PathBuf> {
    let config_dir = dirs::config_dir().or_else(|| dirs::home_dir().map(|h| h.join(".config")))?;
    Some(config_dir.join("amem/config.toml"))
}

/// Load configuration from a TOML file. A missing file is not an error.
pub fn load_from_path(config_path: &Path) -> Result<Option<ConfigFile>, Error> {
    if !config_path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(config_path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {e}",
            config_path.display()
        ))
    })?;

    let config: ConfigFile = toml::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {e}",
            config_path.display()
        ))
    })?;

    Ok(Some(config))
}
