//! Configuration system for amem.

mod env_parser;
mod loader;
mod overrides;
mod paths;
mod validation;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::Error;
use crate::index::DistanceMetric;
use crate::llm::{LlmBackend, LlmConfig};

pub use loader::{ConfigFile, LlmFile};
pub use validation::ConfigValidator;

/// How `add_note` relates to enrichment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentMode {
    /// `add_note` returns once the note is stored and indexed.
    #[default]
    Background,
    /// `add_note` returns after enrichment settled.
    Inline,
}

impl std::str::FromStr for EnrichmentMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "background" => Ok(EnrichmentMode::Background),
            "inline" => Ok(EnrichmentMode::Inline),
            other => Err(Error::Config(format!(
                "unknown enrichment mode '{other}' (expected 'background' or 'inline')"
            ))),
        }
    }
}

/// Configuration values with priority: defaults < config file < env vars.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database.
    pub database_path: PathBuf,

    /// Index snapshot file. `None` keeps the index in memory only and
    /// rebuilds it from the store on open.
    pub index_path: Option<PathBuf>,

    /// HuggingFace embedding model identifier.
    pub embedding_model: String,

    /// Directory for caching ONNX models.
    pub model_cache: PathBuf,

    /// Fixed at store creation.
    pub distance_metric: DistanceMetric,

    pub llm: LlmConfig,

    pub llm_timeout_secs: u64,
    pub embed_timeout_secs: u64,

    /// Language-model calls per enrichment, including the first.
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,

    /// Minimum similarity for a note to be offered as a link candidate.
    pub link_similarity_threshold: f64,

    /// Search results below this similarity are dropped (0.0 disables).
    pub search_similarity_floor: f64,

    pub link_candidates: usize,

    /// Maximum number of enrichment tasks talking to the model at once.
    pub enrichment_concurrency: usize,

    pub enrichment_mode: EnrichmentMode,
}

impl Default for Config {
    fn default() -> Self {
        // Use home directory with sensible fallback for systems without HOME
        let home = dirs::home_dir().unwrap_or_else(|| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("."))
        });
        let amem_dir = home.join(".amem");

        Self {
            database_path: amem_dir.join("notes.db"),
            index_path: Some(amem_dir.join("index.json")),
            embedding_model: "BAAI/bge-small-en-v1.5".to_string(),
            model_cache: amem_dir.join("models"),
            distance_metric: DistanceMetric::Cosine,
            llm: LlmConfig::default(),
            llm_timeout_secs: 30,
            embed_timeout_secs: 30,
            max_attempts: 3,
            retry_base_delay_ms: 500,
            link_similarity_threshold: 0.5,
            search_similarity_floor: 0.0,
            link_candidates: 3,
            enrichment_concurrency: 4,
            enrichment_mode: EnrichmentMode::Background,
        }
    }
}

impl Config {
    /// Load configuration with defaults, file values, and environment overrides.
    pub fn load() -> Result<Self, Error> {
        Self::load_with(loader::default_config_path().as_deref(), |name| {
            std::env::var(name).ok()
        })
    }

    /// Like [`Config::load`], reading the TOML file at `path` instead of the
    /// default location.
    pub fn load_from(path: &Path) -> Result<Self, Error> {
        Self::load_with(Some(path), |name| std::env::var(name).ok())
    }

    fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match path {
            Some(path) => loader::load_from_path(path)?.unwrap_or_default(),
            None => ConfigFile::default(),
        };
        let env = env_parser::env_layer(&lookup)?;

        let mut config = Config::default();
        let llm = overrides::apply_layer(&mut config, file.overlay(env));
        config.llm = overrides::resolve_llm(llm);

        config.validate()?;

        Ok(config)
    }

    /// Defaults with every file placed under `dir`; convenient for tests
    /// and embedded hosts.
    pub fn in_directory(dir: &Path) -> Self {
        Self {
            database_path: dir.join("notes.db"),
            index_path: Some(dir.join("index.json")),
            model_cache: dir.join("models"),
            ..Self::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), Error> {
        ConfigValidator::new(self).validate()
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }

    /// Ensure parent directories for database, index and cache paths exist.
    pub fn ensure_directories(&self) -> Result<(), Error> {
        let parents = [Some(self.database_path.as_path()), self.index_path.as_deref()];
        for parent in parents.into_iter().flatten().filter_map(Path::parent) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Config(format!(
                        "Failed to create directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        if !self.model_cache.as_os_str().is_empty() {
            std::fs::create_dir_all(&self.model_cache).map_err(|e| {
                Error::Config(format!(
                    "Failed to create model cache directory {}: {e}",
                    self.model_cache.display()
                ))
            })?;
        }

        Ok(())
    }
}

impl LlmBackend {
    /// Backend used when none is configured.
    fn inferred(has_api_key: bool) -> Self {
        if has_api_key {
            LlmBackend::OpenAi
        } else {
            LlmBackend::Ollama
        }
    }
}
