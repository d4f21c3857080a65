//! Layer stacking: file values under environment values, applied onto defaults.

use secrecy::SecretString;

use super::Config;
use super::loader::{ConfigFile, LlmFile};
use super::paths;
use crate::llm::{LlmBackend, LlmConfig};

impl ConfigFile {
    /// Stack `higher` on top of `self`; fields set in `higher` win.
    pub fn overlay(self, higher: ConfigFile) -> ConfigFile {
        ConfigFile {
            database_path: higher.database_path.or(self.database_path),
            index_path: higher.index_path.or(self.index_path),
            embedding_model: higher.embedding_model.or(self.embedding_model),
            model_cache: higher.model_cache.or(self.model_cache),
            distance_metric: higher.distance_metric.or(self.distance_metric),
            llm: LlmFile {
                backend: higher.llm.backend.or(self.llm.backend),
                model: higher.llm.model.or(self.llm.model),
                api_key: higher.llm.api_key.or(self.llm.api_key),
                base_url: higher.llm.base_url.or(self.llm.base_url),
            },
            llm_timeout_secs: higher.llm_timeout_secs.or(self.llm_timeout_secs),
            embed_timeout_secs: higher.embed_timeout_secs.or(self.embed_timeout_secs),
            max_attempts: higher.max_attempts.or(self.max_attempts),
            retry_base_delay_ms: higher.retry_base_delay_ms.or(self.retry_base_delay_ms),
            link_similarity_threshold: higher
                .link_similarity_threshold
                .or(self.link_similarity_threshold),
            search_similarity_floor: higher
                .search_similarity_floor
                .or(self.search_similarity_floor),
            link_candidates: higher.link_candidates.or(self.link_candidates),
            enrichment_concurrency: higher
                .enrichment_concurrency
                .or(self.enrichment_concurrency),
            enrichment_mode: higher.enrichment_mode.or(self.enrichment_mode),
        }
    }
}

/// Copy every value present in `layer` onto `config`.
///
/// The `[llm]` table is returned unresolved: its defaults depend on which
/// values were supplied, see [`resolve_llm`].
pub fn apply_layer(config: &mut Config, layer: ConfigFile) -> LlmFile {
    if let Some(mut path) = layer.database_path {
        paths::expand_tilde(&mut path);
        config.database_path = path;
    }
    if let Some(mut path) = layer.index_path {
        paths::expand_tilde(&mut path);
        config.index_path = (!path.as_os_str().is_empty()).then_some(path);
    }
    if let Some(model) = layer.embedding_model {
        config.embedding_model = model;
    }
    if let Some(mut path) = layer.model_cache {
        paths::expand_tilde(&mut path);
        config.model_cache = path;
    }
    if let Some(metric) = layer.distance_metric {
        config.distance_metric = metric;
    }
    if let Some(secs) = layer.llm_timeout_secs {
        config.llm_timeout_secs = secs;
    }
    if let Some(secs) = layer.embed_timeout_secs {
        config.embed_timeout_secs = secs;
    }
    if let Some(attempts) = layer.max_attempts {
        config.max_attempts = attempts;
    }
    if let Some(ms) = layer.retry_base_delay_ms {
        config.retry_base_delay_ms = ms;
    }
    if let Some(threshold) = layer.link_similarity_threshold {
        config.link_similarity_threshold = threshold;
    }
    if let Some(floor) = layer.search_similarity_floor {
        config.search_similarity_floor = floor;
    }
    if let Some(candidates) = layer.link_candidates {
        config.link_candidates = candidates;
    }
    if let Some(concurrency) = layer.enrichment_concurrency {
        config.enrichment_concurrency = concurrency;
    }
    if let Some(mode) = layer.enrichment_mode {
        config.enrichment_mode = mode;
    }
    layer.llm
}

/// Fill in backend and model defaults.
///
/// Without an explicit backend, a credential selects OpenAI and its absence
/// selects Ollama. The model defaults per backend.
pub fn resolve_llm(llm: LlmFile) -> LlmConfig {
    let api_key = llm
        .api_key
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty());
    let backend = llm
        .backend
        .unwrap_or_else(|| LlmBackend::inferred(api_key.is_some()));
    let model = llm
        .model
        .map(|m| m.trim().to_string())
        .unwrap_or_else(|| backend.default_model().to_string());

    LlmConfig {
        backend,
        model,
        api_key: api_key.map(SecretString::new),
        base_url: llm.base_url.filter(|url| !url.trim().is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_overlay_prefers_higher_layer() {
        let file = ConfigFile {
            database_path: Some(PathBuf::from("/file/db")),
            max_attempts: Some(5),
            llm: LlmFile {
                model: Some("file-model".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let env = ConfigFile {
            max_attempts: Some(2),
            ..Default::default()
        };

        let merged = file.overlay(env);
        assert_eq!(merged.database_path, Some(PathBuf::from("/file/db")));
        assert_eq!(merged.max_attempts, Some(2));
        assert_eq!(merged.llm.model.as_deref(), Some("file-model"));
    }

    #[test]
    fn test_apply_layer_empty_index_path_disables_snapshot() {
        let mut config = Config::default();
        apply_layer(
            &mut config,
            ConfigFile {
                index_path: Some(PathBuf::new()),
                ..Default::default()
            },
        );
        assert!(config.index_path.is_none());
    }

    #[test]
    fn test_apply_layer_expands_tilde() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let mut config = Config::default();
        apply_layer(
            &mut config,
            ConfigFile {
                database_path: Some(PathBuf::from("~/memory/notes.db")),
                ..Default::default()
            },
        );
        assert_eq!(config.database_path, home.join("memory/notes.db"));
    }

    #[test]
    fn test_resolve_llm_defaults() {
        let llm = resolve_llm(LlmFile::default());
        assert_eq!(llm.backend, LlmBackend::Ollama);
        assert_eq!(llm.model, "llama3");
        assert!(llm.api_key.is_none());

        let llm = resolve_llm(LlmFile {
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        });
        assert_eq!(llm.backend, LlmBackend::OpenAi);
        assert_eq!(llm.model, "gpt-4o-mini");
    }

    #[test]
    fn test_resolve_llm_blank_key_is_absent() {
        let llm = resolve_llm(LlmFile {
            api_key: Some("   ".to_string()),
            ..Default::default()
        });
        assert!(llm.api_key.is_none());
        assert_eq!(llm.backend, LlmBackend::Ollama);
    }

    #[test]
    fn test_explicit_backend_and_model_kept() {
        let llm = resolve_llm(LlmFile {
            backend: Some(LlmBackend::Ollama),
            model: Some("qwen2.5".to_string()),
            api_key: Some("sk-unused".to_string()),
            base_url: Some("http://localhost:11434".to_string()),
        });
        assert_eq!(llm.backend, LlmBackend::Ollama);
        assert_eq!(llm.model, "qwen2.5");
        assert_eq!(llm.base_url.as_deref(), Some("http://localhost:11434"));
    }
}
