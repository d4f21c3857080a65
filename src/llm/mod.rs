//! Language-model backends used by the enrichment pipeline.
//!
//! A backend turns one prompt into one text completion. Both backends ask
//! the model for a JSON object; parsing and validation of that object is
//! left to the enrichment pipeline.

mod ollama;
mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;

use crate::errors::Error;

pub use self::ollama::OllamaProvider;
pub use self::openai::OpenAiProvider;

/// Text-completion backend.
#[async_trait]
pub trait LanguageModelProvider: Send + Sync {
    /// Complete `prompt`, returning the raw model output.
    async fn generate(&self, prompt: &str) -> Result<String, Error>;

    /// `backend:model`, used in logs.
    fn name(&self) -> &str;
}

/// Supported completion backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    /// OpenAI-compatible `/v1/chat/completions`.
    OpenAi,
    /// Local Ollama server, `/api/generate`.
    Ollama,
}

impl LlmBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmBackend::OpenAi => "openai",
            LlmBackend::Ollama => "ollama",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmBackend::OpenAi => "gpt-4o-mini",
            LlmBackend::Ollama => "llama3",
        }
    }
}

impl std::str::FromStr for LlmBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(LlmBackend::OpenAi),
            "ollama" => Ok(LlmBackend::Ollama),
            other => Err(Error::Config(format!(
                "unknown LLM backend '{other}' (expected 'openai' or 'ollama')"
            ))),
        }
    }
}

/// Connection settings for the completion backend.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub model: String,
    pub api_key: Option<SecretString>,
    /// Overrides the backend's default endpoint.
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            backend: LlmBackend::Ollama,
            model: LlmBackend::Ollama.default_model().to_string(),
            api_key: None,
            base_url: None,
        }
    }
}

/// Build the configured backend.
///
/// # Errors
///
/// Returns `Error::Config` if the OpenAI backend is selected without an API key.
pub fn build_provider(config: &LlmConfig) -> Result<Arc<dyn LanguageModelProvider>, Error> {
    match config.backend {
        LlmBackend::OpenAi => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                Error::Config("the openai backend requires an API key".to_string())
            })?;
            let mut provider = OpenAiProvider::new(api_key, &config.model);
            if let Some(url) = &config.base_url {
                provider = provider.with_base_url(url);
            }
            Ok(Arc::new(provider))
        }
        LlmBackend::Ollama => {
            let mut provider = OllamaProvider::new(&config.model);
            if let Some(url) = &config.base_url {
                provider = provider.with_base_url(url);
            }
            Ok(Arc::new(provider))
        }
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
