//! Local Ollama backend (`/api/generate`, JSON mode).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LanguageModelProvider, normalize_base_url};
use crate::errors::Error;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    name: String,
}

impl OllamaProvider {
    pub fn new(model: &str) -> Self {
        OllamaProvider {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.to_string(),
            name: format!("ollama:{model}"),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = normalize_base_url(url);
        self
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'static str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[async_trait]
impl LanguageModelProvider for OllamaProvider {
    async fn generate(&self, prompt: &str) -> Result<String, Error> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            format: "json",
        };

        let endpoint = format!("{}/api/generate", self.base_url);
        debug!(endpoint = %endpoint, model = %self.model, "requesting completion");

        let response = self
            .client
            .post(endpoint)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<GenerateResponse>()
            .await?;

        if response.response.trim().is_empty() {
            return Err(Error::Provider("ollama returned an empty response".to_string()));
        }
        Ok(response.response)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
