//! OpenAI-compatible chat completions backend.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LanguageModelProvider, normalize_base_url};
use crate::errors::Error;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

const SYSTEM_PROMPT: &str = "You annotate notes for a long-term memory store. \
                             Always respond with a single JSON object.";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    name: String,
}

fn has_version_suffix(base_url: &str) -> bool {
    let Some(last_segment) = base_url.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = last_segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

fn chat_completions_endpoint(base_url: &str) -> String {
    let normalized = normalize_base_url(base_url);
    if normalized.ends_with("/chat/completions") {
        return normalized;
    }
    if has_version_suffix(&normalized) {
        return format!("{normalized}/chat/completions");
    }
    format!("{normalized}/v1/chat/completions")
}

impl OpenAiProvider {
    pub fn new(api_key: SecretString, model: &str) -> Self {
        OpenAiProvider {
            client: reqwest::Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.to_string(),
            name: format!("openai:{model}"),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = normalize_base_url(url);
        self
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    response_format: ResponseFormat,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[async_trait]
impl LanguageModelProvider for OpenAiProvider {
    async fn generate(&self, prompt: &str) -> Result<String, Error> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
            temperature: 0.2,
        };

        let endpoint = chat_completions_endpoint(&self.base_url);
        debug!(endpoint = %endpoint, model = %self.model, "requesting chat completion");

        let response = self
            .client
            .post(endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<ChatResponse>()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| Error::Provider("chat completion returned no content".to_string()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> OpenAiProvider {
        OpenAiProvider::new(SecretString::new("sk-test".to_string()), "gpt-4o-mini")
            .with_base_url(&server.uri())
    }

    #[test]
    fn endpoint_from_host_base_uses_v1_chat_completions() {
        assert_eq!(
            chat_completions_endpoint("https://api.openai.com"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn endpoint_from_version_suffix_keeps_version() {
        assert_eq!(
            chat_completions_endpoint("https://open.bigmodel.cn/api/paas/v4/"),
            "https://open.bigmodel.cn/api/paas/v4/chat/completions"
        );
    }

    #[test]
    fn endpoint_preserves_explicit_url() {
        assert_eq!(
            chat_completions_endpoint("https://api.example.com/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn generate_returns_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "response_format": { "type": "json_object" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [
                    { "message": { "role": "assistant", "content": "{\"tags\":[\"ui\"]}" } }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let output = provider(&server).generate("annotate this").await.unwrap();
        assert_eq!(output, "{\"tags\":[\"ui\"]}");
    }

    #[tokio::test]
    async fn generate_maps_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = provider(&server).generate("annotate this").await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn generate_auth_failure_is_not_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = provider(&server).generate("annotate this").await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn generate_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = provider(&server).generate("annotate this").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn generate_rejects_empty_choices() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let err = provider(&server).generate("annotate this").await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }
}
