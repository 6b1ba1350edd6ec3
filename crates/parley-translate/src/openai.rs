//! Client for OpenAI-compatible REST endpoints. Serves chat completions,
//! audio transcription and image interpretation.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use parley_types::models::Usage;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::provider::{Completion, ProviderError, SpeechToText, TranslationProvider, VisionInterpreter};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiProvider {
    http_client: Client,
    api_key: String,
    base_url: String,
    transcribe_model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponseRaw {
    choices: Vec<ChatChoice>,
    usage: Option<UsageRaw>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageRaw {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            transcribe_model: "whisper-1".to_string(),
        }
    }

    /// Point at a proxy or any other OpenAI-compatible host.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_transcribe_model(mut self, model: impl Into<String>) -> Self {
        self.transcribe_model = model.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn chat(&self, model: &str, body: serde_json::Value) -> Result<Completion, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::Config("API key not set".into()));
        }
        let start = std::time::Instant::now();

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Chat completion request failed");
                ProviderError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "Chat completion API error");
            return Err(ProviderError::Api(format!("{}: {}", status, error_text)));
        }

        let raw: ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let text = raw
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Api("Empty completion".into()))?;

        let usage = raw.usage.map_or_else(
            || Usage {
                model: model.to_string(),
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
            },
            |u| Usage {
                model: model.to_string(),
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            },
        );

        debug!(
            model = %model,
            duration_ms = start.elapsed().as_millis() as u64,
            total_tokens = usage.total_tokens,
            "Chat completion"
        );

        Ok(Completion { text, usage })
    }
}

#[async_trait]
impl TranslationProvider for OpenAiProvider {
    async fn complete(
        &self,
        system_prompt: &str,
        user_text: &str,
        model: &str,
    ) -> Result<Completion, ProviderError> {
        let body = json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_text },
            ],
        });
        self.chat(model, body).await
    }
}

#[async_trait]
impl VisionInterpreter for OpenAiProvider {
    async fn interpret(
        &self,
        image: Bytes,
        prompt: &str,
        model: &str,
    ) -> Result<Completion, ProviderError> {
        let data_url = format!("data:image/jpeg;base64,{}", BASE64.encode(&image));
        let body = json!({
            "model": model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }],
        });
        self.chat(model, body).await
    }
}

#[async_trait]
impl SpeechToText for OpenAiProvider {
    async fn transcribe(&self, audio: Bytes) -> Result<String, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::Config("API key not set".into()));
        }

        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("audio.webm")
            .mime_str("audio/webm")
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.transcribe_model.clone())
            .part("file", part);

        let response = self
            .http_client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Transcription request failed");
                ProviderError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "Transcription API error");
            return Err(ProviderError::Api(format!("{}: {}", status, error_text)));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parsed.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn base_url_drops_trailing_slash() {
        let client = OpenAiProvider::new("sk-test").with_base_url("https://proxy.local/v1/");
        assert_eq!(client.base_url(), "https://proxy.local/v1");
    }

    #[tokio::test]
    async fn completion_reports_usage_under_requested_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-mini-2024-07-18",
                "choices": [{ "message": { "role": "assistant", "content": "bonjour" } }],
                "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
            })))
            .mount(&server)
            .await;

        let client = OpenAiProvider::new("sk-test").with_base_url(server.uri());
        let completion = client.complete("translate", "hello", "gpt-4o-mini").await.unwrap();

        assert_eq!(completion.text, "bonjour");
        assert_eq!(completion.usage.model, "gpt-4o-mini");
        assert_eq!(completion.usage.prompt_tokens, 10);
        assert_eq!(completion.usage.completion_tokens, 5);
    }

    #[tokio::test]
    async fn api_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let client = OpenAiProvider::new("sk-test").with_base_url(server.uri());
        let err = client.complete("translate", "hello", "gpt-4o-mini").await.unwrap_err();
        assert!(matches!(err, ProviderError::Api(msg) if msg.contains("rate limited")));
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let client = OpenAiProvider::new("sk-test").with_base_url(server.uri());
        assert!(client.complete("p", "t", "m").await.is_err());
    }

    #[tokio::test]
    async fn transcription_returns_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio/transcriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "text": "hello there" })))
            .mount(&server)
            .await;

        let client = OpenAiProvider::new("sk-test").with_base_url(server.uri());
        let text = client.transcribe(Bytes::from_static(b"RIFF....")).await.unwrap();
        assert_eq!(text, "hello there");
    }

    #[tokio::test]
    async fn missing_key_fails_before_network() {
        let client = OpenAiProvider::new("").with_base_url("http://127.0.0.1:9");
        let err = client.complete("p", "t", "m").await.unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }
}
