use async_trait::async_trait;
use bytes::Bytes;
use parley_types::models::Usage;
use thiserror::Error;

/// Text returned by a model together with what it cost to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Missing API key, malformed base URL and the like
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    /// Non-2xx response or an empty completion
    #[error("API error: {0}")]
    Api(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),
}

#[async_trait]
pub trait TranslationProvider: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_text: &str,
        model: &str,
    ) -> Result<Completion, ProviderError>;
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: Bytes) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait VisionInterpreter: Send + Sync {
    async fn interpret(
        &self,
        image: Bytes,
        prompt: &str,
        model: &str,
    ) -> Result<Completion, ProviderError>;
}
