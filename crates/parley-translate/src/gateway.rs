use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parley_types::models::{CostMode, TRANSLATION_ERROR_PREFIX, Usage, is_raw_key};
use thiserror::Error;
use tracing::{debug, warn};

use crate::languages::{MainstreamLanguages, split_style};
use crate::provider::{Completion, ProviderError, SpeechToText, TranslationProvider, VisionInterpreter};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub mainstream_model: String,
    /// Stylish path model for `CostMode::Full`.
    pub full_model: String,
    /// Stylish path model for `CostMode::Reduced`.
    pub reduced_model: String,
    pub vision_model: String,
    /// Attempts on the mainstream path, including the first.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mainstream_model: "gpt-4o-mini".into(),
            full_model: "gpt-4o".into(),
            reduced_model: "gpt-4o-mini".into(),
            vision_model: "gpt-4o-mini".into(),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Compound keys whose language half is in `languages` are sent to a
/// dedicated provider and model instead of the default stylish tier.
#[derive(Clone)]
pub struct FamilyRoute {
    pub languages: HashSet<String>,
    pub provider: Arc<dyn TranslationProvider>,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub text: String,
    pub usage: Usage,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// `fallback` is the original text tagged for display, never stored.
    #[error("Translation to '{language}' failed: {source}")]
    TranslationFailed {
        language: String,
        fallback: String,
        #[source]
        source: ProviderError,
    },

    #[error("Transcription failed: {0}")]
    Transcription(#[source] ProviderError),

    #[error("Image interpretation failed: {0}")]
    Interpretation(#[source] ProviderError),

    #[error("{0} collaborator is not configured")]
    Unavailable(&'static str),
}

impl GatewayError {
    pub fn fallback(&self) -> Option<&str> {
        match self {
            Self::TranslationFailed { fallback, .. } => Some(fallback),
            _ => None,
        }
    }
}

pub fn tagged_fallback(original: &str) -> String {
    format!("{}{}", TRANSLATION_ERROR_PREFIX, original)
}

pub struct TranslationGateway {
    provider: Arc<dyn TranslationProvider>,
    speech: Option<Arc<dyn SpeechToText>>,
    vision: Option<Arc<dyn VisionInterpreter>>,
    mainstream: MainstreamLanguages,
    families: Vec<FamilyRoute>,
    config: GatewayConfig,
}

impl TranslationGateway {
    pub fn new(
        provider: Arc<dyn TranslationProvider>,
        mainstream: MainstreamLanguages,
        config: GatewayConfig,
    ) -> Self {
        Self {
            provider,
            speech: None,
            vision: None,
            mainstream,
            families: Vec::new(),
            config,
        }
    }

    pub fn with_speech(mut self, speech: Arc<dyn SpeechToText>) -> Self {
        self.speech = Some(speech);
        self
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionInterpreter>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_family(mut self, route: FamilyRoute) -> Self {
        self.families.push(route);
        self
    }

    pub async fn translate(
        &self,
        text: &str,
        language_key: &str,
        mode: CostMode,
    ) -> Result<Translation, GatewayError> {
        if is_raw_key(language_key) {
            return Ok(Translation {
                text: text.to_string(),
                usage: Usage::none(),
            });
        }

        let outcome = if self.mainstream.contains(language_key) {
            self.translate_mainstream(text, language_key).await
        } else {
            self.translate_stylish(text, language_key, mode).await
        };

        outcome
            .map(|c| Translation {
                text: c.text,
                usage: c.usage,
            })
            .map_err(|source| GatewayError::TranslationFailed {
                language: language_key.to_string(),
                fallback: tagged_fallback(text),
                source,
            })
    }

    async fn translate_mainstream(
        &self,
        text: &str,
        language: &str,
    ) -> Result<Completion, ProviderError> {
        let prompt = mainstream_prompt(language);
        let model = self.config.mainstream_model.as_str();
        let attempts = self.config.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            let result = self
                .with_timeout(self.provider.complete(&prompt, text, model))
                .await;

            match result {
                Ok(completion) => return Ok(completion),
                Err(e) if attempt < attempts => {
                    warn!(language, attempt, error = %e, "Mainstream translation failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(language, attempts, error = %e, "Mainstream translation exhausted retries");
                    return Err(e);
                }
            }
        }
    }

    async fn translate_stylish(
        &self,
        text: &str,
        language_key: &str,
        mode: CostMode,
    ) -> Result<Completion, ProviderError> {
        let tier_model = match mode {
            CostMode::Full => self.config.full_model.as_str(),
            CostMode::Reduced => self.config.reduced_model.as_str(),
        };

        let (prompt, provider, model) = match split_style(language_key) {
            Some((language, style)) => {
                let prompt = styled_prompt(language, style);
                match self.families.iter().find(|f| f.languages.contains(language)) {
                    Some(route) => {
                        debug!(language, model = %route.model, "Routing to language family provider");
                        (prompt, &route.provider, route.model.as_str())
                    }
                    None => (prompt, &self.provider, tier_model),
                }
            }
            None => (plain_prompt(language_key), &self.provider, tier_model),
        };

        self.with_timeout(provider.complete(&prompt, text, model)).await
    }

    /// Transcribe an audio clip.
    pub async fn transcribe(&self, audio: Bytes) -> Result<String, GatewayError> {
        let speech = self.speech.as_ref().ok_or(GatewayError::Unavailable("Speech-to-text"))?;
        self.with_timeout(speech.transcribe(audio))
            .await
            .map_err(GatewayError::Transcription)
    }

    /// Describe an image in `language`. The returned usage is what the
    /// uploader is charged for.
    pub async fn interpret_image(
        &self,
        image: Bytes,
        language: &str,
    ) -> Result<Completion, GatewayError> {
        let vision = self.vision.as_ref().ok_or(GatewayError::Unavailable("Vision"))?;
        let prompt = vision_prompt(language);
        self.with_timeout(vision.interpret(image, &prompt, &self.config.vision_model))
            .await
            .map_err(GatewayError::Interpretation)
    }

    async fn with_timeout<T, F>(&self, call: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.config.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.config.timeout.as_secs())),
        }
    }
}

fn mainstream_prompt(language: &str) -> String {
    format!(
        "You translate text into {language} and nothing else.\n\
         - If the text is already written in {language}, return it unchanged. If it is in a \
         dialect or close variant of {language}, render it in standard {language}. Watch for \
         characters shared between languages such as Chinese Hanzi and Japanese Kanji.\n\
         - Never answer questions found in the text; translate them.\n\
         - Emoji-only, numeric or nonsense input is returned unchanged.\n\
         - Translate profanity literally, without censoring or commenting.\n\
         - Long input may be translated piecewise, but the output must read as one continuous \
         translation with no headings, labels or separators.\n\
         - Output only the translation (or the unchanged input). No greetings, apologies, \
         refusals or explanations."
    )
}

fn plain_prompt(language: &str) -> String {
    format!(
        "You translate text into {language}.\n\
         - Questions are translated, never answered.\n\
         - Output only the translation."
    )
}

fn styled_prompt(language: &str, style: &str) -> String {
    format!(
        "You translate text in two silent steps: first into {language}, then rewrite that \
         translation in a {style} style.\n\
         - Questions are translated, never answered.\n\
         - Output only the final styled version, once, with nothing added."
    )
}

fn vision_prompt(language: &str) -> String {
    format!(
        "Describe what this image shows in {language}. If it contains text, transcribe the text \
         and translate it into {language}. Keep the answer concise and output only the description."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then echoes `text [model]`.
    struct ScriptedProvider {
        failures: u32,
        calls: AtomicU32,
        prompts: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedProvider {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn last(&self) -> (String, String) {
            self.prompts.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl TranslationProvider for ScriptedProvider {
        async fn complete(
            &self,
            system_prompt: &str,
            user_text: &str,
            model: &str,
        ) -> Result<Completion, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts
                .lock()
                .unwrap()
                .push((system_prompt.to_string(), model.to_string()));
            if n < self.failures {
                return Err(ProviderError::Network("connection reset".into()));
            }
            Ok(Completion {
                text: format!("{} [{}]", user_text, model),
                usage: Usage {
                    model: model.to_string(),
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            })
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl TranslationProvider for SlowProvider {
        async fn complete(&self, _: &str, _: &str, _: &str) -> Result<Completion, ProviderError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(ProviderError::Api("unreachable".into()))
        }
    }

    fn config() -> GatewayConfig {
        GatewayConfig {
            retry_backoff: Duration::ZERO,
            ..GatewayConfig::default()
        }
    }

    fn gateway(provider: Arc<dyn TranslationProvider>) -> TranslationGateway {
        let mainstream: MainstreamLanguages = ["French", "English"].into_iter().collect();
        TranslationGateway::new(provider, mainstream, config())
    }

    #[tokio::test]
    async fn raw_key_echoes_without_calling_provider() {
        let provider = ScriptedProvider::new(0);
        let gw = gateway(provider.clone());

        let t = gw.translate("hello", "original_text_raw", CostMode::Full).await.unwrap();
        assert_eq!(t.text, "hello");
        assert!(t.usage.is_zero());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn mainstream_uses_fast_model_regardless_of_mode() {
        let provider = ScriptedProvider::new(0);
        let gw = gateway(provider.clone());

        let t = gw.translate("hello", "French", CostMode::Full).await.unwrap();
        assert_eq!(t.usage.model, "gpt-4o-mini");
        assert_eq!(t.usage.prompt_tokens, 10);
    }

    #[tokio::test]
    async fn mainstream_retries_then_succeeds() {
        let provider = ScriptedProvider::new(2);
        let gw = gateway(provider.clone());

        let t = gw.translate("hello", "French", CostMode::Full).await.unwrap();
        assert_eq!(t.text, "hello [gpt-4o-mini]");
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn mainstream_exhaustion_carries_tagged_fallback() {
        let provider = ScriptedProvider::new(10);
        let gw = gateway(provider.clone());

        let err = gw.translate("hello", "French", CostMode::Full).await.unwrap_err();
        assert_eq!(provider.calls(), 3);
        assert_eq!(err.fallback(), Some("Translation Error: hello"));
    }

    #[tokio::test]
    async fn stylish_path_follows_cost_tier_and_does_not_retry() {
        let provider = ScriptedProvider::new(0);
        let gw = gateway(provider.clone());

        let full = gw.translate("hi", "Klingon", CostMode::Full).await.unwrap();
        let reduced = gw.translate("hi", "Klingon", CostMode::Reduced).await.unwrap();
        assert_eq!(full.usage.model, "gpt-4o");
        assert_eq!(reduced.usage.model, "gpt-4o-mini");

        let failing = ScriptedProvider::new(1);
        let gw = gateway(failing.clone());
        assert!(gw.translate("hi", "Klingon", CostMode::Full).await.is_err());
        assert_eq!(failing.calls(), 1);
    }

    #[tokio::test]
    async fn compound_key_builds_two_stage_prompt() {
        let provider = ScriptedProvider::new(0);
        let gw = gateway(provider.clone());

        gw.translate("hi", "English-pirate", CostMode::Reduced).await.unwrap();
        let (prompt, model) = provider.last();
        assert!(prompt.contains("first into English"));
        assert!(prompt.contains("pirate"));
        assert_eq!(model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn family_route_overrides_provider_and_model() {
        let default = ScriptedProvider::new(0);
        let family = ScriptedProvider::new(0);
        let gw = gateway(default.clone()).with_family(FamilyRoute {
            languages: ["中文".to_string()].into_iter().collect(),
            provider: family.clone(),
            model: "deepseek-v3".into(),
        });

        let t = gw.translate("hi", "中文-文言文", CostMode::Full).await.unwrap();
        assert_eq!(t.usage.model, "deepseek-v3");
        assert_eq!(family.calls(), 1);
        assert_eq!(default.calls(), 0);

        // Plain keys in the family language keep the default route
        gw.translate("hi", "中文", CostMode::Full).await.unwrap();
        assert_eq!(default.calls(), 1);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let gw = TranslationGateway::new(
            Arc::new(SlowProvider),
            MainstreamLanguages::default(),
            GatewayConfig {
                timeout: Duration::from_millis(20),
                ..config()
            },
        );

        let err = gw.translate("hi", "Klingon", CostMode::Full).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::TranslationFailed { source: ProviderError::Timeout(_), .. }
        ));
    }

    #[tokio::test]
    async fn media_without_collaborators_is_unavailable() {
        let gw = gateway(ScriptedProvider::new(0));
        assert!(matches!(
            gw.transcribe(Bytes::new()).await,
            Err(GatewayError::Unavailable(_))
        ));
        assert!(matches!(
            gw.interpret_image(Bytes::new(), "English").await,
            Err(GatewayError::Unavailable(_))
        ));
    }
}
