//! Translation Gateway and the external AI collaborators behind it.
//!
//! The gateway owns routing (raw, mainstream, stylish, language families),
//! retry and timeout policy. Providers are injected as trait objects so
//! tests can substitute fakes.

pub mod gateway;
pub mod languages;
pub mod openai;
pub mod provider;

pub use gateway::{
    FamilyRoute, GatewayConfig, GatewayError, Translation, TranslationGateway, tagged_fallback,
};
pub use languages::MainstreamLanguages;
pub use openai::OpenAiProvider;
pub use provider::{Completion, ProviderError, SpeechToText, TranslationProvider, VisionInterpreter};
