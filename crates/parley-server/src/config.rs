use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use parley_chat::{PricingCalculator, TierRates};

/// Optional dedicated route for one language family.
#[derive(Debug, Clone)]
pub struct FamilyConfig {
    pub languages: Vec<String>,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// base64 AES-256 key. A fresh key is generated when unset.
    pub at_rest_key: Option<String>,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub mainstream_languages_path: PathBuf,
    pub mainstream_model: String,
    pub full_model: String,
    pub reduced_model: String,
    pub transcribe_model: String,
    pub vision_model: String,
    pub family: Option<FamilyConfig>,
    pub translate_timeout: Duration,
    pub lock_timeout: Duration,
    pub pricing: PricingCalculator,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |name: &str, default: &str| var(name).unwrap_or_else(|| default.to_string());

        let openai_api_key = match var("OPENAI_API_KEY") {
            Some(key) => key,
            None => bail!("OPENAI_API_KEY must be set"),
        };

        let family = match var("PARLEY_FAMILY_LANGUAGES") {
            Some(list) => Some(FamilyConfig {
                languages: list
                    .split(',')
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect(),
                model: var("PARLEY_FAMILY_MODEL")
                    .context("PARLEY_FAMILY_MODEL is required with PARLEY_FAMILY_LANGUAGES")?,
                base_url: var("PARLEY_FAMILY_BASE_URL"),
                api_key: var("PARLEY_FAMILY_API_KEY"),
            }),
            None => None,
        };

        let defaults = PricingCalculator::default();
        let pricing = PricingCalculator {
            full: TierRates {
                prompt: parse_or(&var, "PARLEY_RATE_FULL_PROMPT", defaults.full.prompt)?,
                completion: parse_or(&var, "PARLEY_RATE_FULL_COMPLETION", defaults.full.completion)?,
            },
            reduced: TierRates {
                prompt: parse_or(&var, "PARLEY_RATE_REDUCED_PROMPT", defaults.reduced.prompt)?,
                completion: parse_or(
                    &var,
                    "PARLEY_RATE_REDUCED_COMPLETION",
                    defaults.reduced.completion,
                )?,
            },
            audio_per_minute: parse_or(&var, "PARLEY_RATE_AUDIO_PER_MINUTE", defaults.audio_per_minute)?,
        };

        Ok(Self {
            host: or("PARLEY_HOST", "0.0.0.0"),
            port: parse_or(&var, "PARLEY_PORT", 3000)?,
            db_path: PathBuf::from(or("PARLEY_DB_PATH", "parley.db")),
            at_rest_key: var("PARLEY_AT_REST_KEY"),
            openai_api_key,
            openai_base_url: or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            mainstream_languages_path: PathBuf::from(or(
                "PARLEY_MAINSTREAM_LANGUAGES",
                "language_mainstream_server.json",
            )),
            mainstream_model: or("PARLEY_MAINSTREAM_MODEL", "gpt-4o-mini"),
            full_model: or("PARLEY_FULL_MODEL", "gpt-4o"),
            reduced_model: or("PARLEY_REDUCED_MODEL", "gpt-4o-mini"),
            transcribe_model: or("PARLEY_TRANSCRIBE_MODEL", "whisper-1"),
            vision_model: or("PARLEY_VISION_MODEL", "gpt-4o-mini"),
            family,
            translate_timeout: Duration::from_secs(parse_or(&var, "PARLEY_TRANSLATE_TIMEOUT_SECS", 60)?),
            lock_timeout: Duration::from_secs(parse_or(&var, "PARLEY_LOCK_TIMEOUT_SECS", 30)?),
            pricing,
        })
    }
}

fn parse_or<T, F>(var: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", name, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[("OPENAI_API_KEY", "sk-test")]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.full_model, "gpt-4o");
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.pricing, PricingCalculator::default());
        assert!(config.family.is_none());
        assert!(config.at_rest_key.is_none());
    }

    #[test]
    fn api_key_is_required() {
        assert!(config(&[]).is_err());
        assert!(config(&[("OPENAI_API_KEY", "  ")]).is_err());
    }

    #[test]
    fn family_route_needs_a_model() {
        let vars = [("OPENAI_API_KEY", "sk"), ("PARLEY_FAMILY_LANGUAGES", "Cantonese, Hokkien")];
        assert!(config(&vars).is_err());

        let vars = [
            ("OPENAI_API_KEY", "sk"),
            ("PARLEY_FAMILY_LANGUAGES", "Cantonese, Hokkien"),
            ("PARLEY_FAMILY_MODEL", "qwen-plus"),
        ];
        let family = config(&vars).unwrap().family.unwrap();
        assert_eq!(family.languages, vec!["Cantonese", "Hokkien"]);
        assert_eq!(family.base_url, None);
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = config(&[("OPENAI_API_KEY", "sk"), ("PARLEY_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("PARLEY_PORT"));
    }

    #[test]
    fn rates_can_be_overridden() {
        let config = config(&[
            ("OPENAI_API_KEY", "sk"),
            ("PARLEY_RATE_AUDIO_PER_MINUTE", "0.01"),
        ])
        .unwrap();
        assert_eq!(config.pricing.audio_per_minute, 0.01);
    }
}
