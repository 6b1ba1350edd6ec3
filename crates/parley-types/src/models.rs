use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Language key of the untranslated mirror every message carries.
pub const ORIGINAL_TEXT_RAW: &str = "original_text_raw";

/// Prefix used when a translation could not be produced and the original
/// text is echoed back to the client instead.
pub const TRANSLATION_ERROR_PREFIX: &str = "Translation Error: ";

pub fn is_raw_key(language_key: &str) -> bool {
    language_key == ORIGINAL_TEXT_RAW
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Audio,
    Photo,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
            Self::Photo => "photo",
        }
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "audio" => Ok(Self::Audio),
            "photo" => Ok(Self::Photo),
            other => Err(format!("unknown content type '{}'", other)),
        }
    }
}

/// Billing tier selector. Clients send `"0"` for the full tier and `"1"` for
/// the reduced ("low cost") tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CostMode {
    #[default]
    Full,
    Reduced,
}

impl CostMode {
    pub fn as_flag(&self) -> &'static str {
        match self {
            Self::Full => "0",
            Self::Reduced => "1",
        }
    }
}

impl FromStr for CostMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" | "" => Ok(Self::Full),
            "1" => Ok(Self::Reduced),
            other => Err(format!("invalid cost mode '{}', expected \"0\" or \"1\"", other)),
        }
    }
}

impl TryFrom<String> for CostMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CostMode> for String {
    fn from(mode: CostMode) -> Self {
        mode.as_flag().to_string()
    }
}

impl fmt::Display for CostMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_flag())
    }
}

/// Token usage reported by a provider for one completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Usage of a slot that was filled without calling any provider.
    pub fn none() -> Self {
        Self {
            model: "none".to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

/// Usage record stored per language key. Costs accumulate across edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationUsage {
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost_full: f64,
    pub cost_reduced: f64,
    pub produced_at: DateTime<Utc>,
}

impl TranslationUsage {
    pub fn usage(&self) -> Usage {
        Usage {
            model: self.model.clone(),
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

/// A chat message with its decrypted translation slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub user_id: String,
    pub username: String,
    pub chatroom_id: i64,
    pub original_text: String,
    pub content_type: ContentType,
    /// Pointer to the stored media for audio/photo messages. Resolved by the
    /// file service, never by this crate.
    pub media_ref: Option<String>,
    pub translations: BTreeMap<String, String>,
    pub translation_usage: BTreeMap<String, TranslationUsage>,
    /// language key -> viewer id -> first view
    pub translation_viewers: BTreeMap<String, BTreeMap<String, DateTime<Utc>>>,
    pub is_recalled: bool,
    pub is_edited: bool,
    /// Weak back-reference; the target may no longer exist.
    pub reply_to_message_id: Option<i64>,
    pub audio_duration_minutes: f64,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn translation(&self, language_key: &str) -> Option<&str> {
        self.translations.get(language_key).map(String::as_str)
    }

    pub fn has_translation(&self, language_key: &str) -> bool {
        self.translations
            .get(language_key)
            .is_some_and(|text| !text.is_empty())
    }

    pub fn has_viewed(&self, language_key: &str, viewer_id: &str) -> bool {
        self.translation_viewers
            .get(language_key)
            .is_some_and(|viewers| viewers.contains_key(viewer_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub username: String,
    /// May go negative; no floor is enforced on the viewing path.
    pub tokens: f64,
    pub private_room_id: Option<i64>,
    pub last_used_chatroom_id: Option<i64>,
    pub preview_message_count: i64,
    /// Created implicitly on first upload with generated credentials.
    pub is_placeholder: bool,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: i64,
    pub name: String,
    pub creator_id: String,
    pub is_private: bool,
    pub is_invisible: bool,
    pub participants: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatRoom {
    pub fn is_creator(&self, user_id: &str) -> bool {
        self.creator_id == user_id
    }

    pub fn admits(&self, user_id: &str) -> bool {
        self.is_creator(user_id) || self.participants.iter().any(|p| p == user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_mode_parses_client_flags() {
        assert_eq!("0".parse::<CostMode>().unwrap(), CostMode::Full);
        assert_eq!("1".parse::<CostMode>().unwrap(), CostMode::Reduced);
        assert!("2".parse::<CostMode>().is_err());

        let mode: CostMode = serde_json::from_str("\"1\"").unwrap();
        assert_eq!(mode, CostMode::Reduced);
        assert_eq!(serde_json::to_string(&CostMode::Full).unwrap(), "\"0\"");
    }

    #[test]
    fn chatroom_admits_creator_and_participants() {
        let room = ChatRoom {
            id: 1,
            name: "lobby".into(),
            creator_id: "owner".into(),
            is_private: false,
            is_invisible: false,
            participants: vec!["alice".into()],
            created_at: Utc::now(),
        };

        assert!(room.admits("owner"));
        assert!(room.admits("alice"));
        assert!(!room.admits("mallory"));
    }
}
