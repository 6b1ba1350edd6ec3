use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::models::{ContentType, CostMode};

/// Events sent FROM server TO clients over the WebSocket gateway.
/// Event names on the wire match the legacy socket contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Session registered with the gateway
    Connected { session_id: uuid::Uuid },

    /// Join accepted
    RoomJoined { message: String },

    /// Join rejected because the user is no longer a participant
    AlreadyLeaveChatroom(LeaveNotice),

    /// A message was uploaded to the room
    NewMessage(MessageView),

    /// A message was edited and re-translated
    ReceiveEditedMessage(EditedMessage),

    /// A message was recalled
    ReceiveRecallMessageStatus(RecallStatus),

    /// All messages of a room were deleted
    HistoryCleared { message: String, chatroom_id: i64 },

    /// A priced message view produced by a pull
    ReceivedTranslatedExistedSingleLanguage(MessageView),

    /// The paying account of a pull has a non-positive balance
    CheckTokenStatusIsNegative(BalanceNotice),

    /// Live speaking indicators relayed to the room
    UserSpeakingToClientStart(SpeakingStatus),
    UserSpeakingToClientStop(SpeakingStatus),
    UserSpeakingToClientContentTranscript(SpeakingStatus),

    TextUploadFailed { error: String },
    AudioUploadFailed { error: String },
    PhotoUploadFailed { error: String },

    /// Any other command failed
    OperationFailed { command: String, error: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::RoomJoined { .. } => "room_joined",
            Self::AlreadyLeaveChatroom(_) => "already_leave_chatroom",
            Self::NewMessage(_) => "new_message",
            Self::ReceiveEditedMessage(_) => "receive_edited_message",
            Self::ReceiveRecallMessageStatus(_) => "receive_recall_message_status",
            Self::HistoryCleared { .. } => "history_cleared",
            Self::ReceivedTranslatedExistedSingleLanguage(_) => {
                "received_translated_existed_single_language"
            }
            Self::CheckTokenStatusIsNegative(_) => "check_token_status_is_negative",
            Self::UserSpeakingToClientStart(_) => "user_speaking_to_client_start",
            Self::UserSpeakingToClientStop(_) => "user_speaking_to_client_stop",
            Self::UserSpeakingToClientContentTranscript(_) => {
                "user_speaking_to_client_content_transcript"
            }
            Self::TextUploadFailed { .. } => "text_upload_failed",
            Self::AudioUploadFailed { .. } => "audio_upload_failed",
            Self::PhotoUploadFailed { .. } => "photo_upload_failed",
            Self::OperationFailed { .. } => "operation_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveNotice {
    pub chatroom_id: i64,
    pub user_id: String,
    #[serde(rename = "is_leave")]
    pub is_leave: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceNotice {
    pub user_id: String,
    pub host_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakingStatus {
    pub user_id: String,
    pub username: Option<String>,
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub streaming_transcript: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditedMessage {
    pub message_id: i64,
    pub edited_text: String,
    #[serde(rename = "translations")]
    pub translations: BTreeMap<String, String>,
    #[serde(rename = "failed_translations", skip_serializing_if = "BTreeMap::is_empty", default)]
    pub failed_translations: BTreeMap<String, String>,
    #[serde(rename = "is_edited")]
    pub is_edited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallStatus {
    pub message_id: i64,
    pub user_id: String,
    pub username: String,
}

/// Client-facing rendering of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: i64,
    pub username: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub original_text: String,
    /// Text of the primary requested language key.
    pub translated_text: String,
    pub content_type: ContentType,
    /// `%Y-%m-%d %H:%M:%S`, UTC
    pub timestamp: String,
    pub chatroom_id: i64,
    pub translations: BTreeMap<String, String>,
    /// Keys whose translation failed in this event, mapped to the
    /// error-tagged original text.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub failed_translations: BTreeMap<String, String>,
    pub is_recalled: bool,
    pub is_edited: bool,
    pub recall_username: Option<String>,
    pub reply_to_message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_to: Option<ReplyPreview>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub media_ref: Option<String>,
    pub audio_duration_minutes: f64,
}

/// Read-time resolution of a reply back-reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub message_id: i64,
    /// The referenced message no longer exists.
    pub missing: bool,
    pub username: Option<String>,
    pub excerpt: Option<String>,
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinRoom(JoinRoom),
    LeaveRoom(LeaveRoom),
    UploadText(UploadText),
    UploadAudio(UploadAudio),
    UploadPhoto(UploadPhoto),
    EditExistedText(EditText),
    RecallMessage(RecallMessage),
    UserSpeakingFromClientStart(SpeakingSignal),
    UserSpeakingFromClientStop(SpeakingSignal),
    UserSpeakingFromClientContentTranscript(SpeakingSignal),
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "join_room",
            Self::LeaveRoom(_) => "leave_room",
            Self::UploadText(_) => "upload_text",
            Self::UploadAudio(_) => "upload_audio",
            Self::UploadPhoto(_) => "upload_photo",
            Self::EditExistedText(_) => "edit_existed_text",
            Self::RecallMessage(_) => "recall_message",
            Self::UserSpeakingFromClientStart(_) => "user_speaking_from_client_start",
            Self::UserSpeakingFromClientStop(_) => "user_speaking_from_client_stop",
            Self::UserSpeakingFromClientContentTranscript(_) => {
                "user_speaking_from_client_content_transcript"
            }
        }
    }
}

/// Which language keys a client wants materialized for an event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageSelection {
    #[serde(default)]
    pub to_language_me: Option<String>,
    #[serde(default)]
    pub to_language_me_first: Option<String>,
    #[serde(default)]
    pub to_language_me_second: Option<String>,
    #[serde(default)]
    pub is_split: bool,
}

impl LanguageSelection {
    pub fn single(language_key: impl Into<String>) -> Self {
        Self {
            to_language_me: Some(language_key.into()),
            ..Default::default()
        }
    }

    pub fn split(first: impl Into<String>, second: impl Into<String>) -> Self {
        Self {
            to_language_me_first: Some(first.into()),
            to_language_me_second: Some(second.into()),
            is_split: true,
            ..Default::default()
        }
    }

    /// Requested keys in display order, without blanks or duplicates.
    pub fn targets(&self) -> Vec<String> {
        let candidates: Vec<&Option<String>> = if self.is_split {
            vec![&self.to_language_me_first, &self.to_language_me_second]
        } else {
            vec![&self.to_language_me]
        };

        let mut targets: Vec<String> = Vec::with_capacity(2);
        for key in candidates.into_iter().flatten() {
            let key = key.trim();
            if !key.is_empty() && !targets.iter().any(|t| t == key) {
                targets.push(key.to_string());
            }
        }
        targets
    }

    pub fn primary(&self) -> Option<String> {
        self.targets().into_iter().next()
    }
}

/// Guest sessions act under their own id but spend the host's balance.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestContext {
    #[serde(default)]
    pub is_guest_mode: bool,
    #[serde(default)]
    pub curr_host_user_id: Option<String>,
}

impl GuestContext {
    pub fn host(host_user_id: impl Into<String>) -> Self {
        Self {
            is_guest_mode: true,
            curr_host_user_id: Some(host_user_id.into()),
        }
    }

    /// Account whose balance pays for `acting_user_id`'s activity.
    pub fn payer<'a>(&'a self, acting_user_id: &'a str) -> &'a str {
        match (&self.is_guest_mode, &self.curr_host_user_id) {
            (true, Some(host)) if !host.is_empty() => host,
            _ => acting_user_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub user_id: String,
    #[serde(deserialize_with = "de_id")]
    pub chatroom_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoom {
    #[serde(deserialize_with = "de_id")]
    pub chatroom_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadText {
    pub user_id: String,
    #[serde(deserialize_with = "de_id")]
    pub chatroom_id: i64,
    pub message: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(flatten)]
    pub languages: LanguageSelection,
    #[serde(default, deserialize_with = "de_reply_id")]
    pub reply_to_message_id: Option<i64>,
    #[serde(default)]
    pub low_cost_mode: CostMode,
    #[serde(flatten)]
    pub guest: GuestContext,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAudio {
    pub user_id: String,
    #[serde(deserialize_with = "de_id")]
    pub chatroom_id: i64,
    /// base64-encoded audio
    pub audio: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub media_ref: Option<String>,
    #[serde(flatten)]
    pub languages: LanguageSelection,
    #[serde(default, deserialize_with = "de_reply_id")]
    pub reply_to_message_id: Option<i64>,
    #[serde(default)]
    pub low_cost_mode: CostMode,
    #[serde(default)]
    pub duration_in_minutes: f64,
    #[serde(flatten)]
    pub guest: GuestContext,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPhoto {
    pub user_id: String,
    #[serde(deserialize_with = "de_id")]
    pub chatroom_id: i64,
    /// base64-encoded image
    pub photo: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub media_ref: Option<String>,
    /// Fallback interpretation language when the first selected key is the raw mirror.
    #[serde(default)]
    pub system_language: Option<String>,
    #[serde(flatten)]
    pub languages: LanguageSelection,
    #[serde(default, deserialize_with = "de_reply_id")]
    pub reply_to_message_id: Option<i64>,
    #[serde(default)]
    pub low_cost_mode: CostMode,
    #[serde(flatten)]
    pub guest: GuestContext,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditText {
    #[serde(deserialize_with = "de_id")]
    pub message_id: i64,
    pub edited_text: String,
    #[serde(deserialize_with = "de_id")]
    pub chatroom_id: i64,
    pub user_id: String,
    #[serde(flatten)]
    pub languages: LanguageSelection,
    #[serde(default)]
    pub low_cost_mode: CostMode,
    #[serde(flatten)]
    pub guest: GuestContext,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallMessage {
    #[serde(deserialize_with = "de_id")]
    pub chatroom_id: i64,
    #[serde(deserialize_with = "de_id")]
    pub message_id: i64,
    pub user_id: String,
}

/// A client's live speaking signal. Relayed, never stored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakingSignal {
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(deserialize_with = "de_id")]
    pub chatroom_id: i64,
    #[serde(default)]
    pub streaming_transcript: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Int(i64),
    Text(String),
}

/// Ids arrive either as JSON numbers or as stringified numbers.
fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match RawId::deserialize(deserializer)? {
        RawId::Int(id) => Ok(id),
        RawId::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Legacy clients send `-1` for "not a reply".
fn de_reply_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let raw = Option::<RawId>::deserialize(deserializer)?;
    let id = match raw {
        None => return Ok(None),
        Some(RawId::Int(id)) => id,
        Some(RawId::Text(text)) if text.trim().is_empty() => return Ok(None),
        Some(RawId::Text(text)) => text.trim().parse().map_err(serde::de::Error::custom)?,
    };
    Ok((id >= 0).then_some(id))
}
