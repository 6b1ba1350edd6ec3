//! Row types mapping directly to SQLite rows. Text columns stay sealed
//! here and are opened by the message store.

pub struct UserRow {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub tokens: f64,
    pub private_room_id: Option<i64>,
    pub last_used_chatroom_id: Option<i64>,
    pub preview_message_count: i64,
    pub is_placeholder: bool,
    pub avatar: Option<String>,
    pub created_at: String,
}

pub struct ChatRoomRow {
    pub id: i64,
    pub name: String,
    pub creator_id: String,
    pub is_private: bool,
    pub is_invisible: bool,
    pub participants: Vec<String>,
    pub created_at: String,
}

pub struct NewMessageRow<'a> {
    pub user_id: &'a str,
    pub username: &'a str,
    pub chatroom_id: i64,
    pub original_ciphertext: &'a [u8],
    pub original_nonce: &'a [u8],
    pub content_type: &'a str,
    pub media_ref: Option<&'a str>,
    pub reply_to_message_id: Option<i64>,
    pub audio_duration_minutes: f64,
    pub created_at: &'a str,
}

pub struct MessageRow {
    pub id: i64,
    pub user_id: String,
    pub username: String,
    pub chatroom_id: i64,
    pub original_ciphertext: Vec<u8>,
    pub original_nonce: Vec<u8>,
    pub content_type: String,
    pub media_ref: Option<String>,
    pub is_recalled: bool,
    pub is_edited: bool,
    pub reply_to_message_id: Option<i64>,
    pub audio_duration_minutes: f64,
    pub created_at: String,
}

pub struct TranslationRow {
    pub language_key: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageRow {
    pub language_key: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost_full: f64,
    pub cost_reduced: f64,
    pub produced_at: String,
}

pub struct ViewerRow {
    pub language_key: String,
    pub viewer_id: String,
    pub viewed_at: String,
}

/// Usage written alongside a translation. Costs are added to any existing
/// record for the same key.
pub struct NewUsage<'a> {
    pub model: &'a str,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost_full: f64,
    pub cost_reduced: f64,
    pub produced_at: &'a str,
}
