use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::MessageView;
use crate::models::CostMode;

// -- Pulls --

/// Path of `/api/get-messages-on-demand/...` and `/api/all-messages/...`.
#[derive(Debug, Deserialize)]
pub struct PullPath {
    pub chatroom_id: i64,
    pub language: String,
    pub language_first: String,
    pub language_second: String,
    pub is_split: String,
}

impl PullPath {
    pub fn split(&self) -> bool {
        self.is_split.eq_ignore_ascii_case("true")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    pub user_id: Option<String>,
    #[serde(default)]
    pub is_guest_mode: bool,
    #[serde(default)]
    pub curr_host_user_id: Option<String>,
    /// Session that should receive the per-message unicasts.
    #[serde(default)]
    pub socket_id: Option<Uuid>,
    #[serde(default)]
    pub low_cost_mode: CostMode,
    /// Comma-separated message ids; non-numeric entries are ignored.
    #[serde(default, rename = "message_ids")]
    pub message_ids: Option<String>,
}

impl PullQuery {
    pub fn parsed_message_ids(&self) -> Vec<i64> {
        self.message_ids
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter_map(|id| id.trim().parse::<i64>().ok())
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<MessageView>,
}

// -- History --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearHistoryQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearHistoryResponse {
    pub message: String,
    pub deleted: usize,
}

// -- Preview --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewTranslateRequest {
    #[serde(rename = "user_id")]
    pub user_id: String,
    pub language: String,
    pub text: String,
    #[serde(default)]
    pub low_cost_mode: CostMode,
    #[serde(default)]
    pub is_guest_mode: bool,
    #[serde(default)]
    pub curr_host_user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreviewTranslateResponse {
    pub translation: String,
    pub tokens_used: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
