use std::collections::BTreeMap;

use parley_types::events::{MessageView, ReplyPreview};
use parley_types::models::Message;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Render a message for clients. `translations` is the map returned by the
/// priced read; `primary` selects `translated_text`.
pub fn message_view(
    message: &Message,
    translations: BTreeMap<String, String>,
    primary: Option<&str>,
    failed_translations: BTreeMap<String, String>,
    reply_to: Option<ReplyPreview>,
) -> MessageView {
    let translated_text = primary
        .and_then(|key| {
            translations
                .get(key)
                .or_else(|| failed_translations.get(key))
                .cloned()
        })
        .unwrap_or_default();

    MessageView {
        id: message.id,
        username: message.username.clone(),
        user_id: message.user_id.clone(),
        original_text: message.original_text.clone(),
        translated_text,
        content_type: message.content_type,
        timestamp: message.created_at.format(TIMESTAMP_FORMAT).to_string(),
        chatroom_id: message.chatroom_id,
        translations,
        failed_translations,
        is_recalled: message.is_recalled,
        is_edited: message.is_edited,
        recall_username: message.is_recalled.then(|| message.username.clone()),
        reply_to_message_id: message.reply_to_message_id,
        reply_to,
        media_ref: message.media_ref.clone(),
        audio_duration_minutes: message.audio_duration_minutes,
    }
}
