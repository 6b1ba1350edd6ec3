use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{error, warn};

use parley_chat::ChatError;
use parley_types::api::ErrorResponse;
use parley_types::events::ServerEvent;

/// HTTP face of a [`ChatError`].
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Unauthorized(_) => StatusCode::FORBIDDEN,
            ChatError::TranslationFailed(_) => StatusCode::BAD_GATEWAY,
            ChatError::InsufficientState(_) => StatusCode::GONE,
            ChatError::PersistenceConflict(_) => StatusCode::CONFLICT,
            ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
            "Internal server error".to_string()
        } else {
            warn!(status = status.as_u16(), error = %self.0, "Request rejected");
            self.0.to_string()
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

/// Socket event reporting a failed command back to the session that sent it.
pub fn failure_event(command: &str, error: &ChatError) -> ServerEvent {
    let error = match error {
        ChatError::Storage(_) => "Internal server error".to_string(),
        other => other.to_string(),
    };
    match command {
        "upload_text" => ServerEvent::TextUploadFailed { error },
        "upload_audio" => ServerEvent::AudioUploadFailed { error },
        "upload_photo" => ServerEvent::PhotoUploadFailed { error },
        _ => ServerEvent::OperationFailed {
            command: command.to_string(),
            error,
        },
    }
}

/// Socket event for a frame that did not parse as a command. The event
/// name is echoed back when the envelope itself was readable.
pub fn rejected_command(raw: &str, error: &serde_json::Error) -> ServerEvent {
    let command = serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| value.get("event").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    ServerEvent::OperationFailed {
        command,
        error: format!("Malformed command: {}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_kind() {
        let cases = [
            (ChatError::not_found("Message 1"), StatusCode::NOT_FOUND),
            (ChatError::Unauthorized("x".into()), StatusCode::FORBIDDEN),
            (ChatError::InsufficientState("x".into()), StatusCode::GONE),
            (ChatError::PersistenceConflict("x".into()), StatusCode::CONFLICT),
            (ChatError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (ChatError::Storage(anyhow_error()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError(error).status(), status);
        }
    }

    #[test]
    fn uploads_get_their_own_failure_events() {
        let error = ChatError::InvalidRequest("bad".into());
        assert_eq!(failure_event("upload_audio", &error).name(), "audio_upload_failed");
        assert_eq!(failure_event("recall_message", &error).name(), "operation_failed");
    }

    #[test]
    fn storage_details_are_not_leaked() {
        let event = failure_event("upload_text", &ChatError::Storage(anyhow_error()));
        let ServerEvent::TextUploadFailed { error } = event else {
            panic!("expected text_upload_failed");
        };
        assert_eq!(error, "Internal server error");
    }

    #[test]
    fn malformed_commands_are_reported_by_name() {
        let raw = r#"{"event":"upload_text","data":{"userId":"alice"}}"#;
        let error = serde_json::from_str::<parley_types::events::ClientCommand>(raw).unwrap_err();
        let ServerEvent::OperationFailed { command, error } = rejected_command(raw, &error) else {
            panic!("expected operation_failed");
        };
        assert_eq!(command, "upload_text");
        assert!(error.starts_with("Malformed command"));

        let garbage = "not json";
        let error = serde_json::from_str::<serde_json::Value>(garbage).unwrap_err();
        let ServerEvent::OperationFailed { command, .. } = rejected_command(garbage, &error) else {
            panic!("expected operation_failed");
        };
        assert_eq!(command, "unknown");
    }

    fn anyhow_error() -> anyhow::Error {
        anyhow::anyhow!("disk on fire")
    }
}
