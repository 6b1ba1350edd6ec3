use parley_translate::GatewayError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Message, chatroom or user absent
    #[error("{0} not found")]
    NotFound(String),

    /// Non-participant or non-owner action
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    TranslationFailed(#[from] GatewayError),

    /// The target exists but is in a state that forbids the operation
    #[error("{0}")]
    InsufficientState(String),

    /// Per-message lock could not be acquired in time
    #[error("Conflict: {0}")]
    PersistenceConflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }
}
