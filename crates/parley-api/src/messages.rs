use axum::{
    Json,
    extract::{Path, Query, State},
};
use tracing::info;

use parley_chat::PullRequest;
use parley_types::api::{
    ClearHistoryQuery, ClearHistoryResponse, MessagesResponse, PreviewTranslateRequest,
    PreviewTranslateResponse, PullPath, PullQuery,
};

use crate::AppState;
use crate::error::ApiError;

/// Priced views of the requested messages. Each view is also unicast to
/// `socketId` when the caller passes one.
pub async fn get_messages_on_demand(
    State(state): State<AppState>,
    Path(path): Path<PullPath>,
    Query(query): Query<PullQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let request = PullRequest::from_http(&path, &query)?;
    let messages = state
        .coordinator
        .fetch_on_demand(request, query.socket_id)
        .await?;
    Ok(Json(MessagesResponse { messages }))
}

/// Priced views of every message in the room, each re-broadcast to the room.
pub async fn get_all_messages(
    State(state): State<AppState>,
    Path(path): Path<PullPath>,
    Query(query): Query<PullQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let request = PullRequest::from_http(&path, &query)?;
    let messages = state.coordinator.fetch_all(request).await?;
    Ok(Json(MessagesResponse { messages }))
}

pub async fn clear_history(
    State(state): State<AppState>,
    Path(chatroom_id): Path<i64>,
    Query(query): Query<ClearHistoryQuery>,
) -> Result<Json<ClearHistoryResponse>, ApiError> {
    let deleted = state
        .coordinator
        .clear_history(chatroom_id, &query.user_id)
        .await?;

    info!(chatroom_id, user_id = %query.user_id, deleted, "History cleared over HTTP");
    Ok(Json(ClearHistoryResponse {
        message: format!("Message history for chatroom {} has been cleared.", chatroom_id),
        deleted,
    }))
}

pub async fn preview_translate(
    State(state): State<AppState>,
    Json(req): Json<PreviewTranslateRequest>,
) -> Result<Json<PreviewTranslateResponse>, ApiError> {
    let response = state.coordinator.preview_translate(req).await?;
    Ok(Json(response))
}
