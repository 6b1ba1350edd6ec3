pub mod connection;
pub mod error;
pub mod messages;

use std::sync::Arc;

use axum::{
    Json, Router,
    routing::{delete, get, post},
};
use serde_json::{Value, json};

use parley_chat::Coordinator;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub coordinator: Coordinator,
}

/// All HTTP and WebSocket routes. Layers (CORS, tracing) are added by the binary.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/gateway", get(connection::ws_upgrade))
        .route(
            "/api/get-messages-on-demand/{chatroom_id}/{language}/{language_first}/{language_second}/{is_split}",
            get(messages::get_messages_on_demand),
        )
        .route(
            "/api/all-messages/{chatroom_id}/{language}/{language_first}/{language_second}/{is_split}",
            get(messages::get_all_messages),
        )
        .route("/api/clear-history/{chatroom_id}", delete(messages::clear_history))
        .route("/api/preview-translate", post(messages::preview_translate))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
