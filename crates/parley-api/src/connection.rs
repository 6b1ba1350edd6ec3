use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_chat::SpeakingPhase;
use parley_types::events::{ClientCommand, ServerEvent};

use crate::AppState;
use crate::error::{failure_event, rejected_command};

/// Server pings every 15 seconds. Two missed pongs drop the connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Run one client connection until either side closes.
pub async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let dispatcher = state.coordinator.dispatcher().clone();

    let (session_id, mut session_rx) = dispatcher.register_session().await;
    info!(session = %session_id, "Client connected to gateway");

    // Tell the client its session id so HTTP pulls can target it
    let connected = ServerEvent::Connected { session_id };
    match serde_json::to_string(&connected) {
        Ok(text) => {
            if sender.send(Message::Text(text.into())).await.is_err() {
                dispatcher.unregister_session(session_id).await;
                return;
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode connected event"),
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                frame = session_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if sender.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(session = %session_id, missed_heartbeats, "Heartbeat timeout, dropping connection");
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        // Events run concurrently; per-message ordering is enforced by the store
                        let state = recv_state.clone();
                        tokio::spawn(async move {
                            handle_command(&state, session_id, cmd).await;
                        });
                    }
                    Err(e) => {
                        let raw: String = text.chars().take(200).collect();
                        warn!(session = %session_id, error = %e, raw = %raw, "Bad command");
                        let event = rejected_command(&text, &e);
                        recv_state.coordinator.dispatcher().unicast(session_id, &event).await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister_session(session_id).await;
    info!(session = %session_id, "Client disconnected from gateway");
}

/// Route one command to the coordinator. Failures go back to the sender only.
pub async fn handle_command(state: &AppState, session_id: Uuid, cmd: ClientCommand) {
    let command = cmd.name();
    let coordinator = &state.coordinator;
    debug!(session = %session_id, command, "Command received");

    let failure = match cmd {
        ClientCommand::JoinRoom(join) => coordinator.join_room(session_id, join).await.err(),
        ClientCommand::LeaveRoom(leave) => {
            coordinator.leave_room(session_id, leave.chatroom_id).await;
            None
        }
        ClientCommand::UploadText(upload) => coordinator.upload_text(upload).await.err(),
        ClientCommand::UploadAudio(upload) => coordinator.upload_audio(upload).await.err(),
        ClientCommand::UploadPhoto(upload) => coordinator.upload_photo(upload).await.err(),
        ClientCommand::EditExistedText(edit) => coordinator.edit_message(edit).await.err(),
        ClientCommand::RecallMessage(recall) => coordinator.recall_message(recall).await.err(),
        ClientCommand::UserSpeakingFromClientStart(signal) => {
            coordinator.relay_speaking(SpeakingPhase::Start, signal).await.err()
        }
        ClientCommand::UserSpeakingFromClientStop(signal) => {
            coordinator.relay_speaking(SpeakingPhase::Stop, signal).await.err()
        }
        ClientCommand::UserSpeakingFromClientContentTranscript(signal) => {
            coordinator.relay_speaking(SpeakingPhase::Transcript, signal).await.err()
        }
    };

    if let Some(error) = failure {
        let event = failure_event(command, &error);
        coordinator.dispatcher().unicast(session_id, &event).await;
    }
}
