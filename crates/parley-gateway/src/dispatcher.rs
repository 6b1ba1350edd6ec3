use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, trace};
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::ServerEvent;

/// A serialized event, shared by every recipient of a broadcast.
pub type Frame = Utf8Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// The user was removed from the chatroom (or never was in it).
    NotParticipant,
    RoomNotFound,
}

struct Session {
    user_id: Option<String>,
    tx: mpsc::UnboundedSender<Frame>,
    rooms: HashSet<i64>,
}

/// Tracks live sessions and which chatrooms they listen to.
/// Nothing here is durable; a restart forgets every session.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// session_id -> session
    sessions: RwLock<HashMap<Uuid, Session>>,

    /// chatroom_id -> member sessions
    rooms: RwLock<HashMap<i64, HashSet<Uuid>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                sessions: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a new connection. Returns its session id and the receiver
    /// the connection loop drains.
    pub async fn register_session(&self) -> (Uuid, mpsc::UnboundedReceiver<Frame>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.sessions.write().await.insert(
            session_id,
            Session {
                user_id: None,
                tx,
                rooms: HashSet::new(),
            },
        );
        debug!(session = %session_id, "Session registered");
        (session_id, rx)
    }

    /// Drop a session and remove it from every room it joined.
    pub async fn unregister_session(&self, session_id: Uuid) {
        let Some(session) = self.inner.sessions.write().await.remove(&session_id) else {
            return;
        };

        let mut rooms = self.inner.rooms.write().await;
        for chatroom_id in &session.rooms {
            if let Some(members) = rooms.get_mut(chatroom_id) {
                members.remove(&session_id);
                if members.is_empty() {
                    rooms.remove(chatroom_id);
                }
            }
        }
        debug!(session = %session_id, rooms = session.rooms.len(), "Session unregistered");
    }

    pub async fn session_user(&self, session_id: Uuid) -> Option<String> {
        self.inner
            .sessions
            .read()
            .await
            .get(&session_id)
            .and_then(|s| s.user_id.clone())
    }

    /// Add a session to a chatroom after checking the durable membership.
    /// A successful join also records the room as the user's last used one.
    pub async fn join(
        &self,
        db: &Arc<Database>,
        chatroom_id: i64,
        session_id: Uuid,
        user_id: &str,
    ) -> anyhow::Result<JoinOutcome> {
        let room = {
            let db = db.clone();
            tokio::task::spawn_blocking(move || db.get_chatroom(chatroom_id)).await??
        };

        let Some(room) = room else {
            return Ok(JoinOutcome::RoomNotFound);
        };

        let admitted = room.creator_id == user_id || room.participants.iter().any(|p| p == user_id);
        if !admitted {
            // A stale membership from an earlier page load must not keep receiving events
            self.leave_room(chatroom_id, session_id).await;
            return Ok(JoinOutcome::NotParticipant);
        }

        {
            // Lock order is sessions then rooms, as in unregister_session, so a
            // concurrent disconnect either sees this room or makes the join fail
            let mut sessions = self.inner.sessions.write().await;
            let Some(session) = sessions.get_mut(&session_id) else {
                anyhow::bail!("Unknown session {}", session_id);
            };
            session.user_id = Some(user_id.to_string());
            session.rooms.insert(chatroom_id);

            self.inner
                .rooms
                .write()
                .await
                .entry(chatroom_id)
                .or_default()
                .insert(session_id);
        }

        {
            let db = db.clone();
            let user_id = user_id.to_string();
            tokio::task::spawn_blocking(move || db.set_last_used_chatroom(&user_id, chatroom_id))
                .await??;
        }

        debug!(chatroom_id, session = %session_id, user_id, "Joined room");
        Ok(JoinOutcome::Joined)
    }

    pub async fn leave_room(&self, chatroom_id: i64, session_id: Uuid) {
        if let Some(session) = self.inner.sessions.write().await.get_mut(&session_id) {
            session.rooms.remove(&chatroom_id);
        }

        let mut rooms = self.inner.rooms.write().await;
        if let Some(members) = rooms.get_mut(&chatroom_id) {
            members.remove(&session_id);
            if members.is_empty() {
                rooms.remove(&chatroom_id);
            }
        }
    }

    pub async fn members(&self, chatroom_id: i64) -> Vec<Uuid> {
        self.inner
            .rooms
            .read()
            .await
            .get(&chatroom_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Send to every live member of a room. Best effort: sessions that are
    /// gone simply miss the event. Returns the number of sessions reached.
    pub async fn broadcast(&self, chatroom_id: i64, event: &ServerEvent) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };

        let members = self.members(chatroom_id).await;
        let sessions = self.inner.sessions.read().await;

        let mut delivered = 0;
        for session_id in members {
            if let Some(session) = sessions.get(&session_id) {
                if session.tx.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        trace!(chatroom_id, event = event.name(), delivered, "Broadcast");
        delivered
    }

    /// Send to one session. Returns false if it is no longer connected.
    pub async fn unicast(&self, session_id: Uuid, event: &ServerEvent) -> bool {
        let Some(frame) = encode(event) else {
            return false;
        };

        let sessions = self.inner.sessions.read().await;
        let sent = sessions
            .get(&session_id)
            .is_some_and(|session| session.tx.send(frame).is_ok());

        trace!(session = %session_id, event = event.name(), sent, "Unicast");
        sent
    }
}

fn encode(event: &ServerEvent) -> Option<Frame> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Utf8Bytes::from(json)),
        Err(e) => {
            error!(event = event.name(), error = %e, "Failed to serialize event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Arc<Database> {
        let db = Database::open_in_memory().unwrap();
        db.create_user("owner", "Owner", "owner@test", "pw", false).unwrap();
        db.create_user("alice", "Alice", "alice@test", "pw", false).unwrap();
        db.create_user("mallory", "Mallory", "mallory@test", "pw", false).unwrap();
        Arc::new(db)
    }

    fn cleared(chatroom_id: i64) -> ServerEvent {
        ServerEvent::HistoryCleared {
            message: "cleared".into(),
            chatroom_id,
        }
    }

    #[tokio::test]
    async fn join_checks_durable_membership() {
        let db = db();
        let room = db.create_chatroom("lobby", "owner", false).unwrap();
        db.add_participant(room, "alice").unwrap();
        let dispatcher = Dispatcher::new();
        let (session, _rx) = dispatcher.register_session().await;

        assert_eq!(dispatcher.join(&db, room, session, "alice").await.unwrap(), JoinOutcome::Joined);
        assert_eq!(
            dispatcher.join(&db, room, session, "mallory").await.unwrap(),
            JoinOutcome::NotParticipant
        );
        assert_eq!(
            dispatcher.join(&db, room + 1, session, "alice").await.unwrap(),
            JoinOutcome::RoomNotFound
        );
        // The rejected re-join evicted the stale membership
        assert!(dispatcher.members(room).await.is_empty());
    }

    #[tokio::test]
    async fn join_records_last_used_room() {
        let db = db();
        let room = db.create_chatroom("lobby", "owner", false).unwrap();
        let dispatcher = Dispatcher::new();
        let (session, _rx) = dispatcher.register_session().await;

        dispatcher.join(&db, room, session, "owner").await.unwrap();
        assert_eq!(db.get_user("owner").unwrap().unwrap().last_used_chatroom_id, Some(room));
        assert_eq!(dispatcher.session_user(session).await.as_deref(), Some("owner"));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_tab_of_a_user() {
        let db = db();
        let room = db.create_chatroom("lobby", "owner", false).unwrap();
        let dispatcher = Dispatcher::new();
        let (tab_a, mut rx_a) = dispatcher.register_session().await;
        let (tab_b, mut rx_b) = dispatcher.register_session().await;
        let (outsider, mut rx_out) = dispatcher.register_session().await;

        dispatcher.join(&db, room, tab_a, "owner").await.unwrap();
        dispatcher.join(&db, room, tab_b, "owner").await.unwrap();
        let _ = outsider;

        assert_eq!(dispatcher.broadcast(room, &cleared(room)).await, 2);
        let frame = rx_a.recv().await.unwrap();
        assert!(frame.as_str().contains("history_cleared"));
        assert_eq!(rx_b.recv().await.unwrap(), frame);
        assert!(rx_out.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_removes_session_from_all_rooms() {
        let db = db();
        let first = db.create_chatroom("a", "owner", false).unwrap();
        let second = db.create_chatroom("b", "owner", false).unwrap();
        let dispatcher = Dispatcher::new();
        let (session, _rx) = dispatcher.register_session().await;

        dispatcher.join(&db, first, session, "owner").await.unwrap();
        dispatcher.join(&db, second, session, "owner").await.unwrap();
        dispatcher.unregister_session(session).await;

        assert!(dispatcher.members(first).await.is_empty());
        assert!(dispatcher.members(second).await.is_empty());
        assert!(!dispatcher.unicast(session, &cleared(first)).await);
    }

    #[tokio::test]
    async fn disconnected_session_cannot_join() {
        let db = db();
        let room = db.create_chatroom("lobby", "owner", false).unwrap();
        let dispatcher = Dispatcher::new();
        let (session, _rx) = dispatcher.register_session().await;
        dispatcher.unregister_session(session).await;

        assert!(dispatcher.join(&db, room, session, "owner").await.is_err());
        assert!(dispatcher.members(room).await.is_empty());
    }

    #[tokio::test]
    async fn join_racing_a_disconnect_leaves_no_member() {
        let db = db();
        let room = db.create_chatroom("lobby", "owner", false).unwrap();
        let dispatcher = Dispatcher::new();

        for _ in 0..32 {
            let (session, _rx) = dispatcher.register_session().await;
            let joining = {
                let dispatcher = dispatcher.clone();
                let db = db.clone();
                tokio::spawn(async move { dispatcher.join(&db, room, session, "owner").await })
            };
            let leaving = {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.unregister_session(session).await })
            };
            let _ = joining.await.unwrap();
            leaving.await.unwrap();
        }

        assert!(dispatcher.members(room).await.is_empty());
    }

    #[tokio::test]
    async fn unicast_targets_one_session() {
        let dispatcher = Dispatcher::new();
        let (a, mut rx_a) = dispatcher.register_session().await;
        let (_b, mut rx_b) = dispatcher.register_session().await;

        assert!(dispatcher.unicast(a, &cleared(1)).await);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_room_stops_delivery() {
        let db = db();
        let room = db.create_chatroom("lobby", "owner", false).unwrap();
        let dispatcher = Dispatcher::new();
        let (session, mut rx) = dispatcher.register_session().await;

        dispatcher.join(&db, room, session, "owner").await.unwrap();
        dispatcher.leave_room(room, session).await;

        assert_eq!(dispatcher.broadcast(room, &cleared(room)).await, 0);
        assert!(rx.try_recv().is_err());
    }
}
