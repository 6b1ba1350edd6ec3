use crate::Database;
use crate::models::{
    ChatRoomRow, MessageRow, NewMessageRow, NewUsage, TranslationRow, UsageRow, UserRow, ViewerRow,
};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, Row, params};

/// Outcome of a metered first view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstView {
    /// Ledger entry written and the payer debited in one transaction.
    Recorded,
    /// Viewer already in the ledger for this key; nothing written.
    AlreadyViewed,
    /// Paying account does not exist; nothing written.
    PayerMissing,
}

const MESSAGE_COLUMNS: &str = "id, user_id, username, chatroom_id, original_ciphertext, original_nonce,
     content_type, media_ref, is_recalled, is_edited, reply_to_message_id,
     audio_duration_minutes, created_at";

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        user_id: &str,
        username: &str,
        email: &str,
        password: &str,
        is_placeholder: bool,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (user_id, username, email, password, is_placeholder)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, username, email, password, is_placeholder],
            )?;
            Ok(())
        })
    }

    /// Insert unless a user with this id already exists. Returns whether a
    /// row was written.
    pub fn create_user_if_absent(
        &self,
        user_id: &str,
        username: &str,
        email: &str,
        password: &str,
        is_placeholder: bool,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (user_id, username, email, password, is_placeholder)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, username, email, password, is_placeholder],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn set_avatar(&self, user_id: &str, avatar: Option<&str>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET avatar = ?1 WHERE user_id = ?2",
                params![avatar, user_id],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, user_id))
    }

    pub fn get_balance(&self, user_id: &str) -> Result<Option<f64>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT tokens FROM users WHERE user_id = ?1", [user_id], |row| {
                row.get(0)
            })
            .optional()
        })
    }

    /// Atomic decrement. No floor: balances may go negative.
    /// Returns false if the user does not exist.
    pub fn debit_tokens(&self, user_id: &str, amount: f64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET tokens = tokens - ?1 WHERE user_id = ?2",
                params![amount, user_id],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn credit_tokens(&self, user_id: &str, amount: f64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET tokens = tokens + ?1 WHERE user_id = ?2",
                params![amount, user_id],
            )?;
            Ok(changed == 1)
        })
    }

    /// Debit for a preview translation and bump the preview counter together.
    pub fn charge_preview(&self, user_id: &str, amount: f64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users
                 SET tokens = tokens - ?1, preview_message_count = preview_message_count + 1
                 WHERE user_id = ?2",
                params![amount, user_id],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn set_last_used_chatroom(&self, user_id: &str, chatroom_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_used_chatroom_id = ?1 WHERE user_id = ?2",
                params![chatroom_id, user_id],
            )?;
            Ok(())
        })
    }

    pub fn set_private_room(&self, user_id: &str, chatroom_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET private_room_id = ?1 WHERE user_id = ?2",
                params![chatroom_id, user_id],
            )?;
            Ok(())
        })
    }

    // -- Chatrooms --

    /// Create a chatroom; the creator is enrolled as its first participant.
    pub fn create_chatroom(&self, name: &str, creator_id: &str, is_private: bool) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chatrooms (name, creator_id, is_private) VALUES (?1, ?2, ?3)",
                params![name, creator_id, is_private],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO chatroom_participants (chatroom_id, user_id) VALUES (?1, ?2)",
                params![id, creator_id],
            )?;
            tx.commit()?;
            Ok(id)
        })
    }

    pub fn get_chatroom(&self, id: i64) -> Result<Option<ChatRoomRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, creator_id, is_private, is_invisible, created_at
                     FROM chatrooms WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(ChatRoomRow {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            creator_id: row.get(2)?,
                            is_private: row.get(3)?,
                            is_invisible: row.get(4)?,
                            participants: Vec::new(),
                            created_at: row.get(5)?,
                        })
                    },
                )
                .optional()?;

            let Some(mut room) = row else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT user_id FROM chatroom_participants WHERE chatroom_id = ?1 ORDER BY user_id",
            )?;
            room.participants = stmt
                .query_map([id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;

            Ok(Some(room))
        })
    }

    pub fn add_participant(&self, chatroom_id: i64, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO chatroom_participants (chatroom_id, user_id) VALUES (?1, ?2)",
                params![chatroom_id, user_id],
            )?;
            Ok(())
        })
    }

    pub fn remove_participant(&self, chatroom_id: i64, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM chatroom_participants WHERE chatroom_id = ?1 AND user_id = ?2",
                params![chatroom_id, user_id],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn set_chatroom_invisible(&self, chatroom_id: i64, invisible: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE chatrooms SET is_invisible = ?1 WHERE id = ?2",
                params![invisible, chatroom_id],
            )?;
            Ok(())
        })
    }

    // -- Messages --

    pub fn insert_message(&self, message: &NewMessageRow<'_>) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (user_id, username, chatroom_id, original_ciphertext,
                     original_nonce, content_type, media_ref, reply_to_message_id,
                     audio_duration_minutes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    message.user_id,
                    message.username,
                    message.chatroom_id,
                    message.original_ciphertext,
                    message.original_nonce,
                    message.content_type,
                    message.media_ref,
                    message.reply_to_message_id,
                    message.audio_duration_minutes,
                    message.created_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                [id],
                map_message,
            )
            .optional()
        })
    }

    /// Messages of a room in ascending creation order, optionally limited to `ids`.
    pub fn list_messages(&self, chatroom_id: i64, ids: &[i64]) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut sql = format!("SELECT {} FROM messages WHERE chatroom_id = ?1", MESSAGE_COLUMNS);
            let mut values: Vec<i64> = Vec::with_capacity(ids.len() + 1);
            values.push(chatroom_id);

            if !ids.is_empty() {
                let placeholders: Vec<String> =
                    (2..=ids.len() + 1).map(|i| format!("?{}", i)).collect();
                sql.push_str(&format!(" AND id IN ({})", placeholders.join(", ")));
                values.extend_from_slice(ids);
            }
            sql.push_str(" ORDER BY created_at ASC, id ASC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(values.iter()), map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Replace the sealed original text and mark the message edited.
    pub fn update_original_text(&self, id: i64, ciphertext: &[u8], nonce: &[u8]) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET original_ciphertext = ?1, original_nonce = ?2, is_edited = 1
                 WHERE id = ?3",
                params![ciphertext, nonce, id],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn set_recalled(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute("UPDATE messages SET is_recalled = 1 WHERE id = ?1", [id])?;
            Ok(changed == 1)
        })
    }

    /// Hard-delete every message of a room. Translation, usage and ledger
    /// rows go with them.
    pub fn delete_chatroom_messages(&self, chatroom_id: i64) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM messages WHERE chatroom_id = ?1", [chatroom_id])?;
            Ok(deleted)
        })
    }

    // -- Translations --

    pub fn get_translations(&self, message_id: i64) -> Result<Vec<TranslationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT language_key, ciphertext, nonce FROM message_translations
                 WHERE message_id = ?1 ORDER BY language_key",
            )?;
            let rows = stmt
                .query_map([message_id], |row| {
                    Ok(TranslationRow {
                        language_key: row.get(0)?,
                        ciphertext: row.get(1)?,
                        nonce: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_usage(&self, message_id: i64) -> Result<Vec<UsageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT language_key, model, prompt_tokens, completion_tokens, total_tokens,
                        cost_full, cost_reduced, produced_at
                 FROM translation_usage WHERE message_id = ?1 ORDER BY language_key",
            )?;
            let rows = stmt
                .query_map([message_id], map_usage)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_usage_for(&self, message_id: i64, language_key: &str) -> Result<Option<UsageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT language_key, model, prompt_tokens, completion_tokens, total_tokens,
                        cost_full, cost_reduced, produced_at
                 FROM translation_usage WHERE message_id = ?1 AND language_key = ?2",
                params![message_id, language_key],
                map_usage,
            )
            .optional()
        })
    }

    pub fn get_viewers(&self, message_id: i64) -> Result<Vec<ViewerRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT language_key, viewer_id, viewed_at FROM translation_viewers
                 WHERE message_id = ?1 ORDER BY language_key, viewed_at",
            )?;
            let rows = stmt
                .query_map([message_id], |row| {
                    Ok(ViewerRow {
                        language_key: row.get(0)?,
                        viewer_id: row.get(1)?,
                        viewed_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Insert or overwrite a translation slot with its usage record.
    /// Returns true if the slot was new, false if an existing one was overwritten.
    pub fn upsert_translation(
        &self,
        message_id: i64,
        language_key: &str,
        ciphertext: &[u8],
        nonce: &[u8],
        usage: &NewUsage<'_>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let existed: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM message_translations
                               WHERE message_id = ?1 AND language_key = ?2)",
                params![message_id, language_key],
                |row| row.get(0),
            )?;

            let (prev_full, prev_reduced): (f64, f64) = if existed {
                tx.query_row(
                    "SELECT cost_full, cost_reduced FROM translation_usage
                     WHERE message_id = ?1 AND language_key = ?2",
                    params![message_id, language_key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .unwrap_or((0.0, 0.0))
            } else {
                (0.0, 0.0)
            };

            tx.execute(
                "INSERT INTO message_translations (message_id, language_key, ciphertext, nonce)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(message_id, language_key)
                 DO UPDATE SET ciphertext = excluded.ciphertext, nonce = excluded.nonce",
                params![message_id, language_key, ciphertext, nonce],
            )?;

            tx.execute(
                "INSERT INTO translation_usage (message_id, language_key, model, prompt_tokens,
                     completion_tokens, total_tokens, cost_full, cost_reduced, produced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(message_id, language_key)
                 DO UPDATE SET model = excluded.model,
                               prompt_tokens = excluded.prompt_tokens,
                               completion_tokens = excluded.completion_tokens,
                               total_tokens = excluded.total_tokens,
                               cost_full = excluded.cost_full,
                               cost_reduced = excluded.cost_reduced,
                               produced_at = excluded.produced_at",
                params![
                    message_id,
                    language_key,
                    usage.model,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    usage.total_tokens,
                    prev_full + usage.cost_full,
                    prev_reduced + usage.cost_reduced,
                    usage.produced_at,
                ],
            )?;

            tx.commit()?;
            Ok(!existed)
        })
    }

    /// Drop a translation slot and its usage. Ledger rows are kept.
    pub fn delete_translation(&self, message_id: i64, language_key: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "DELETE FROM message_translations WHERE message_id = ?1 AND language_key = ?2",
                params![message_id, language_key],
            )?;
            tx.execute(
                "DELETE FROM translation_usage WHERE message_id = ?1 AND language_key = ?2",
                params![message_id, language_key],
            )?;
            tx.commit()?;
            Ok(changed == 1)
        })
    }

    /// Ledger insert and payer debit as one transaction: either both happen
    /// or neither does.
    pub fn record_first_view(
        &self,
        message_id: i64,
        language_key: &str,
        viewer_id: &str,
        payer_id: &str,
        amount: f64,
        viewed_at: &str,
    ) -> Result<FirstView> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let seen: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM translation_viewers
                               WHERE message_id = ?1 AND language_key = ?2 AND viewer_id = ?3)",
                params![message_id, language_key, viewer_id],
                |row| row.get(0),
            )?;
            if seen {
                return Ok(FirstView::AlreadyViewed);
            }

            let payer_exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE user_id = ?1)",
                [payer_id],
                |row| row.get(0),
            )?;
            if !payer_exists {
                return Ok(FirstView::PayerMissing);
            }

            tx.execute(
                "INSERT INTO translation_viewers (message_id, language_key, viewer_id, viewed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![message_id, language_key, viewer_id, viewed_at],
            )?;

            if amount != 0.0 {
                let debited = tx.execute(
                    "UPDATE users SET tokens = tokens - ?1 WHERE user_id = ?2",
                    params![amount, payer_id],
                )?;
                if debited != 1 {
                    return Err(anyhow!("Debit of payer {} failed", payer_id));
                }
            }

            tx.commit()?;
            Ok(FirstView::Recorded)
        })
    }
}

fn query_user(conn: &Connection, user_id: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, username, email, tokens, private_room_id, last_used_chatroom_id,
                preview_message_count, is_placeholder, avatar, created_at
         FROM users WHERE user_id = ?1",
    )?;

    let row = stmt
        .query_row([user_id], |row| {
            Ok(UserRow {
                user_id: row.get(0)?,
                username: row.get(1)?,
                email: row.get(2)?,
                tokens: row.get(3)?,
                private_room_id: row.get(4)?,
                last_used_chatroom_id: row.get(5)?,
                preview_message_count: row.get(6)?,
                is_placeholder: row.get(7)?,
                avatar: row.get(8)?,
                created_at: row.get(9)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        chatroom_id: row.get(3)?,
        original_ciphertext: row.get(4)?,
        original_nonce: row.get(5)?,
        content_type: row.get(6)?,
        media_ref: row.get(7)?,
        is_recalled: row.get(8)?,
        is_edited: row.get(9)?,
        reply_to_message_id: row.get(10)?,
        audio_duration_minutes: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn map_usage(row: &Row<'_>) -> rusqlite::Result<UsageRow> {
    Ok(UsageRow {
        language_key: row.get(0)?,
        model: row.get(1)?,
        prompt_tokens: row.get(2)?,
        completion_tokens: row.get(3)?,
        total_tokens: row.get(4)?,
        cost_full: row.get(5)?,
        cost_reduced: row.get(6)?,
        produced_at: row.get(7)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        db.create_user("owner", "Owner", "owner@test", "pw", false).unwrap();
        db.create_user("alice", "Alice", "alice@test", "pw", false).unwrap();
        let room = db.create_chatroom("lobby", "owner", false).unwrap();
        (db, room)
    }

    fn insert(db: &Database, room: i64, created_at: &str) -> i64 {
        db.insert_message(&NewMessageRow {
            user_id: "owner",
            username: "Owner",
            chatroom_id: room,
            original_ciphertext: b"sealed",
            original_nonce: b"nonce-bytes!",
            content_type: "text",
            media_ref: None,
            reply_to_message_id: None,
            audio_duration_minutes: 0.0,
            created_at,
        })
        .unwrap()
    }

    fn usage(cost_full: f64, cost_reduced: f64) -> NewUsage<'static> {
        NewUsage {
            model: "gpt-4o-mini",
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            cost_full,
            cost_reduced,
            produced_at: "2025-01-01T00:00:00.000000Z",
        }
    }

    #[test]
    fn creator_is_enrolled_as_participant() {
        let (db, room) = seeded();
        let row = db.get_chatroom(room).unwrap().unwrap();
        assert_eq!(row.participants, vec!["owner".to_string()]);
        assert!(db.get_chatroom(room + 100).unwrap().is_none());
    }

    #[test]
    fn create_if_absent_keeps_the_first_row() {
        let (db, _) = seeded();
        assert!(db.create_user_if_absent("new", "First", "a@x", "pw", true).unwrap());
        assert!(!db.create_user_if_absent("new", "Second", "b@x", "pw", true).unwrap());

        let row = db.get_user("new").unwrap().unwrap();
        assert_eq!(row.username, "First");
        assert_eq!(row.avatar, None);

        assert!(db.set_avatar("new", Some("avatars/new.png")).unwrap());
        assert_eq!(db.get_user("new").unwrap().unwrap().avatar.as_deref(), Some("avatars/new.png"));
    }

    #[test]
    fn debit_allows_negative_balance() {
        let (db, _) = seeded();
        assert!(db.credit_tokens("alice", 1.0).unwrap());
        assert!(db.debit_tokens("alice", 2.5).unwrap());
        assert_eq!(db.get_balance("alice").unwrap(), Some(-1.5));
        assert!(!db.debit_tokens("nobody", 1.0).unwrap());
    }

    #[test]
    fn first_view_is_recorded_once() {
        let (db, room) = seeded();
        let id = insert(&db, room, "2025-01-01T00:00:00.000000Z");

        let first = db.record_first_view(id, "fr", "alice", "alice", 0.25, "t1").unwrap();
        let second = db.record_first_view(id, "fr", "alice", "alice", 0.25, "t2").unwrap();

        assert_eq!(first, FirstView::Recorded);
        assert_eq!(second, FirstView::AlreadyViewed);
        assert_eq!(db.get_balance("alice").unwrap(), Some(-0.25));
        assert_eq!(db.get_viewers(id).unwrap().len(), 1);
    }

    #[test]
    fn missing_payer_writes_nothing() {
        let (db, room) = seeded();
        let id = insert(&db, room, "2025-01-01T00:00:00.000000Z");

        let outcome = db.record_first_view(id, "fr", "alice", "ghost", 1.0, "t1").unwrap();
        assert_eq!(outcome, FirstView::PayerMissing);
        assert!(db.get_viewers(id).unwrap().is_empty());
    }

    #[test]
    fn overwrite_accumulates_costs() {
        let (db, room) = seeded();
        let id = insert(&db, room, "2025-01-01T00:00:00.000000Z");

        assert!(db.upsert_translation(id, "fr", b"a", b"n", &usage(1.0, 0.1)).unwrap());
        assert!(!db.upsert_translation(id, "fr", b"b", b"n", &usage(2.0, 0.2)).unwrap());

        let row = db.get_usage_for(id, "fr").unwrap().unwrap();
        assert!((row.cost_full - 3.0).abs() < 1e-12);
        assert!((row.cost_reduced - 0.3).abs() < 1e-12);
        assert_eq!(db.get_translations(id).unwrap()[0].ciphertext, b"b");
    }

    #[test]
    fn clearing_history_cascades() {
        let (db, room) = seeded();
        let id = insert(&db, room, "2025-01-01T00:00:00.000000Z");
        db.upsert_translation(id, "fr", b"a", b"n", &usage(1.0, 0.1)).unwrap();
        db.record_first_view(id, "fr", "alice", "alice", 0.0, "t1").unwrap();

        assert_eq!(db.delete_chatroom_messages(room).unwrap(), 1);
        assert!(db.get_message(id).unwrap().is_none());
        assert!(db.get_translations(id).unwrap().is_empty());
        assert!(db.get_viewers(id).unwrap().is_empty());
    }

    #[test]
    fn listing_is_ascending_and_filterable() {
        let (db, room) = seeded();
        let late = insert(&db, room, "2025-01-02T00:00:00.000000Z");
        let early = insert(&db, room, "2025-01-01T00:00:00.000000Z");

        let all: Vec<i64> = db.list_messages(room, &[]).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(all, vec![early, late]);

        let some: Vec<i64> = db.list_messages(room, &[late]).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(some, vec![late]);
    }
}
