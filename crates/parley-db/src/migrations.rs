use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            user_id                 TEXT PRIMARY KEY,
            username                TEXT NOT NULL,
            email                   TEXT NOT NULL UNIQUE,
            password                TEXT NOT NULL,
            tokens                  REAL NOT NULL DEFAULT 0,
            private_room_id         INTEGER,
            last_used_chatroom_id   INTEGER,
            preview_message_count   INTEGER NOT NULL DEFAULT 0,
            is_placeholder          INTEGER NOT NULL DEFAULT 0,
            avatar                  TEXT,
            created_at              TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS chatrooms (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT NOT NULL DEFAULT 'NewChatroom',
            creator_id      TEXT NOT NULL REFERENCES users(user_id),
            is_private      INTEGER NOT NULL DEFAULT 0,
            is_invisible    INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS chatroom_participants (
            chatroom_id     INTEGER NOT NULL REFERENCES chatrooms(id) ON DELETE CASCADE,
            user_id         TEXT NOT NULL REFERENCES users(user_id),
            PRIMARY KEY (chatroom_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id                 TEXT NOT NULL,
            username                TEXT NOT NULL,
            chatroom_id             INTEGER NOT NULL,
            original_ciphertext     BLOB NOT NULL,
            original_nonce          BLOB NOT NULL,
            content_type            TEXT NOT NULL DEFAULT 'text',
            media_ref               TEXT,
            is_recalled             INTEGER NOT NULL DEFAULT 0,
            is_edited               INTEGER NOT NULL DEFAULT 0,
            reply_to_message_id     INTEGER,
            audio_duration_minutes  REAL NOT NULL DEFAULT 0,
            created_at              TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chatroom
            ON messages(chatroom_id, created_at);

        CREATE TABLE IF NOT EXISTS message_translations (
            message_id      INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            language_key    TEXT NOT NULL,
            ciphertext      BLOB NOT NULL,
            nonce           BLOB NOT NULL,
            PRIMARY KEY (message_id, language_key)
        );

        CREATE TABLE IF NOT EXISTS translation_usage (
            message_id          INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            language_key        TEXT NOT NULL,
            model               TEXT NOT NULL,
            prompt_tokens       INTEGER NOT NULL,
            completion_tokens   INTEGER NOT NULL,
            total_tokens        INTEGER NOT NULL,
            cost_full           REAL NOT NULL,
            cost_reduced        REAL NOT NULL,
            produced_at         TEXT NOT NULL,
            PRIMARY KEY (message_id, language_key)
        );

        -- One row per (message, language, viewer): the billing idempotency boundary
        CREATE TABLE IF NOT EXISTS translation_viewers (
            message_id      INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            language_key    TEXT NOT NULL,
            viewer_id       TEXT NOT NULL,
            viewed_at       TEXT NOT NULL,
            PRIMARY KEY (message_id, language_key, viewer_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
