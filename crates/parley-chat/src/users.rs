use std::sync::Arc;

use argon2::{
    Argon2, PasswordHasher,
    password_hash::{SaltString, rand_core::OsRng},
};
use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::info;

use parley_db::Database;
use parley_db::models::UserRow;
use parley_types::models::User;

use crate::error::{ChatError, Result};
use crate::store::blocking;

const PRIVATE_ROOM_NAME: &str = "Private";

/// Thin user directory over the durable store. User creation and private
/// room creation are separate steps.
#[derive(Clone)]
pub struct UserDirectory {
    db: Arc<Database>,
}

impl UserDirectory {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn get(&self, user_id: &str) -> Result<User> {
        self.find(user_id)
            .await?
            .ok_or_else(|| ChatError::not_found(format!("User {}", user_id)))
    }

    pub async fn find(&self, user_id: &str) -> Result<Option<User>> {
        let db = self.db.clone();
        let id = user_id.to_string();
        Ok(blocking(move || db.get_user(&id)).await?.map(to_user))
    }

    /// Get or create. Unknown ids become placeholder accounts with random,
    /// unusable credentials.
    pub async fn ensure_user(&self, user_id: &str, username: Option<&str>) -> Result<User> {
        if user_id.trim().is_empty() {
            return Err(ChatError::InvalidRequest("missing user id".into()));
        }

        let db = self.db.clone();
        let id = user_id.to_string();
        if let Some(row) = blocking(move || db.get_user(&id)).await? {
            return Ok(to_user(row));
        }

        let username = username
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(user_id)
            .to_string();
        let (email, password_hash) = placeholder_credentials()?;

        // Two first uploads of the same user may race here; the loser keeps the winner's row
        let db = self.db.clone();
        let id = user_id.to_string();
        let (created, row) = blocking(move || {
            let created = db.create_user_if_absent(&id, &username, &email, &password_hash, true)?;
            Ok((created, db.get_user(&id)?))
        })
        .await?;
        let row = row.ok_or_else(|| ChatError::not_found(format!("User {}", user_id)))?;

        if created {
            info!(user_id, "Placeholder user created");
        }
        Ok(to_user(row))
    }

    /// Second step after user creation: fetch the user's private room or
    /// create one with the user as creator and sole participant.
    pub async fn ensure_private_room(&self, user_id: &str) -> Result<i64> {
        let user = self.get(user_id).await?;

        if let Some(room_id) = user.private_room_id {
            let db = self.db.clone();
            if blocking(move || db.get_chatroom(room_id)).await?.is_some() {
                return Ok(room_id);
            }
        }

        let db = self.db.clone();
        let id = user_id.to_string();
        let room_id = blocking(move || {
            let room_id = db.create_chatroom(PRIVATE_ROOM_NAME, &id, true)?;
            db.set_private_room(&id, room_id)?;
            Ok(room_id)
        })
        .await?;

        info!(user_id, chatroom_id = room_id, "Private room created");
        Ok(room_id)
    }
}

fn placeholder_credentials() -> Result<(String, String)> {
    let secret: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    let email = format!("{}@placeholder.invalid", uuid::Uuid::new_v4());

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| ChatError::Storage(anyhow::anyhow!("Password hashing failed: {}", e)))?
        .to_string();

    Ok((email, password_hash))
}

fn to_user(row: UserRow) -> User {
    User {
        user_id: row.user_id,
        username: row.username,
        tokens: row.tokens,
        private_room_id: row.private_room_id,
        last_used_chatroom_id: row.last_used_chatroom_id,
        preview_message_count: row.preview_message_count,
        is_placeholder: row.is_placeholder,
        avatar: row.avatar,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> UserDirectory {
        UserDirectory::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn unknown_user_becomes_placeholder_once() {
        let users = directory();

        let first = users.ensure_user("u-1", Some("Ann")).await.unwrap();
        let again = users.ensure_user("u-1", Some("Other")).await.unwrap();

        assert!(first.is_placeholder);
        assert_eq!(first.username, "Ann");
        assert_eq!(again.username, "Ann");
        assert_eq!(first.tokens, 0.0);
    }

    #[tokio::test]
    async fn concurrent_first_uploads_share_one_user() {
        let users = directory();

        let attempts = (0..8).map(|i| {
            let users = users.clone();
            tokio::spawn(async move { users.ensure_user("u-race", Some(&format!("Name {}", i))).await })
        });
        let created: Vec<User> = futures_util::future::join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let first = &created[0].username;
        assert!(created.iter().all(|user| &user.username == first));
    }

    #[tokio::test]
    async fn private_room_is_created_then_reused() {
        let users = directory();
        users.ensure_user("u-1", None).await.unwrap();

        let room = users.ensure_private_room("u-1").await.unwrap();
        assert_eq!(users.ensure_private_room("u-1").await.unwrap(), room);

        let user = users.get("u-1").await.unwrap();
        assert_eq!(user.private_room_id, Some(room));
    }

    #[tokio::test]
    async fn blank_user_id_is_rejected() {
        let users = directory();
        assert!(matches!(
            users.ensure_user("  ", None).await,
            Err(ChatError::InvalidRequest(_))
        ));
    }
}
