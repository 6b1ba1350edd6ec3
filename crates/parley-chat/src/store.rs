//! Message persistence and the metered translation read.
//!
//! Every mutation of a message's translation slots, and every priced read,
//! happens while holding that message's lock (see [`MessageStore::lock`]).
//! The lock only covers database work. Provider calls run outside it,
//! under the slot reservation of [`MessageStore::reserve_slot`].
//! The ledger insert and the payer debit are one SQLite transaction.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use parley_crypto::TextCipher;
use parley_db::models::{MessageRow, NewMessageRow, NewUsage};
use parley_db::{Database, FirstView};
use parley_types::events::ReplyPreview;
use parley_types::models::{
    ContentType, CostMode, Message, ORIGINAL_TEXT_RAW, TranslationUsage, Usage,
};

use crate::error::{ChatError, Result};
use crate::locks::{MessageLocks, SlotLocks};
use crate::pricing::PricingCalculator;

const REPLY_EXCERPT_CHARS: usize = 80;

/// Input of [`MessageStore::create`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub user_id: String,
    pub username: String,
    pub chatroom_id: i64,
    pub original_text: String,
    pub content_type: ContentType,
    pub media_ref: Option<String>,
    pub reply_to_message_id: Option<i64>,
    pub audio_duration_minutes: f64,
}

/// Who looks at a translation and who pays for the look.
/// In guest mode the two differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingIdentity {
    pub viewer_id: String,
    pub payer_id: String,
}

impl BillingIdentity {
    pub fn own(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            viewer_id: user_id.clone(),
            payer_id: user_id,
        }
    }

    pub fn new(viewer_id: impl Into<String>, payer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            payer_id: payer_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Charge {
    /// First view: the ledger entry was written and the payer debited this amount.
    Billed(f64),
    AlreadyViewed,
    /// The language key has no translation yet; nothing was charged.
    NotMaterialized,
    /// The paying account does not exist; nothing was charged.
    PayerMissing,
}

#[derive(Debug, Clone)]
pub struct PricedTranslations {
    pub translations: BTreeMap<String, String>,
    pub charge: Charge,
}

pub struct MessageStore {
    db: Arc<Database>,
    cipher: TextCipher,
    pricing: PricingCalculator,
    locks: MessageLocks,
    slots: SlotLocks,
}

/// Exclusive hold on one message. Drop it to release.
pub struct LockedMessage<'a> {
    store: &'a MessageStore,
    message_id: i64,
    _guard: OwnedMutexGuard<()>,
}

impl MessageStore {
    pub fn new(
        db: Arc<Database>,
        cipher: TextCipher,
        pricing: PricingCalculator,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            db,
            cipher,
            pricing,
            locks: MessageLocks::new(lock_timeout),
            slots: SlotLocks::new(),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn pricing(&self) -> &PricingCalculator {
        &self.pricing
    }

    pub async fn lock(&self, message_id: i64) -> Result<LockedMessage<'_>> {
        let guard = self.locks.acquire(message_id).await?;
        Ok(LockedMessage {
            store: self,
            message_id,
            _guard: guard,
        })
    }

    /// Serialize materialization of one translation slot. Hold the guard
    /// across the provider call, not the message lock.
    pub async fn reserve_slot(&self, message_id: i64, language_key: &str) -> Result<OwnedMutexGuard<()>> {
        self.slots.acquire(message_id, language_key).await
    }

    /// Persist a new message. The untranslated mirror under
    /// `original_text_raw` is written in the same call.
    pub async fn create(&self, new: NewMessage) -> Result<Message> {
        let sealed = self.cipher.encrypt(&new.original_text)?;
        let created_at = now_stamp();

        let id = {
            let db = self.db.clone();
            let new = new.clone();
            let created_at = created_at.clone();
            blocking(move || {
                db.insert_message(&NewMessageRow {
                    user_id: &new.user_id,
                    username: &new.username,
                    chatroom_id: new.chatroom_id,
                    original_ciphertext: &sealed.ciphertext,
                    original_nonce: &sealed.nonce,
                    content_type: new.content_type.as_str(),
                    media_ref: new.media_ref.as_deref(),
                    reply_to_message_id: new.reply_to_message_id,
                    audio_duration_minutes: new.audio_duration_minutes,
                    created_at: &created_at,
                })
            })
            .await?
        };

        self.write_translation(id, ORIGINAL_TEXT_RAW, &new.original_text, &Usage::none())
            .await?;

        info!(message_id = id, chatroom_id = new.chatroom_id, "Message created");
        self.get(id).await
    }

    /// Insert a translation slot, or overwrite it if it already exists.
    pub async fn add_translation(
        &self,
        message_id: i64,
        language_key: &str,
        text: &str,
        usage: Option<Usage>,
    ) -> Result<()> {
        self.lock(message_id)
            .await?
            .add_translation(language_key, text, usage)
            .await
    }

    pub async fn remove_translation(&self, message_id: i64, language_key: &str) -> Result<()> {
        self.lock(message_id).await?.remove_translation(language_key).await
    }

    /// The metered read. Bills `identity` at most once per (message, key, viewer).
    pub async fn get_translation_priced(
        &self,
        message_id: i64,
        identity: &BillingIdentity,
        language_key: &str,
        mode: CostMode,
    ) -> Result<PricedTranslations> {
        self.lock(message_id)
            .await?
            .get_translation_priced(identity, language_key, mode)
            .await
    }

    /// Hard-delete every message of a room. Irreversible.
    pub async fn clear_history(&self, chatroom_id: i64) -> Result<usize> {
        let db = self.db.clone();
        let deleted = blocking(move || db.delete_chatroom_messages(chatroom_id)).await?;
        info!(chatroom_id, deleted, "Chat history cleared");
        Ok(deleted)
    }

    pub async fn get(&self, message_id: i64) -> Result<Message> {
        self.find(message_id)
            .await?
            .ok_or_else(|| ChatError::not_found(format!("Message {}", message_id)))
    }

    pub async fn find(&self, message_id: i64) -> Result<Option<Message>> {
        let db = self.db.clone();
        let loaded = blocking(move || load_message_parts(&db, message_id)).await?;
        loaded.map(|parts| self.assemble(parts)).transpose()
    }

    /// Messages of a room in creation order, optionally restricted to `ids`.
    pub async fn list(&self, chatroom_id: i64, ids: &[i64]) -> Result<Vec<Message>> {
        let db = self.db.clone();
        let ids = ids.to_vec();
        let loaded = blocking(move || {
            let rows = db.list_messages(chatroom_id, &ids)?;
            let mut parts = Vec::with_capacity(rows.len());
            for row in rows {
                parts.push(load_children(&db, row)?);
            }
            Ok(parts)
        })
        .await?;

        loaded.into_iter().map(|parts| self.assemble(parts)).collect()
    }

    /// Resolve a reply back-reference at read time. The target may be gone.
    pub async fn resolve_reply(&self, message: &Message) -> Result<Option<ReplyPreview>> {
        let Some(target_id) = message.reply_to_message_id else {
            return Ok(None);
        };

        let preview = match self.find(target_id).await? {
            Some(target) => ReplyPreview {
                message_id: target_id,
                missing: false,
                username: Some(target.username),
                excerpt: Some(excerpt(&target.original_text)),
            },
            None => ReplyPreview {
                message_id: target_id,
                missing: true,
                username: None,
                excerpt: None,
            },
        };
        Ok(Some(preview))
    }

    async fn write_translation(
        &self,
        message_id: i64,
        language_key: &str,
        text: &str,
        usage: &Usage,
    ) -> Result<bool> {
        let sealed = self.cipher.encrypt(text)?;
        let (cost_full, cost_reduced) = self.pricing.costs(usage);
        let produced_at = now_stamp();

        let db = self.db.clone();
        let key = language_key.to_string();
        let usage = usage.clone();
        blocking(move || {
            db.upsert_translation(
                message_id,
                &key,
                &sealed.ciphertext,
                &sealed.nonce,
                &NewUsage {
                    model: &usage.model,
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                    cost_full,
                    cost_reduced,
                    produced_at: &produced_at,
                },
            )
        })
        .await
    }

    fn assemble(&self, parts: MessageParts) -> Result<Message> {
        let MessageParts {
            row,
            translations,
            usage,
            viewers,
        } = parts;

        let original_text = self
            .cipher
            .decrypt(&row.original_ciphertext, &row.original_nonce)
            .with_context(|| format!("opening message {}", row.id))?;

        let mut opened = BTreeMap::new();
        for t in translations {
            let text = self
                .cipher
                .decrypt(&t.ciphertext, &t.nonce)
                .with_context(|| format!("opening translation {} of message {}", t.language_key, row.id))?;
            opened.insert(t.language_key, text);
        }

        let mut translation_usage = BTreeMap::new();
        for u in usage {
            translation_usage.insert(
                u.language_key,
                TranslationUsage {
                    model: u.model,
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                    cost_full: u.cost_full,
                    cost_reduced: u.cost_reduced,
                    produced_at: parse_stamp(&u.produced_at)?,
                },
            );
        }

        let mut translation_viewers: BTreeMap<String, BTreeMap<String, DateTime<Utc>>> =
            BTreeMap::new();
        for v in viewers {
            translation_viewers
                .entry(v.language_key)
                .or_default()
                .insert(v.viewer_id, parse_stamp(&v.viewed_at)?);
        }

        let content_type = row.content_type.parse::<ContentType>().unwrap_or_else(|e| {
            warn!(message_id = row.id, error = %e, "Unknown content type, treating as text");
            ContentType::Text
        });

        Ok(Message {
            id: row.id,
            user_id: row.user_id,
            username: row.username,
            chatroom_id: row.chatroom_id,
            original_text,
            content_type,
            media_ref: row.media_ref,
            translations: opened,
            translation_usage,
            translation_viewers,
            is_recalled: row.is_recalled,
            is_edited: row.is_edited,
            reply_to_message_id: row.reply_to_message_id,
            audio_duration_minutes: row.audio_duration_minutes,
            created_at: parse_stamp(&row.created_at)?,
        })
    }
}

impl LockedMessage<'_> {
    pub async fn load(&self) -> Result<Message> {
        self.store.get(self.message_id).await
    }

    pub async fn add_translation(
        &self,
        language_key: &str,
        text: &str,
        usage: Option<Usage>,
    ) -> Result<()> {
        if language_key.trim().is_empty() {
            return Err(ChatError::InvalidRequest("empty language key".into()));
        }
        self.ensure_exists().await?;

        let usage = usage.unwrap_or_else(Usage::none);
        let inserted = self
            .store
            .write_translation(self.message_id, language_key, text, &usage)
            .await?;

        debug!(
            message_id = self.message_id,
            language = language_key,
            inserted,
            total_tokens = usage.total_tokens,
            "Translation stored"
        );
        Ok(())
    }

    pub async fn remove_translation(&self, language_key: &str) -> Result<()> {
        let db = self.store.db.clone();
        let (id, key) = (self.message_id, language_key.to_string());
        blocking(move || db.delete_translation(id, &key)).await?;
        Ok(())
    }

    /// Replace the original text and flag the message edited. The raw
    /// mirror follows the new text.
    pub async fn replace_original(&self, text: &str) -> Result<()> {
        let sealed = self.store.cipher.encrypt(text)?;
        let db = self.store.db.clone();
        let id = self.message_id;
        let updated =
            blocking(move || db.update_original_text(id, &sealed.ciphertext, &sealed.nonce)).await?;
        if !updated {
            return Err(ChatError::not_found(format!("Message {}", id)));
        }

        self.store
            .write_translation(id, ORIGINAL_TEXT_RAW, text, &Usage::none())
            .await?;
        Ok(())
    }

    pub async fn set_recalled(&self) -> Result<()> {
        let db = self.store.db.clone();
        let id = self.message_id;
        if !blocking(move || db.set_recalled(id)).await? {
            return Err(ChatError::not_found(format!("Message {}", id)));
        }
        Ok(())
    }

    pub async fn get_translation_priced(
        &self,
        identity: &BillingIdentity,
        language_key: &str,
        mode: CostMode,
    ) -> Result<PricedTranslations> {
        let message = self.load().await?;

        if !message.translations.contains_key(language_key) {
            debug!(message_id = self.message_id, language = language_key, "Not materialized, no charge");
            return Ok(PricedTranslations {
                translations: message.translations,
                charge: Charge::NotMaterialized,
            });
        }

        if message.has_viewed(language_key, &identity.viewer_id) {
            return Ok(PricedTranslations {
                translations: message.translations,
                charge: Charge::AlreadyViewed,
            });
        }

        let usage = message
            .translation_usage
            .get(language_key)
            .map(TranslationUsage::usage)
            .unwrap_or_else(Usage::none);
        let amount = self.store.pricing.price(&usage, mode);

        let outcome = {
            let db = self.store.db.clone();
            let id = self.message_id;
            let key = language_key.to_string();
            let identity = identity.clone();
            let viewed_at = now_stamp();
            blocking(move || {
                db.record_first_view(id, &key, &identity.viewer_id, &identity.payer_id, amount, &viewed_at)
            })
            .await?
        };

        let charge = match outcome {
            FirstView::Recorded => {
                debug!(
                    message_id = self.message_id,
                    language = language_key,
                    viewer = %identity.viewer_id,
                    payer = %identity.payer_id,
                    amount,
                    "First view billed"
                );
                Charge::Billed(amount)
            }
            FirstView::AlreadyViewed => Charge::AlreadyViewed,
            FirstView::PayerMissing => {
                warn!(payer = %identity.payer_id, message_id = self.message_id, "Paying account missing, view not billed");
                Charge::PayerMissing
            }
        };

        Ok(PricedTranslations {
            translations: message.translations,
            charge,
        })
    }

    async fn ensure_exists(&self) -> Result<()> {
        let db = self.store.db.clone();
        let id = self.message_id;
        match blocking(move || db.get_message(id)).await? {
            Some(_) => Ok(()),
            None => Err(ChatError::not_found(format!("Message {}", id))),
        }
    }
}

struct MessageParts {
    row: MessageRow,
    translations: Vec<parley_db::models::TranslationRow>,
    usage: Vec<parley_db::models::UsageRow>,
    viewers: Vec<parley_db::models::ViewerRow>,
}

fn load_message_parts(db: &Database, message_id: i64) -> anyhow::Result<Option<MessageParts>> {
    match db.get_message(message_id)? {
        Some(row) => Ok(Some(load_children(db, row)?)),
        None => Ok(None),
    }
}

fn load_children(db: &Database, row: MessageRow) -> anyhow::Result<MessageParts> {
    Ok(MessageParts {
        translations: db.get_translations(row.id)?,
        usage: db.get_usage(row.id)?,
        viewers: db.get_viewers(row.id)?,
        row,
    })
}

/// Run a blocking database call off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChatError::Storage(e.into()))?
        .map_err(ChatError::Storage)
}

/// RFC 3339 with microseconds in UTC. Sorts lexically in time order.
pub(crate) fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("bad timestamp '{}'", raw))
        .map_err(ChatError::Storage)
}

fn excerpt(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(REPLY_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_crypto::keys::generate_key;

    fn store() -> MessageStore {
        let db = Database::open_in_memory().unwrap();
        db.create_user("alice", "Alice", "alice@test", "pw", false).unwrap();
        db.create_user("bob", "Bob", "bob@test", "pw", false).unwrap();
        MessageStore::new(
            Arc::new(db),
            TextCipher::new(&generate_key()),
            PricingCalculator::default(),
            Duration::from_secs(5),
        )
    }

    fn new_message(text: &str) -> NewMessage {
        NewMessage {
            user_id: "alice".into(),
            username: "Alice".into(),
            chatroom_id: 1,
            original_text: text.into(),
            content_type: ContentType::Text,
            media_ref: None,
            reply_to_message_id: None,
            audio_duration_minutes: 0.0,
        }
    }

    fn usage(prompt: u32, completion: u32) -> Usage {
        Usage {
            model: "gpt-4o".into(),
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    fn balance(store: &MessageStore, user: &str) -> f64 {
        store.db().get_balance(user).unwrap().unwrap()
    }

    #[tokio::test]
    async fn create_materializes_raw_mirror() {
        let store = store();
        let message = store.create(new_message("hello")).await.unwrap();

        assert_eq!(message.translation(ORIGINAL_TEXT_RAW), Some("hello"));
        assert!(message.translation_usage[ORIGINAL_TEXT_RAW].usage().is_zero());
        assert_eq!(message.translations.len(), 1);
        assert!(message.translation_viewers.is_empty());
    }

    #[tokio::test]
    async fn text_is_sealed_at_rest() {
        let store = store();
        let message = store.create(new_message("top secret")).await.unwrap();
        let row = store.db().get_message(message.id).unwrap().unwrap();
        assert!(!String::from_utf8_lossy(&row.original_ciphertext).contains("top secret"));
    }

    #[tokio::test]
    async fn absent_key_is_returned_without_charge() {
        let store = store();
        let message = store.create(new_message("hello")).await.unwrap();

        let priced = store
            .get_translation_priced(message.id, &BillingIdentity::own("alice"), "fr", CostMode::Full)
            .await
            .unwrap();

        assert_eq!(priced.charge, Charge::NotMaterialized);
        assert_eq!(priced.translations.len(), 1);
        assert_eq!(balance(&store, "alice"), 0.0);
    }

    #[tokio::test]
    async fn reduced_mode_bills_reduced_rates() {
        let store = store();
        let message = store.create(new_message("hello")).await.unwrap();
        store
            .add_translation(message.id, "fr", "bonjour", Some(usage(1000, 1000)))
            .await
            .unwrap();

        let priced = store
            .get_translation_priced(message.id, &BillingIdentity::own("bob"), "fr", CostMode::Reduced)
            .await
            .unwrap();

        let expected = store.pricing().price(&usage(1000, 1000), CostMode::Reduced);
        assert_eq!(priced.charge, Charge::Billed(expected));
        assert!((balance(&store, "bob") + expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn missing_payer_is_not_billed() {
        let store = store();
        let message = store.create(new_message("hello")).await.unwrap();
        store.add_translation(message.id, "fr", "bonjour", Some(usage(10, 5))).await.unwrap();

        let identity = BillingIdentity::new("alice", "ghost");
        let priced = store
            .get_translation_priced(message.id, &identity, "fr", CostMode::Full)
            .await
            .unwrap();

        assert_eq!(priced.charge, Charge::PayerMissing);
        assert_eq!(priced.translations["fr"], "bonjour");
    }

    #[tokio::test]
    async fn add_translation_to_missing_message_fails() {
        let store = store();
        let err = store.add_translation(404, "fr", "x", None).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn listing_orders_by_creation() {
        let store = store();
        let first = store.create(new_message("one")).await.unwrap();
        let second = store.create(new_message("two")).await.unwrap();

        let ids: Vec<i64> = store.list(1, &[]).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn reply_to_deleted_message_is_marked_missing() {
        let store = store();
        let target = store.create(new_message("original")).await.unwrap();
        let mut reply = new_message("reply");
        reply.reply_to_message_id = Some(target.id);
        reply.chatroom_id = 2;
        let reply = store.create(reply).await.unwrap();

        let preview = store.resolve_reply(&reply).await.unwrap().unwrap();
        assert!(!preview.missing);
        assert_eq!(preview.excerpt.as_deref(), Some("original"));

        store.clear_history(1).await.unwrap();
        let preview = store.resolve_reply(&reply).await.unwrap().unwrap();
        assert!(preview.missing);
        assert_eq!(preview.username, None);
    }

    #[test]
    fn long_excerpts_are_truncated() {
        let text = "a".repeat(200);
        let cut = excerpt(&text);
        assert_eq!(cut.chars().count(), REPLY_EXCERPT_CHARS + 1);
        assert!(cut.ends_with('…'));
    }
}
