//! Chat event coordinator.
//!
//! Each message-producing event walks
//! `Received -> [Transcribing | Interpreting] -> Translating -> Persisted -> Broadcast -> Done`
//! and may end in `Failed` at any step. Media charges applied before a
//! failure are refunded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use futures_util::future::join_all;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_db::models::ChatRoomRow;
use parley_gateway::{Dispatcher, JoinOutcome};
use parley_translate::{Translation, TranslationGateway, tagged_fallback};
use parley_types::api::{PreviewTranslateRequest, PreviewTranslateResponse, PullPath, PullQuery};
use parley_types::events::{
    BalanceNotice, EditText, EditedMessage, GuestContext, JoinRoom, LanguageSelection, LeaveNotice,
    MessageView, RecallMessage, RecallStatus, ReplyPreview, ServerEvent, SpeakingSignal,
    SpeakingStatus, UploadAudio, UploadPhoto, UploadText,
};
use parley_types::models::{ContentType, CostMode, Message, User, is_raw_key};

use crate::error::{ChatError, Result};
use crate::store::{BillingIdentity, MessageStore, NewMessage, blocking};
use crate::users::UserDirectory;
use crate::views::message_view;

/// Interpretation language used when the uploader reads the raw mirror and
/// the client sent no system language.
const DEFAULT_VISION_LANGUAGE: &str = "English";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStage {
    Received,
    Transcribing,
    Interpreting,
    Translating,
    Persisted,
    Broadcast,
    Done,
    Failed,
}

impl EventStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Transcribing => "transcribing",
            Self::Interpreting => "interpreting",
            Self::Translating => "translating",
            Self::Persisted => "persisted",
            Self::Broadcast => "broadcast",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

fn stage(event: &'static str, stage: EventStage) {
    debug!(event, stage = stage.as_str(), "Event stage");
}

fn finish<T>(event: &'static str, result: Result<T>) -> Result<T> {
    match &result {
        Ok(_) => stage(event, EventStage::Done),
        Err(e) => warn!(event, stage = EventStage::Failed.as_str(), error = %e, "Event failed"),
    }
    result
}

/// Which live speaking indicator a client sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakingPhase {
    Start,
    Stop,
    Transcript,
}

/// A metered pull over a room's messages.
#[derive(Debug, Clone)]
pub struct PullRequest {
    pub chatroom_id: i64,
    /// Keys to materialize and bill, primary first.
    pub targets: Vec<String>,
    pub viewer_id: String,
    pub guest: GuestContext,
    pub mode: CostMode,
    /// Empty means every message of the room.
    pub message_ids: Vec<i64>,
}

impl PullRequest {
    pub fn from_http(path: &PullPath, query: &PullQuery) -> Result<Self> {
        let viewer_id = query
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ChatError::InvalidRequest("User ID is required".into()))?;

        let selection = if path.split() {
            LanguageSelection::split(&path.language_first, &path.language_second)
        } else {
            LanguageSelection::single(&path.language)
        };

        Ok(Self {
            chatroom_id: path.chatroom_id,
            targets: selection.targets(),
            viewer_id: viewer_id.to_string(),
            guest: GuestContext {
                is_guest_mode: query.is_guest_mode,
                curr_host_user_id: query.curr_host_user_id.clone(),
            },
            mode: query.low_cost_mode,
            message_ids: query.parsed_message_ids(),
        })
    }

    fn identity(&self) -> BillingIdentity {
        BillingIdentity::new(&self.viewer_id, self.guest.payer(&self.viewer_id))
    }
}

enum Delivery {
    /// Unicast each view to the requesting session, if it is known.
    Session(Option<Uuid>),
    /// Broadcast each view to the room.
    Room,
}

/// Fields of a new message gathered before translation.
struct Draft {
    author: User,
    username: String,
    chatroom_id: i64,
    original_text: String,
    content_type: ContentType,
    media_ref: Option<String>,
    reply_to_message_id: Option<i64>,
    audio_duration_minutes: f64,
}

pub struct Coordinator {
    store: MessageStore,
    users: UserDirectory,
    gateway: Arc<TranslationGateway>,
    dispatcher: Dispatcher,
}

impl Coordinator {
    pub fn new(store: MessageStore, gateway: Arc<TranslationGateway>, dispatcher: Dispatcher) -> Self {
        let users = UserDirectory::new(store.db().clone());
        Self {
            store,
            users,
            gateway,
            dispatcher,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // -- Rooms --

    pub async fn join_room(&self, session_id: Uuid, cmd: JoinRoom) -> Result<JoinOutcome> {
        let outcome = self
            .dispatcher
            .join(self.store.db(), cmd.chatroom_id, session_id, &cmd.user_id)
            .await
            .map_err(ChatError::Storage)?;

        match outcome {
            JoinOutcome::Joined => {
                let event = ServerEvent::RoomJoined {
                    message: format!("Joined chatroom {}", cmd.chatroom_id),
                };
                self.dispatcher.unicast(session_id, &event).await;
            }
            JoinOutcome::NotParticipant => {
                info!(chatroom_id = cmd.chatroom_id, user_id = %cmd.user_id, "Join rejected, not a participant");
                let event = ServerEvent::AlreadyLeaveChatroom(LeaveNotice {
                    chatroom_id: cmd.chatroom_id,
                    user_id: cmd.user_id.clone(),
                    is_leave: true,
                });
                self.dispatcher.unicast(session_id, &event).await;
            }
            JoinOutcome::RoomNotFound => {
                return Err(ChatError::not_found(format!("Chatroom {}", cmd.chatroom_id)));
            }
        }
        Ok(outcome)
    }

    pub async fn leave_room(&self, session_id: Uuid, chatroom_id: i64) {
        self.dispatcher.leave_room(chatroom_id, session_id).await;
    }

    // -- Uploads --

    pub async fn upload_text(&self, cmd: UploadText) -> Result<MessageView> {
        const EVENT: &str = "upload_text";
        stage(EVENT, EventStage::Received);
        finish(EVENT, self.upload_text_inner(cmd).await)
    }

    async fn upload_text_inner(&self, cmd: UploadText) -> Result<MessageView> {
        if cmd.user_id.trim().is_empty() || cmd.message.trim().is_empty() {
            return Err(ChatError::InvalidRequest("userId or message is missing".into()));
        }
        require_targets(&cmd.languages)?;
        self.chatroom(cmd.chatroom_id).await?;
        let author = self.author(&cmd.user_id, cmd.username.as_deref()).await?;

        let draft = Draft {
            username: display_name(cmd.username.as_deref(), &author),
            author,
            chatroom_id: cmd.chatroom_id,
            original_text: cmd.message,
            content_type: ContentType::Text,
            media_ref: None,
            reply_to_message_id: cmd.reply_to_message_id,
            audio_duration_minutes: 0.0,
        };
        self.publish("upload_text", draft, &cmd.languages, cmd.low_cost_mode, &cmd.guest)
            .await
    }

    pub async fn upload_audio(&self, cmd: UploadAudio) -> Result<MessageView> {
        const EVENT: &str = "upload_audio";
        stage(EVENT, EventStage::Received);
        finish(EVENT, self.upload_audio_inner(cmd).await)
    }

    async fn upload_audio_inner(&self, cmd: UploadAudio) -> Result<MessageView> {
        if cmd.user_id.trim().is_empty() || cmd.audio.trim().is_empty() {
            return Err(ChatError::InvalidRequest("userId or audio data is missing".into()));
        }
        let audio = decode_media(&cmd.audio, "audio")?;
        require_targets(&cmd.languages)?;
        self.chatroom(cmd.chatroom_id).await?;
        let author = self.author(&cmd.user_id, cmd.username.as_deref()).await?;

        stage("upload_audio", EventStage::Transcribing);
        let transcript = self.gateway.transcribe(audio).await?;

        // Flat per-minute charge, independent of the viewer ledger
        let payer = cmd.guest.payer(&author.user_id).to_string();
        let cost = self.store.pricing().audio_cost(cmd.duration_in_minutes);
        let charged = self.charge(&payer, cost).await?;

        let draft = Draft {
            username: display_name(cmd.username.as_deref(), &author),
            author,
            chatroom_id: cmd.chatroom_id,
            original_text: transcript,
            content_type: ContentType::Audio,
            media_ref: cmd.media_ref,
            reply_to_message_id: cmd.reply_to_message_id,
            audio_duration_minutes: cmd.duration_in_minutes.max(0.0),
        };
        let result = self
            .publish("upload_audio", draft, &cmd.languages, cmd.low_cost_mode, &cmd.guest)
            .await;

        if result.is_err() && charged {
            self.refund(&payer, cost).await;
        }
        result
    }

    pub async fn upload_photo(&self, cmd: UploadPhoto) -> Result<MessageView> {
        const EVENT: &str = "upload_photo";
        stage(EVENT, EventStage::Received);
        finish(EVENT, self.upload_photo_inner(cmd).await)
    }

    async fn upload_photo_inner(&self, cmd: UploadPhoto) -> Result<MessageView> {
        if cmd.user_id.trim().is_empty() || cmd.photo.trim().is_empty() {
            return Err(ChatError::InvalidRequest("userId or photo is missing".into()));
        }
        let image = decode_media(&cmd.photo, "photo")?;
        let primary = require_targets(&cmd.languages)?;
        self.chatroom(cmd.chatroom_id).await?;
        let author = self.author(&cmd.user_id, cmd.username.as_deref()).await?;

        let language = if is_raw_key(&primary) {
            cmd.system_language
                .as_deref()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !is_raw_key(l))
                .unwrap_or(DEFAULT_VISION_LANGUAGE)
                .to_string()
        } else {
            primary
        };

        stage("upload_photo", EventStage::Interpreting);
        let interpretation = self.gateway.interpret_image(image, &language).await?;

        let payer = cmd.guest.payer(&author.user_id).to_string();
        let cost = self
            .store
            .pricing()
            .price(&interpretation.usage, cmd.low_cost_mode);
        let charged = self.charge(&payer, cost).await?;

        let draft = Draft {
            username: display_name(cmd.username.as_deref(), &author),
            author,
            chatroom_id: cmd.chatroom_id,
            original_text: interpretation.text,
            content_type: ContentType::Photo,
            media_ref: cmd.media_ref,
            reply_to_message_id: cmd.reply_to_message_id,
            audio_duration_minutes: 0.0,
        };
        let result = self
            .publish("upload_photo", draft, &cmd.languages, cmd.low_cost_mode, &cmd.guest)
            .await;

        if result.is_err() && charged {
            self.refund(&payer, cost).await;
        }
        result
    }

    /// Translate, persist, price the uploader's own view, then broadcast.
    async fn publish(
        &self,
        event: &'static str,
        draft: Draft,
        languages: &LanguageSelection,
        mode: CostMode,
        guest: &GuestContext,
    ) -> Result<MessageView> {
        let targets = languages.targets();

        stage(event, EventStage::Translating);
        let (translated, mut failed) = self.translate_all(&draft.original_text, &targets, mode).await;

        let message = self
            .store
            .create(NewMessage {
                user_id: draft.author.user_id.clone(),
                username: draft.username,
                chatroom_id: draft.chatroom_id,
                original_text: draft.original_text,
                content_type: draft.content_type,
                media_ref: draft.media_ref,
                reply_to_message_id: draft.reply_to_message_id,
                audio_duration_minutes: draft.audio_duration_minutes,
            })
            .await?;

        let identity = BillingIdentity::new(
            &draft.author.user_id,
            guest.payer(&draft.author.user_id),
        );
        let translations = match self.attach_translations(&message, &translated, &identity, mode).await {
            Ok(translations) => translations,
            Err(e) => {
                // The message is stored, so it is delivered untranslated rather than dropped
                warn!(message_id = message.id, error = %e, "Translations not attached, broadcasting raw text");
                for (key, _) in translated.iter().filter(|(key, _)| !is_raw_key(key)) {
                    failed
                        .entry(key.clone())
                        .or_insert_with(|| tagged_fallback(&message.original_text));
                }
                message.translations.clone()
            }
        };
        stage(event, EventStage::Persisted);

        let reply = self.reply_preview(&message).await;
        let view = message_view(
            &message,
            translations,
            targets.first().map(String::as_str),
            failed,
            reply,
        );

        let reached = self
            .dispatcher
            .broadcast(message.chatroom_id, &ServerEvent::NewMessage(view.clone()))
            .await;
        stage(event, EventStage::Broadcast);
        info!(message_id = message.id, chatroom_id = message.chatroom_id, reached, "New message");

        Ok(view)
    }

    /// Store fresh translations of a new message and price the uploader's
    /// own view of each requested key.
    async fn attach_translations(
        &self,
        message: &Message,
        translated: &[(String, Translation)],
        identity: &BillingIdentity,
        mode: CostMode,
    ) -> Result<BTreeMap<String, String>> {
        let locked = self.store.lock(message.id).await?;
        for (key, translation) in translated.iter().filter(|(key, _)| !is_raw_key(key)) {
            locked
                .add_translation(key, &translation.text, Some(translation.usage.clone()))
                .await?;
        }
        for (key, _) in translated {
            locked.get_translation_priced(identity, key, mode).await?;
        }
        Ok(locked.load().await?.translations)
    }

    // -- Edit / recall --

    pub async fn edit_message(&self, cmd: EditText) -> Result<EditedMessage> {
        const EVENT: &str = "edit_existed_text";
        stage(EVENT, EventStage::Received);
        finish(EVENT, self.edit_message_inner(cmd).await)
    }

    async fn edit_message_inner(&self, cmd: EditText) -> Result<EditedMessage> {
        if cmd.edited_text.trim().is_empty() {
            return Err(ChatError::InvalidRequest("edited text is empty".into()));
        }

        let message = self.store.get(cmd.message_id).await?;
        check_editable(&message, &cmd)?;

        // Every existing slot is re-translated so no viewer is served a
        // translation of the old text.
        let targets = cmd.languages.targets();
        let keys: BTreeSet<String> = message
            .translations
            .keys()
            .chain(targets.iter())
            .filter(|key| !is_raw_key(key))
            .cloned()
            .collect();
        let key_list: Vec<String> = keys.iter().cloned().collect();

        stage("edit_existed_text", EventStage::Translating);
        let (translated, failed) = self
            .translate_all(&cmd.edited_text, &key_list, cmd.low_cost_mode)
            .await;

        let edited = {
            let locked = self.store.lock(cmd.message_id).await?;
            let current = locked.load().await?;
            check_editable(&current, &cmd)?;
            if current.original_text != message.original_text {
                return Err(ChatError::PersistenceConflict(format!(
                    "message {} was edited concurrently",
                    message.id
                )));
            }

            locked.replace_original(&cmd.edited_text).await?;
            for (key, translation) in &translated {
                locked
                    .add_translation(key, &translation.text, Some(translation.usage.clone()))
                    .await?;
            }
            for key in failed.keys() {
                locked.remove_translation(key).await?;
            }
            // Slots readers filled while we translated hold the old text
            for key in current
                .translations
                .keys()
                .filter(|key| !is_raw_key(key) && !keys.contains(*key))
            {
                debug!(message_id = message.id, language = %key, "Dropping slot filled during edit");
                locked.remove_translation(key).await?;
            }

            let identity = BillingIdentity::new(&cmd.user_id, cmd.guest.payer(&cmd.user_id));
            for key in targets.iter().filter(|key| !failed.contains_key(*key)) {
                locked
                    .get_translation_priced(&identity, key, cmd.low_cost_mode)
                    .await?;
            }

            let updated = locked.load().await?;
            stage("edit_existed_text", EventStage::Persisted);

            EditedMessage {
                message_id: updated.id,
                edited_text: updated.original_text,
                translations: updated.translations,
                failed_translations: failed,
                is_edited: true,
            }
        };

        self.dispatcher
            .broadcast(
                cmd.chatroom_id,
                &ServerEvent::ReceiveEditedMessage(edited.clone()),
            )
            .await;
        stage("edit_existed_text", EventStage::Broadcast);

        Ok(edited)
    }

    pub async fn recall_message(&self, cmd: RecallMessage) -> Result<RecallStatus> {
        const EVENT: &str = "recall_message";
        stage(EVENT, EventStage::Received);
        finish(EVENT, self.recall_message_inner(cmd).await)
    }

    async fn recall_message_inner(&self, cmd: RecallMessage) -> Result<RecallStatus> {
        let status = {
            let locked = self.store.lock(cmd.message_id).await?;
            let message = locked.load().await?;
            check_room(&message, cmd.chatroom_id)?;

            if message.user_id != cmd.user_id {
                let room = self.chatroom(message.chatroom_id).await?;
                if room.creator_id != cmd.user_id {
                    return Err(ChatError::Unauthorized(
                        "only the author or the chatroom creator may recall a message".into(),
                    ));
                }
            }

            if !message.is_recalled {
                locked.set_recalled().await?;
            }
            stage("recall_message", EventStage::Persisted);

            RecallStatus {
                message_id: message.id,
                user_id: cmd.user_id.clone(),
                username: message.username,
            }
        };

        self.dispatcher
            .broadcast(
                cmd.chatroom_id,
                &ServerEvent::ReceiveRecallMessageStatus(status.clone()),
            )
            .await;
        stage("recall_message", EventStage::Broadcast);

        Ok(status)
    }

    // -- Pulls --

    /// Materialize and bill the requested keys, unicasting each view to the
    /// requesting session. A payer at or below zero is announced to the room.
    pub async fn fetch_on_demand(
        &self,
        request: PullRequest,
        session_id: Option<Uuid>,
    ) -> Result<Vec<MessageView>> {
        self.pull(request, Delivery::Session(session_id)).await
    }

    /// Same as [`fetch_on_demand`](Self::fetch_on_demand) over the whole
    /// room, with each view re-broadcast to the room.
    pub async fn fetch_all(&self, mut request: PullRequest) -> Result<Vec<MessageView>> {
        request.message_ids.clear();
        self.pull(request, Delivery::Room).await
    }

    async fn pull(&self, request: PullRequest, delivery: Delivery) -> Result<Vec<MessageView>> {
        if request.targets.is_empty() {
            return Err(ChatError::InvalidRequest("no language selected".into()));
        }

        if let Delivery::Session(_) = delivery {
            self.announce_negative_balance(&request).await?;
        }

        let room = self.chatroom(request.chatroom_id).await?;
        if room.is_invisible {
            return Err(ChatError::InsufficientState(
                "This chatroom is no longer available".into(),
            ));
        }

        let identity = request.identity();
        let messages = self
            .store
            .list(request.chatroom_id, &request.message_ids)
            .await?;

        let mut views = Vec::with_capacity(messages.len());
        for message in messages {
            let view = match self
                .materialize_and_price(&message, &request.targets, &identity, request.mode)
                .await
            {
                Ok(view) => view,
                // Deleted since the listing
                Err(ChatError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(message_id = message.id, error = %e, "Message not priced, serving it untranslated");
                    self.unpriced_view(&message, &request.targets).await
                }
            };

            let event = ServerEvent::ReceivedTranslatedExistedSingleLanguage(view.clone());
            match delivery {
                Delivery::Session(Some(session_id)) => {
                    self.dispatcher.unicast(session_id, &event).await;
                }
                Delivery::Session(None) => {}
                Delivery::Room => {
                    self.dispatcher.broadcast(request.chatroom_id, &event).await;
                }
            }
            views.push(view);
        }

        debug!(
            chatroom_id = request.chatroom_id,
            viewer = %request.viewer_id,
            count = views.len(),
            "Pull served"
        );
        Ok(views)
    }

    /// Missing keys are materialized first, then every available key is
    /// priced for the viewer under the message lock.
    async fn materialize_and_price(
        &self,
        message: &Message,
        targets: &[String],
        identity: &BillingIdentity,
        mode: CostMode,
    ) -> Result<MessageView> {
        let mut failed = BTreeMap::new();
        for key in targets.iter().filter(|key| !message.has_translation(key)) {
            if let Some(fallback) = self.materialize(message.id, key, mode).await? {
                failed.insert(key.clone(), fallback);
            }
        }

        let message = {
            let locked = self.store.lock(message.id).await?;
            for key in targets.iter().filter(|key| !failed.contains_key(*key)) {
                locked.get_translation_priced(identity, key, mode).await?;
            }
            locked.load().await?
        };

        let reply = self.reply_preview(&message).await;
        Ok(message_view(
            &message,
            message.translations.clone(),
            targets.first().map(String::as_str),
            failed,
            reply,
        ))
    }

    /// Translate one missing slot and store it. The provider call runs
    /// under the slot reservation only, so a concurrent reader of the same
    /// key waits for this translation and readers of other keys or
    /// messages are not blocked. Returns the tagged fallback on failure.
    async fn materialize(&self, message_id: i64, key: &str, mode: CostMode) -> Result<Option<String>> {
        let _slot = self.store.reserve_slot(message_id, key).await?;

        let message = self.store.get(message_id).await?;
        if message.has_translation(key) {
            return Ok(None);
        }

        let translation = match self.gateway.translate(&message.original_text, key, mode).await {
            Ok(translation) => translation,
            Err(e) => {
                warn!(message_id, language = %key, error = %e, "On-demand translation failed");
                return Ok(Some(fallback_for(&e, &message.original_text)));
            }
        };

        let locked = self.store.lock(message_id).await?;
        let current = locked.load().await?;
        if current.original_text != message.original_text {
            warn!(message_id, language = %key, "Message edited during translation, result dropped");
            return Ok(Some(tagged_fallback(&current.original_text)));
        }
        if !current.has_translation(key) {
            locked
                .add_translation(key, &translation.text, Some(translation.usage))
                .await?;
        }
        Ok(None)
    }

    /// View of a message whose requested keys could not be priced. Nothing
    /// is billed and every requested key carries the tagged fallback.
    async fn unpriced_view(&self, message: &Message, targets: &[String]) -> MessageView {
        let failed = targets
            .iter()
            .filter(|key| !is_raw_key(key))
            .map(|key| (key.clone(), tagged_fallback(&message.original_text)))
            .collect();
        let reply = self.reply_preview(message).await;
        let mut raw = message.translations.clone();
        raw.retain(|key, _| is_raw_key(key));
        message_view(message, raw, targets.first().map(String::as_str), failed, reply)
    }

    async fn announce_negative_balance(&self, request: &PullRequest) -> Result<()> {
        let payer = request.guest.payer(&request.viewer_id).to_string();
        let db = self.store.db().clone();
        let balance = blocking(move || db.get_balance(&payer)).await?;

        if balance.is_some_and(|b| b <= 0.0) {
            let notice = ServerEvent::CheckTokenStatusIsNegative(BalanceNotice {
                user_id: request.viewer_id.clone(),
                host_user_id: request.guest.curr_host_user_id.clone(),
            });
            self.dispatcher.broadcast(request.chatroom_id, &notice).await;
        }
        Ok(())
    }

    // -- Speaking indicators --

    /// Relay a speaking indicator to the room. Nothing is stored or billed.
    /// Returns the number of sessions reached.
    pub async fn relay_speaking(&self, phase: SpeakingPhase, signal: SpeakingSignal) -> Result<usize> {
        if signal.user_id.trim().is_empty() {
            return Err(ChatError::InvalidRequest("userId is missing".into()));
        }
        let transcript = match phase {
            SpeakingPhase::Transcript => Some(
                signal
                    .streaming_transcript
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| ChatError::InvalidRequest("streamingTranscript is missing".into()))?,
            ),
            SpeakingPhase::Start | SpeakingPhase::Stop => None,
        };

        let avatar = self
            .users
            .find(&signal.user_id)
            .await?
            .and_then(|user| user.avatar);
        let status = SpeakingStatus {
            user_id: signal.user_id,
            username: signal.username,
            avatar,
            streaming_transcript: transcript,
        };

        let event = match phase {
            SpeakingPhase::Start => ServerEvent::UserSpeakingToClientStart(status),
            SpeakingPhase::Stop => ServerEvent::UserSpeakingToClientStop(status),
            SpeakingPhase::Transcript => ServerEvent::UserSpeakingToClientContentTranscript(status),
        };
        Ok(self.dispatcher.broadcast(signal.chatroom_id, &event).await)
    }

    // -- History --

    /// Delete every message of a room. Only its creator may do this.
    pub async fn clear_history(&self, chatroom_id: i64, user_id: &str) -> Result<usize> {
        let room = self.chatroom(chatroom_id).await?;
        if room.creator_id != user_id {
            return Err(ChatError::Unauthorized(
                "only the chatroom creator may clear its history".into(),
            ));
        }

        let deleted = self.store.clear_history(chatroom_id).await?;
        let event = ServerEvent::HistoryCleared {
            message: format!("Message history for chatroom {} has been cleared.", chatroom_id),
            chatroom_id,
        };
        self.dispatcher.broadcast(chatroom_id, &event).await;
        Ok(deleted)
    }

    // -- Preview --

    /// Translate ad-hoc text without persisting it. The payer is charged
    /// the tier price of the provider usage directly.
    pub async fn preview_translate(
        &self,
        request: PreviewTranslateRequest,
    ) -> Result<PreviewTranslateResponse> {
        if request.user_id.trim().is_empty()
            || request.language.trim().is_empty()
            || request.text.is_empty()
        {
            return Err(ChatError::InvalidRequest("Missing required parameters".into()));
        }

        self.users.get(&request.user_id).await?;
        let guest = GuestContext {
            is_guest_mode: request.is_guest_mode,
            curr_host_user_id: request.curr_host_user_id.clone(),
        };
        let payer = guest.payer(&request.user_id).to_string();
        if payer != request.user_id {
            self.users.get(&payer).await?;
        }

        let Translation { text, usage } = self
            .gateway
            .translate(&request.text, &request.language, request.low_cost_mode)
            .await?;

        if !usage.is_zero() {
            let price = self.store.pricing().price(&usage, request.low_cost_mode);
            let db = self.store.db().clone();
            let account = payer.clone();
            blocking(move || db.charge_preview(&account, price)).await?;
            debug!(payer = %payer, price, "Preview translation charged");
        }

        Ok(PreviewTranslateResponse {
            translation: text,
            tokens_used: usage.total_tokens,
        })
    }

    // -- Helpers --

    async fn chatroom(&self, chatroom_id: i64) -> Result<ChatRoomRow> {
        let db = self.store.db().clone();
        blocking(move || db.get_chatroom(chatroom_id))
            .await?
            .ok_or_else(|| ChatError::not_found(format!("Chatroom {}", chatroom_id)))
    }

    /// Get or create the acting user. A user without a private room gets
    /// one as a separate step.
    async fn author(&self, user_id: &str, username: Option<&str>) -> Result<User> {
        let user = self.users.ensure_user(user_id, username).await?;
        if user.private_room_id.is_none() {
            self.users.ensure_private_room(user_id).await?;
        }
        Ok(user)
    }

    /// Reply previews are best effort; a broken target never blocks delivery.
    async fn reply_preview(&self, message: &Message) -> Option<ReplyPreview> {
        match self.store.resolve_reply(message).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(message_id = message.id, error = %e, "Reply target unreadable");
                None
            }
        }
    }

    async fn translate_all(
        &self,
        text: &str,
        keys: &[String],
        mode: CostMode,
    ) -> (Vec<(String, Translation)>, BTreeMap<String, String>) {
        let results = join_all(keys.iter().map(|key| async move {
            (key.clone(), self.gateway.translate(text, key, mode).await)
        }))
        .await;

        let mut translated = Vec::with_capacity(results.len());
        let mut failed = BTreeMap::new();
        for (key, result) in results {
            match result {
                Ok(translation) => translated.push((key, translation)),
                Err(e) => {
                    warn!(language = %key, error = %e, "Translation failed, continuing with the rest");
                    failed.insert(key, fallback_for(&e, text));
                }
            }
        }
        (translated, failed)
    }

    /// Debit a flat media charge. Returns whether anything was debited.
    async fn charge(&self, payer: &str, amount: f64) -> Result<bool> {
        if amount <= 0.0 {
            return Ok(false);
        }
        let db = self.store.db().clone();
        let account = payer.to_string();
        let debited = blocking(move || db.debit_tokens(&account, amount)).await?;
        if debited {
            debug!(payer, amount, "Media charge applied");
        } else {
            warn!(payer, amount, "Paying account missing, media charge skipped");
        }
        Ok(debited)
    }

    async fn refund(&self, payer: &str, amount: f64) {
        let db = self.store.db().clone();
        let account = payer.to_string();
        match blocking(move || db.credit_tokens(&account, amount)).await {
            Ok(_) => info!(payer, amount, "Media charge refunded after failure"),
            Err(e) => error!(payer, amount, error = %e, "Refund failed"),
        }
    }
}

fn require_targets(languages: &LanguageSelection) -> Result<String> {
    languages
        .primary()
        .ok_or_else(|| ChatError::InvalidRequest("no target language selected".into()))
}

fn check_editable(message: &Message, cmd: &EditText) -> Result<()> {
    check_room(message, cmd.chatroom_id)?;
    if message.user_id != cmd.user_id {
        return Err(ChatError::Unauthorized("only the author may edit a message".into()));
    }
    if message.is_recalled {
        return Err(ChatError::InsufficientState(format!(
            "message {} has been recalled",
            message.id
        )));
    }
    Ok(())
}

fn check_room(message: &Message, chatroom_id: i64) -> Result<()> {
    if message.chatroom_id != chatroom_id {
        return Err(ChatError::InvalidRequest(format!(
            "message {} does not belong to chatroom {}",
            message.id, chatroom_id
        )));
    }
    Ok(())
}

fn display_name(requested: Option<&str>, author: &User) -> String {
    requested
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(author.username.as_str())
        .to_string()
}

fn decode_media(encoded: &str, what: &str) -> Result<Bytes> {
    // Browsers often send data URLs
    let payload = encoded
        .split_once("base64,")
        .map_or(encoded, |(_, data)| data)
        .trim();
    BASE64
        .decode(payload)
        .map(Bytes::from)
        .map_err(|e| ChatError::InvalidRequest(format!("{} is not valid base64: {}", what, e)))
}

fn fallback_for(error: &parley_translate::GatewayError, original: &str) -> String {
    error
        .fallback()
        .map(str::to_string)
        .unwrap_or_else(|| tagged_fallback(original))
}
