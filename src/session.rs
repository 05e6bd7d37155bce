use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::api::ChatApi;
use crate::context::{ContextEntry, ConversationContext, KeyValueStorage, KEY_ACTIVE_CHAT_ID};
use crate::error::{ChatError, Result};
use crate::transport::TransportEvent;
use crate::types::{now_iso, ChatMessage, FileData, MessagePayload, SendMessageBody, UserIdentity};

/// Sender id used for the optimistic local entry until the server ack
/// replaces it.
pub const OPTIMISTIC_SENDER_ID: &str = "current-user";

/// Typing indicator lifetime after the last typing event.
pub const TYPING_RESET: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Success,
    Error,
}

/// Toast-style notification for the embedding UI to drain and render.
#[derive(Debug, Clone)]
pub struct Notification {
    pub level: NotificationLevel,
    pub text: String,
}

impl Notification {
    pub fn info(text: impl Into<String>) -> Self {
        Self { level: NotificationLevel::Info, text: text.into() }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self { level: NotificationLevel::Success, text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { level: NotificationLevel::Error, text: text.into() }
    }
}

/// Visitor-side chat session. Constructed once per widget root and passed
/// by reference; holds a cached mirror of the server-held chat, never the
/// authoritative state.
pub struct ChatSession {
    api: ChatApi,
    storage: Arc<dyn KeyValueStorage>,
    identity: UserIdentity,
    context: ConversationContext,
    active_chat_id: Option<String>,
    // Display order, oldest first.
    messages: Vec<ChatMessage>,
    seen_ids: HashSet<String>,
    // nonce -> temporary message id, until the server ack lands.
    pending: HashMap<String, String>,
    partner_typing: Arc<AtomicBool>,
    typing_reset: Option<JoinHandle<()>>,
    widget_open: bool,
    notifications: VecDeque<Notification>,
    scroll_pending: bool,
}

impl ChatSession {
    pub fn new(api: ChatApi, storage: Arc<dyn KeyValueStorage>, identity: UserIdentity) -> Self {
        let context = ConversationContext::load(storage.as_ref());
        Self {
            api,
            storage,
            identity,
            context,
            active_chat_id: None,
            messages: Vec::new(),
            seen_ids: HashSet::new(),
            pending: HashMap::new(),
            partner_typing: Arc::new(AtomicBool::new(false)),
            typing_reset: None,
            widget_open: false,
            notifications: VecDeque::new(),
            scroll_pending: false,
        }
    }

    /// Adopts the user's most recent chat, or creates one if none exists.
    /// Returns the active chat id.
    pub async fn initialize(&mut self) -> Result<String> {
        if self.identity.id.trim().is_empty() || self.identity.name.trim().is_empty() {
            let err = ChatError::Identity;
            self.notify(Notification::error(err.user_message()));
            return Err(err);
        }

        let chats = match self.api.list_chats(&self.identity.id).await {
            Ok(chats) => chats,
            Err(err) => {
                self.notify(Notification::error(err.user_message()));
                return Err(err);
            }
        };

        let chat = match chats.into_iter().next() {
            // List is most-recent-first; adopt the head.
            Some(existing) => existing,
            None => match self.api.create_chat(&self.identity).await {
                Ok(created) => created,
                Err(err) => {
                    self.notify(Notification::error(err.user_message()));
                    return Err(err);
                }
            },
        };

        self.adopt(&chat.id);
        // A failed history fetch keeps the session usable with an empty
        // cache; the user already got a toast from refresh_history.
        let _ = self.refresh_history().await;
        Ok(chat.id)
    }

    /// Resumes a chat id persisted by an earlier session, if any.
    pub fn restore_active_chat(&mut self) -> Option<String> {
        let stored = self.storage.get(KEY_ACTIVE_CHAT_ID)?;
        self.adopt(&stored);
        Some(stored)
    }

    fn adopt(&mut self, chat_id: &str) {
        self.active_chat_id = Some(chat_id.to_string());
        self.storage.set(KEY_ACTIVE_CHAT_ID, chat_id);
        self.messages.clear();
        self.seen_ids.clear();
    }

    pub fn active_chat_id(&self) -> Option<&str> {
        self.active_chat_id.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ConversationContext {
        &mut self.context
    }

    pub fn storage(&self) -> &dyn KeyValueStorage {
        self.storage.as_ref()
    }

    /// Optimistically appends and then posts. Blank text with no attachment
    /// is a silent no-op; the optimistic entry is replaced in place by the
    /// server-confirmed message via its nonce.
    pub async fn send_message(
        &mut self,
        text: &str,
        file: Option<FileData>,
    ) -> Result<Option<ChatMessage>> {
        if text.trim().is_empty() && file.is_none() {
            return Ok(None);
        }
        let Some(chat_id) = self.active_chat_id.clone() else {
            let err = ChatError::NoActiveChat;
            self.notify(Notification::error(err.user_message()));
            return Err(err);
        };

        let payload: MessagePayload = match file.clone() {
            Some(f) => f.into(),
            None => MessagePayload::text(text.trim()),
        };

        let nonce = Uuid::new_v4().to_string();
        let temp_id = format!("temp-{nonce}");
        let now = now_iso();
        let optimistic = ChatMessage {
            id: temp_id.clone(),
            chat_id: chat_id.clone(),
            sender_id: OPTIMISTIC_SENDER_ID.to_string(),
            sender_name: self.identity.name.clone(),
            payload: payload.clone(),
            is_read: false,
            is_deleted: false,
            timestamp: now.clone(),
            created_at: now.clone(),
            updated_at: now,
        };

        self.messages.push(optimistic);
        self.seen_ids.insert(temp_id.clone());
        self.pending.insert(nonce.clone(), temp_id);
        self.scroll_pending = true;

        self.context.record(ContextEntry {
            sender_id: self.identity.id.clone(),
            text: payload.preview(),
            timestamp: now_iso(),
        });
        self.context.persist(self.storage.as_ref());

        let body = SendMessageBody {
            chat_id,
            sender_id: self.identity.id.clone(),
            sender_name: self.identity.name.clone(),
            message: text.trim().to_string(),
            file_data: file,
        };

        match self.api.send(&body).await {
            Ok(confirmed) => {
                self.reconcile(&nonce, confirmed.clone());
                Ok(Some(confirmed))
            }
            Err(err) => {
                // The optimistic entry stays visible; the user is told so
                // they can retry.
                self.notify(Notification::error(err.user_message()));
                Err(err)
            }
        }
    }

    fn reconcile(&mut self, nonce: &str, confirmed: ChatMessage) {
        let Some(temp_id) = self.pending.remove(nonce) else {
            return;
        };
        self.seen_ids.remove(&temp_id);
        self.seen_ids.insert(confirmed.id.clone());
        match self.messages.iter_mut().find(|m| m.id == temp_id) {
            Some(slot) => *slot = confirmed,
            None => {
                // Entry was dropped by a history refresh in between.
                self.messages.push(confirmed);
                self.ensure_order();
            }
        }
    }

    /// Merges one push event into the local state. Duplicate message ids
    /// are ignored, so replayed deliveries are harmless.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => {
                if self.active_chat_id.as_deref() != Some(message.chat_id.as_str()) {
                    return;
                }
                if !self.seen_ids.insert(message.id.clone()) {
                    debug!(id = %message.id, "duplicate push delivery ignored");
                    return;
                }

                self.context.record(ContextEntry {
                    sender_id: message.sender_id.clone(),
                    text: message.payload.preview(),
                    timestamp: message.timestamp.clone(),
                });
                self.context.persist(self.storage.as_ref());

                if !self.widget_open && message.sender_id != self.identity.id {
                    self.notify(Notification::info(format!(
                        "پیام جدید از {}",
                        message.sender_name
                    )));
                }

                self.messages.push(message);
                self.ensure_order();
                self.scroll_pending = true;
            }
            TransportEvent::Typing { chat_id, active } => {
                if self.active_chat_id.as_deref() != Some(chat_id.as_str()) {
                    return;
                }
                if active {
                    self.on_typing();
                } else {
                    self.clear_typing();
                }
            }
            TransportEvent::Error(message) => {
                self.notify(Notification::error(message));
            }
        }
    }

    /// Shows the typing indicator and (re)arms its 3 s reset. Each call
    /// replaces the previous timer, so N events inside the window produce
    /// exactly one stopped-typing transition.
    pub fn on_typing(&mut self) {
        self.partner_typing.store(true, Ordering::SeqCst);
        if let Some(previous) = self.typing_reset.take() {
            previous.abort();
        }
        let flag = Arc::clone(&self.partner_typing);
        self.typing_reset = Some(tokio::spawn(async move {
            tokio::time::sleep(TYPING_RESET).await;
            flag.store(false, Ordering::SeqCst);
        }));
    }

    fn clear_typing(&mut self) {
        self.partner_typing.store(false, Ordering::SeqCst);
        if let Some(previous) = self.typing_reset.take() {
            previous.abort();
        }
    }

    pub fn is_partner_typing(&self) -> bool {
        self.partner_typing.load(Ordering::SeqCst)
    }

    /// Re-fetches the full history (server is authoritative). On failure
    /// the cached messages stay visible and a retry is just another call.
    pub async fn refresh_history(&mut self) -> Result<()> {
        let Some(chat_id) = self.active_chat_id.clone() else {
            return Err(ChatError::NoActiveChat);
        };

        match self.api.messages(&chat_id).await {
            Ok(newest_first) => {
                // Keep unacked optimistic entries across the replace.
                let pending_ids: HashSet<&String> = self.pending.values().collect();
                let unacked: Vec<ChatMessage> = self
                    .messages
                    .iter()
                    .filter(|m| pending_ids.contains(&m.id))
                    .cloned()
                    .collect();

                self.messages = newest_first.into_iter().rev().collect();
                self.seen_ids = self.messages.iter().map(|m| m.id.clone()).collect();
                for message in unacked {
                    self.seen_ids.insert(message.id.clone());
                    self.messages.push(message);
                }
                self.ensure_order();
                Ok(())
            }
            Err(err) => {
                self.notify(Notification::error(err.user_message()));
                Err(err)
            }
        }
    }

    pub async fn mark_read(&self) -> Result<()> {
        let Some(chat_id) = self.active_chat_id.as_deref() else {
            return Err(ChatError::NoActiveChat);
        };
        self.api.mark_read(chat_id, &self.identity.id).await
    }

    fn ensure_order(&mut self) {
        let sorted = self
            .messages
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp);
        if !sorted {
            self.messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        }
    }

    pub fn set_widget_open(&mut self, open: bool) {
        self.widget_open = open;
        if open {
            self.scroll_pending = true;
        }
    }

    fn notify(&mut self, notification: Notification) {
        self.notifications.push_back(notification);
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    pub fn take_scroll_request(&mut self) -> bool {
        std::mem::take(&mut self.scroll_pending)
    }

    pub fn teardown(&mut self) {
        self.clear_typing();
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MemoryStorage;

    fn offline_session(identity: UserIdentity) -> ChatSession {
        // Port 9 (discard) is never listening; any network call fails fast.
        ChatSession::new(
            ChatApi::new("http://127.0.0.1:9"),
            Arc::new(MemoryStorage::new()),
            identity,
        )
    }

    fn push_message(id: &str, chat_id: &str, ts: &str) -> TransportEvent {
        TransportEvent::Message(ChatMessage {
            id: id.into(),
            chat_id: chat_id.into(),
            sender_id: "admin".into(),
            sender_name: "Support".into(),
            payload: MessagePayload::text("hello"),
            is_read: false,
            is_deleted: false,
            timestamp: ts.into(),
            created_at: ts.into(),
            updated_at: ts.into(),
        })
    }

    #[tokio::test]
    async fn initialize_requires_identity() {
        let mut session = offline_session(UserIdentity { id: "".into(), name: "".into() });
        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, ChatError::Identity));
        // User-visible toast, not a silent failure.
        assert_eq!(session.take_notifications().len(), 1);
    }

    #[tokio::test]
    async fn blank_send_is_a_noop() {
        let mut session = offline_session(UserIdentity { id: "u1".into(), name: "Sara".into() });
        session.adopt("c1");
        let sent = session.send_message("   \n ", None).await.unwrap();
        assert!(sent.is_none());
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn send_without_active_chat_fails() {
        let mut session = offline_session(UserIdentity { id: "u1".into(), name: "Sara".into() });
        let err = session.send_message("سلام", None).await.unwrap_err();
        assert!(matches!(err, ChatError::NoActiveChat));
    }

    #[tokio::test]
    async fn failed_send_keeps_the_optimistic_entry() {
        let mut session = offline_session(UserIdentity { id: "u1".into(), name: "Sara".into() });
        session.adopt("c1");
        let err = session.send_message("سلام", None).await.unwrap_err();
        assert!(matches!(err, ChatError::Offline | ChatError::Api(_)));

        assert_eq!(session.messages().len(), 1);
        let message = &session.messages()[0];
        assert!(message.id.starts_with("temp-"));
        assert_eq!(message.sender_id, OPTIMISTIC_SENDER_ID);
        assert!(!session.take_notifications().is_empty());
    }

    #[tokio::test]
    async fn duplicate_push_delivery_is_idempotent() {
        let mut session = offline_session(UserIdentity { id: "u1".into(), name: "Sara".into() });
        session.adopt("c1");
        session.handle_event(push_message("m1", "c1", "2026-01-01T00:00:01+00:00"));
        session.handle_event(push_message("m1", "c1", "2026-01-01T00:00:01+00:00"));
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn messages_for_other_chats_are_ignored() {
        let mut session = offline_session(UserIdentity { id: "u1".into(), name: "Sara".into() });
        session.adopt("c1");
        session.handle_event(push_message("m1", "other", "2026-01-01T00:00:01+00:00"));
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_arrivals_render_by_timestamp() {
        let mut session = offline_session(UserIdentity { id: "u1".into(), name: "Sara".into() });
        session.adopt("c1");
        session.handle_event(push_message("m2", "c1", "2026-01-01T00:00:02+00:00"));
        session.handle_event(push_message("m1", "c1", "2026-01-01T00:00:01+00:00"));
        let stamps: Vec<&str> = session.messages().iter().map(|m| m.timestamp.as_str()).collect();
        assert_eq!(
            stamps,
            vec!["2026-01-01T00:00:01+00:00", "2026-01-01T00:00:02+00:00"]
        );
    }

    #[tokio::test]
    async fn closed_widget_gets_a_toast_for_incoming_messages() {
        let mut session = offline_session(UserIdentity { id: "u1".into(), name: "Sara".into() });
        session.adopt("c1");
        session.set_widget_open(false);
        session.handle_event(push_message("m1", "c1", "2026-01-01T00:00:01+00:00"));
        let toasts = session.take_notifications();
        assert_eq!(toasts.len(), 1);
        assert_eq!(toasts[0].level, NotificationLevel::Info);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_indicator_resets_once_after_the_last_event() {
        let mut session = offline_session(UserIdentity { id: "u1".into(), name: "Sara".into() });
        session.adopt("c1");

        // Three bursts inside the window keep the indicator alive.
        session.on_typing();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(session.is_partner_typing());
        session.on_typing();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(session.is_partner_typing());
        session.on_typing();

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(session.is_partner_typing());

        // 3000 ms after the *last* event it flips off, exactly once.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!session.is_partner_typing());
    }

    #[tokio::test]
    async fn sent_and_received_messages_land_in_the_context_window() {
        let mut session = offline_session(UserIdentity { id: "u1".into(), name: "Sara".into() });
        session.adopt("c1");
        session.handle_event(push_message("m1", "c1", "2026-01-01T00:00:01+00:00"));
        assert_eq!(session.context().last_messages.len(), 1);
        assert_eq!(session.context().last_messages[0].sender_id, "admin");
    }
}
