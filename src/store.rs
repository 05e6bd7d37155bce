use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{now_iso, Chat, ChatMessage, ChatStatus, MessagePayload};

#[derive(Default)]
struct StoreInner {
    chats: HashMap<String, Chat>,
    // Stored oldest-first; the wire surface serves them newest-first.
    messages: HashMap<String, Vec<ChatMessage>>,
}

/// Authoritative conversation store. Clients only ever hold cached mirrors
/// of what lives here.
pub struct ChatStore {
    inner: RwLock<StoreInner>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
        }
    }

    /// Returns the user's existing open chat if there is one, otherwise
    /// creates a fresh open chat. A user never has two open chats.
    pub async fn create_chat(&self, user_id: &str, user_name: &str) -> Chat {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner
            .chats
            .values()
            .find(|c| c.user_id == user_id && c.is_open())
        {
            return existing.clone();
        }

        let chat = Chat::new(user_id, user_name);
        inner.chats.insert(chat.id.clone(), chat.clone());
        inner.messages.insert(chat.id.clone(), Vec::new());
        chat
    }

    pub async fn chat(&self, chat_id: &str) -> Option<Chat> {
        self.inner.read().await.chats.get(chat_id).cloned()
    }

    pub async fn open_chat_for_user(&self, user_id: &str) -> Option<Chat> {
        let inner = self.inner.read().await;
        inner
            .chats
            .values()
            .find(|c| c.user_id == user_id && c.is_open())
            .cloned()
    }

    /// All chats for one user, most recently updated first.
    pub async fn chats_for_user(&self, user_id: &str) -> Vec<Chat> {
        let inner = self.inner.read().await;
        let mut list: Vec<Chat> = inner
            .chats
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list
    }

    /// Every chat, most recently updated first, for the admin panel.
    pub async fn all_chats(&self) -> Vec<Chat> {
        let inner = self.inner.read().await;
        let mut list: Vec<Chat> = inner.chats.values().cloned().collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list
    }

    /// Appends a message. Returns `None` when the chat does not exist or
    /// the payload is blank text with no attachment.
    pub async fn add_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        sender_name: &str,
        payload: MessagePayload,
    ) -> Option<ChatMessage> {
        if payload.is_blank() {
            return None;
        }

        let mut inner = self.inner.write().await;
        if !inner.chats.contains_key(chat_id) {
            return None;
        }

        let now = now_iso();
        // Timestamps are clamped non-decreasing within a chat so the
        // rendered order never depends on clock jitter.
        let timestamp = inner
            .messages
            .get(chat_id)
            .and_then(|list| list.last())
            .map(|last| last.timestamp.clone().max(now.clone()))
            .unwrap_or_else(|| now.clone());

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            payload,
            is_read: false,
            is_deleted: false,
            timestamp,
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        inner
            .messages
            .entry(chat_id.to_string())
            .or_default()
            .push(message.clone());

        if let Some(chat) = inner.chats.get_mut(chat_id) {
            chat.last_message = Some(message.clone());
            chat.updated_at = now;
        }

        Some(message)
    }

    /// Messages of a chat, newest-first, soft-deleted entries excluded.
    pub async fn messages_newest_first(&self, chat_id: &str) -> Option<Vec<ChatMessage>> {
        let inner = self.inner.read().await;
        let list = inner.messages.get(chat_id)?;
        Some(
            list.iter()
                .rev()
                .filter(|m| !m.is_deleted)
                .cloned()
                .collect(),
        )
    }

    /// Flips `isRead` on every message not sent by `reader_id`. Returns how
    /// many messages changed.
    pub async fn mark_read(&self, chat_id: &str, reader_id: &str) -> usize {
        let mut inner = self.inner.write().await;
        let Some(list) = inner.messages.get_mut(chat_id) else {
            return 0;
        };
        let now = now_iso();
        let mut updated = 0;
        for message in list.iter_mut() {
            if !message.is_read && message.sender_id != reader_id {
                message.is_read = true;
                message.updated_at = now.clone();
                updated += 1;
            }
        }
        updated
    }

    /// Soft delete; the message stays in the store but leaves every view.
    pub async fn soft_delete_message(&self, chat_id: &str, message_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(list) = inner.messages.get_mut(chat_id) else {
            return false;
        };
        match list.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                message.is_deleted = true;
                message.updated_at = now_iso();
                true
            }
            None => false,
        }
    }

    /// Idempotent. The boolean reports whether the status actually changed.
    pub async fn close_chat(&self, chat_id: &str) -> Option<(Chat, bool)> {
        self.transition(chat_id, ChatStatus::Closed).await
    }

    /// Idempotent. The boolean reports whether the status actually changed.
    pub async fn reopen_chat(&self, chat_id: &str) -> Option<(Chat, bool)> {
        self.transition(chat_id, ChatStatus::Open).await
    }

    async fn transition(&self, chat_id: &str, status: ChatStatus) -> Option<(Chat, bool)> {
        let mut inner = self.inner.write().await;
        let chat = inner.chats.get_mut(chat_id)?;
        let changed = chat.status != status;
        if changed {
            chat.set_status(status);
        }
        Some((chat.clone(), changed))
    }
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}
