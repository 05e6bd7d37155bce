use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::Mutex, task::JoinHandle};
use tracing::debug;

use crate::api::ChatApi;
use crate::error::{ChatError, Result};
use crate::session::{Notification, TYPING_RESET};
use crate::transport::TransportEvent;
use crate::types::{AdminReplyBody, Chat, ChatMessage, UserIdentity};

pub const CHAT_LIST_POLL: Duration = Duration::from_secs(10);
pub const MESSAGE_POLL: Duration = Duration::from_secs(5);

/// Auto-scroll only fires when the view is already this close to the
/// bottom, or when new messages arrived.
pub const AUTO_SCROLL_THRESHOLD_PX: u32 = 100;

fn should_auto_scroll(old_len: usize, new_len: usize, bottom_distance_px: u32) -> bool {
    new_len > old_len || bottom_distance_px <= AUTO_SCROLL_THRESHOLD_PX
}

/// Admin-side panel core: the polled chat list, one selected chat's message
/// buffer, and the close/reopen lifecycle actions. Holds cached mirrors
/// only; every poll replaces them wholesale.
pub struct AdminPanel {
    api: ChatApi,
    identity: UserIdentity,
    chats: Vec<Chat>,
    selected_chat_id: Option<String>,
    // Display order, oldest first.
    messages: Vec<ChatMessage>,
    seen_ids: HashSet<String>,
    visitor_typing: Arc<AtomicBool>,
    typing_reset: Option<JoinHandle<()>>,
    notifications: VecDeque<Notification>,
    bottom_distance_px: u32,
    scroll_pending: bool,
}

impl AdminPanel {
    pub fn new(api: ChatApi, identity: UserIdentity) -> Self {
        Self {
            api,
            identity,
            chats: Vec::new(),
            selected_chat_id: None,
            messages: Vec::new(),
            seen_ids: HashSet::new(),
            visitor_typing: Arc::new(AtomicBool::new(false)),
            typing_reset: None,
            notifications: VecDeque::new(),
            bottom_distance_px: 0,
            scroll_pending: false,
        }
    }

    pub fn chats(&self) -> &[Chat] {
        &self.chats
    }

    pub fn selected_chat_id(&self) -> Option<&str> {
        self.selected_chat_id.as_deref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_visitor_typing(&self) -> bool {
        self.visitor_typing.load(Ordering::SeqCst)
    }

    /// Replaces the whole chat list. The selected chat's message buffer is
    /// untouched, so a list poll never disturbs the open conversation.
    pub async fn refresh_chat_list(&mut self) -> Result<()> {
        match self.api.admin_chats().await {
            Ok(chats) => {
                self.chats = chats;
                Ok(())
            }
            Err(err) => {
                self.notify(Notification::error(err.user_message()));
                Err(err)
            }
        }
    }

    /// Selects a chat: the previous buffer is cleared *before* the new
    /// history loads, so messages never bleed across chats.
    pub async fn select_chat(&mut self, chat_id: &str) -> Result<()> {
        self.selected_chat_id = Some(chat_id.to_string());
        self.messages.clear();
        self.seen_ids.clear();
        self.visitor_typing.store(false, Ordering::SeqCst);
        self.refresh_messages().await
    }

    pub fn deselect_chat(&mut self) {
        self.selected_chat_id = None;
        self.messages.clear();
        self.seen_ids.clear();
    }

    /// Full-replace merge of the selected chat's history; the server's
    /// order is authoritative. Decides auto-scroll from the length diff
    /// and the current scroll position.
    pub async fn refresh_messages(&mut self) -> Result<()> {
        let Some(chat_id) = self.selected_chat_id.clone() else {
            return Ok(());
        };

        match self.api.admin_messages(&chat_id).await {
            Ok(newest_first) => {
                // Selection may have moved while the request was in
                // flight; the response for the old chat is stale.
                if self.selected_chat_id.as_deref() != Some(chat_id.as_str()) {
                    return Ok(());
                }
                let old_len = self.messages.len();
                self.messages = newest_first.into_iter().rev().collect();
                self.seen_ids = self.messages.iter().map(|m| m.id.clone()).collect();
                if should_auto_scroll(old_len, self.messages.len(), self.bottom_distance_px) {
                    self.scroll_pending = true;
                }
                Ok(())
            }
            Err(err) => {
                self.notify(Notification::error(err.user_message()));
                Err(err)
            }
        }
    }

    /// Posts a reply with the fixed admin sender id. Blank text is a no-op.
    pub async fn send_reply(&mut self, text: &str) -> Result<Option<ChatMessage>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        let Some(chat_id) = self.selected_chat_id.clone() else {
            let err = ChatError::NoActiveChat;
            self.notify(Notification::error(err.user_message()));
            return Err(err);
        };

        let body = AdminReplyBody {
            sender_name: self.identity.name.clone(),
            message: text.trim().to_string(),
            file_data: None,
        };

        match self.api.admin_reply(&chat_id, &body).await {
            Ok(message) => {
                if self.seen_ids.insert(message.id.clone()) {
                    self.messages.push(message.clone());
                }
                self.scroll_pending = true;
                // Keep lastMessage previews in the list current.
                let _ = self.refresh_chat_list().await;
                Ok(Some(message))
            }
            Err(err) => {
                self.notify(Notification::error(err.user_message()));
                Err(err)
            }
        }
    }

    pub async fn close_chat(&mut self) -> Result<Chat> {
        let Some(chat_id) = self.selected_chat_id.clone() else {
            let err = ChatError::NoActiveChat;
            self.notify(Notification::error(err.user_message()));
            return Err(err);
        };

        match self.api.close_chat(&chat_id, &self.identity).await {
            Ok((chat, changed)) => {
                debug!(chat_id = %chat.id, changed, "chat closed");
                self.notify(Notification::success("گفتگو بسته شد"));
                let _ = self.refresh_chat_list().await;
                Ok(chat)
            }
            Err(err) => {
                // The server's error text is surfaced verbatim.
                self.notify(Notification::error(err.user_message()));
                Err(err)
            }
        }
    }

    pub async fn reopen_chat(&mut self) -> Result<Chat> {
        let Some(chat_id) = self.selected_chat_id.clone() else {
            let err = ChatError::NoActiveChat;
            self.notify(Notification::error(err.user_message()));
            return Err(err);
        };

        match self.api.reopen_chat(&chat_id).await {
            Ok((chat, _changed)) => {
                self.notify(Notification::success("گفتگو دوباره باز شد"));
                let _ = self.refresh_chat_list().await;
                Ok(chat)
            }
            Err(err) => {
                self.notify(Notification::error(err.user_message()));
                Err(err)
            }
        }
    }

    /// Merges a push event. Events for the selected chat go through the
    /// same dedup/order path as polls; events for other chats only bump
    /// the list.
    pub async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => {
                if self.selected_chat_id.as_deref() == Some(message.chat_id.as_str()) {
                    if self.seen_ids.insert(message.id.clone()) {
                        self.messages.push(message);
                        self.ensure_order();
                        self.scroll_pending = true;
                    }
                } else {
                    let _ = self.refresh_chat_list().await;
                }
            }
            TransportEvent::Typing { chat_id, active } => {
                if self.selected_chat_id.as_deref() != Some(chat_id.as_str()) {
                    return;
                }
                if active {
                    self.arm_typing_reset();
                } else {
                    self.visitor_typing.store(false, Ordering::SeqCst);
                    if let Some(previous) = self.typing_reset.take() {
                        previous.abort();
                    }
                }
            }
            TransportEvent::Error(message) => {
                self.notify(Notification::error(message));
            }
        }
    }

    fn arm_typing_reset(&mut self) {
        self.visitor_typing.store(true, Ordering::SeqCst);
        if let Some(previous) = self.typing_reset.take() {
            previous.abort();
        }
        let flag = Arc::clone(&self.visitor_typing);
        self.typing_reset = Some(tokio::spawn(async move {
            tokio::time::sleep(TYPING_RESET).await;
            flag.store(false, Ordering::SeqCst);
        }));
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

    /// Reported by the UI on scroll; distance from the bottom in pixels.
    pub fn set_bottom_distance(&mut self, px: u32) {
        self.bottom_distance_px = px;
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
        if let Some(previous) = self.typing_reset.take() {
            previous.abort();
        }
    }
}

impl Drop for AdminPanel {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// The two fixed-interval poll loops. Fixed rates, no backoff and no
/// visibility-based pausing; staleness self-heals within one interval.
pub struct PanelPollers {
    list_task: JoinHandle<()>,
    message_task: JoinHandle<()>,
}

impl PanelPollers {
    pub fn stop(&self) {
        self.list_task.abort();
        self.message_task.abort();
    }
}

impl Drop for PanelPollers {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn spawn_pollers(panel: Arc<Mutex<AdminPanel>>) -> PanelPollers {
    let list_panel = Arc::clone(&panel);
    let list_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CHAT_LIST_POLL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let _ = list_panel.lock().await.refresh_chat_list().await;
        }
    });

    let message_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MESSAGE_POLL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let mut panel = panel.lock().await;
            if panel.selected_chat_id().is_some() {
                let _ = panel.refresh_messages().await;
            }
        }
    });

    PanelPollers { list_task, message_task }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_panel() -> AdminPanel {
        AdminPanel::new(
            ChatApi::new("http://127.0.0.1:9"),
            UserIdentity { id: "admin".into(), name: "Support".into() },
        )
    }

    #[test]
    fn auto_scroll_needs_new_messages_or_a_near_bottom_view() {
        // New messages always scroll.
        assert!(should_auto_scroll(3, 5, 900));
        // No new messages: only when already near the bottom.
        assert!(should_auto_scroll(5, 5, AUTO_SCROLL_THRESHOLD_PX));
        assert!(!should_auto_scroll(5, 5, AUTO_SCROLL_THRESHOLD_PX + 1));
    }

    #[tokio::test]
    async fn selecting_a_chat_clears_the_previous_buffer() {
        let mut panel = offline_panel();
        panel.selected_chat_id = Some("old".into());
        panel
            .handle_event(TransportEvent::Message(ChatMessage {
                id: "m1".into(),
                chat_id: "old".into(),
                sender_id: "u1".into(),
                sender_name: "Sara".into(),
                payload: crate::types::MessagePayload::text("hi"),
                is_read: false,
                is_deleted: false,
                timestamp: "2026-01-01T00:00:01+00:00".into(),
                created_at: "2026-01-01T00:00:01+00:00".into(),
                updated_at: "2026-01-01T00:00:01+00:00".into(),
            }))
            .await;
        assert_eq!(panel.messages().len(), 1);

        // The fetch itself fails offline, but the buffer must already be
        // empty the moment the selection moves.
        let _ = panel.select_chat("new").await;
        assert!(panel.messages().is_empty());
        assert_eq!(panel.selected_chat_id(), Some("new"));
    }

    #[tokio::test]
    async fn blank_reply_is_a_noop() {
        let mut panel = offline_panel();
        panel.selected_chat_id = Some("c1".into());
        assert!(panel.send_reply("  ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lifecycle_actions_require_a_selection() {
        let mut panel = offline_panel();
        assert!(matches!(panel.close_chat().await.unwrap_err(), ChatError::NoActiveChat));
        assert!(matches!(panel.reopen_chat().await.unwrap_err(), ChatError::NoActiveChat));
    }
}
