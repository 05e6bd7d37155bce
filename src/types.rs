use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::atomic::AtomicUsize,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::store::ChatStore;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Authenticated identity handed over by the (external) auth layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub status: ChatStatus,
    pub is_closed: bool,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<ChatMessage>,
}

impl Chat {
    pub fn new(user_id: &str, user_name: &str) -> Self {
        let now = now_iso();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            status: ChatStatus::Open,
            is_closed: false,
            created_at: now.clone(),
            updated_at: now,
            last_message: None,
        }
    }

    // `is_closed` is derived; this is the only place that writes either field.
    pub fn set_status(&mut self, status: ChatStatus) {
        self.status = status;
        self.is_closed = status == ChatStatus::Closed;
        self.updated_at = now_iso();
    }

    pub fn is_open(&self) -> bool {
        self.status == ChatStatus::Open
    }
}

/// A message body is either plain text or an uploaded file, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MessagePayload {
    Text { text: String },
    File { name: String, mime_type: String, url: String },
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Self::Text { text } => text.trim().is_empty(),
            Self::File { .. } => false,
        }
    }

    /// Short form used for chat-list previews and context entries.
    pub fn preview(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::File { name, .. } => format!("📎 {name}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(flatten)]
    pub payload: MessagePayload,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_deleted: bool,
    pub timestamp: String,
    pub created_at: String,
    pub updated_at: String,
}

/// File descriptor as carried on the send body (`fileData`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub url: String,
}

impl From<FileData> for MessagePayload {
    fn from(file: FileData) -> Self {
        MessagePayload::File {
            name: file.name,
            mime_type: file.mime_type,
            url: file.url,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatBody {
    pub user_id: String,
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<FileData>,
}

impl SendMessageBody {
    // File wins when both are present; one message carries one payload.
    pub fn into_payload(self) -> MessagePayload {
        match self.file_data {
            Some(file) => file.into(),
            None => MessagePayload::text(self.message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminReplyBody {
    #[serde(default = "default_admin_name")]
    pub sender_name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<FileData>,
}

fn default_admin_name() -> String {
    "Support".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseChatBody {
    pub admin_id: String,
    pub admin_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadBody {
    pub reader_id: String,
}

/// Wire envelope for every push-channel frame, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    pub admins: HashSet<usize>,
    pub chat_watchers: HashMap<String, HashSet<usize>>,
    pub watched_chat: HashMap<usize, String>,
    pub typing_chat: HashMap<usize, String>,
}

pub struct AppState {
    pub store: ChatStore,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
    pub media_dir: PathBuf,
}

impl AppState {
    pub fn new(media_dir: PathBuf) -> Self {
        Self {
            store: ChatStore::new(),
            realtime: Mutex::new(RealtimeState::default()),
            next_client_id: AtomicUsize::new(0),
            media_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_is_closed_stay_consistent() {
        let mut chat = Chat::new("u1", "Sara");
        assert!(chat.is_open());
        assert!(!chat.is_closed);

        chat.set_status(ChatStatus::Closed);
        assert!(!chat.is_open());
        assert!(chat.is_closed);

        chat.set_status(ChatStatus::Open);
        assert!(chat.is_open());
        assert!(!chat.is_closed);
    }

    #[test]
    fn payload_round_trips_as_tagged_variant() {
        let text = serde_json::to_value(MessagePayload::text("hi")).unwrap();
        assert_eq!(text["kind"], "text");

        let file: MessagePayload = FileData {
            name: "report.pdf".into(),
            mime_type: "application/pdf".into(),
            url: "/api/media/x.pdf".into(),
        }
        .into();
        let value = serde_json::to_value(&file).unwrap();
        assert_eq!(value["kind"], "file");
        assert_eq!(value["mimeType"], "application/pdf");
        assert_eq!(serde_json::from_value::<MessagePayload>(value).unwrap(), file);
    }

    #[test]
    fn blank_text_with_file_resolves_to_file_payload() {
        let body = SendMessageBody {
            chat_id: "c1".into(),
            sender_id: "u1".into(),
            sender_name: "Sara".into(),
            message: "   ".into(),
            file_data: Some(FileData {
                name: "photo.png".into(),
                mime_type: "image/png".into(),
                url: "/api/media/p.png".into(),
            }),
        };
        assert!(!body.into_payload().is_blank());
    }
}
