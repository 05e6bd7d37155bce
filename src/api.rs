use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ChatError, Result};
use crate::types::{
    AdminReplyBody, Chat, ChatMessage, CloseChatBody, CreateChatBody, FileData, MarkReadBody,
    SendMessageBody, UserIdentity,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct ChatEnvelope {
    chat: Chat,
}

#[derive(Deserialize)]
struct ChatsEnvelope {
    chats: Vec<Chat>,
}

#[derive(Deserialize)]
struct MessagesEnvelope {
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct MessageEnvelope {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct TransitionEnvelope {
    chat: Chat,
    changed: bool,
}

#[derive(Deserialize)]
struct FileEnvelope {
    file: FileData,
}

/// Thin client over the chat REST surface. Both front ends go through this;
/// the push channel only ever adds to what these calls return.
#[derive(Clone)]
pub struct ChatApi {
    http: reqwest::Client,
    base_url: String,
}

impl ChatApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn expect_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            // Prefer the server's own error string when it sent one.
            if let Ok(body) = response.json::<Value>().await {
                if let Some(message) = body.get("error").and_then(Value::as_str) {
                    return Err(ChatError::Api(message.to_string()));
                }
            }
            return Err(ChatError::from_status(status.as_u16()));
        }
        response.json::<T>().await.map_err(ChatError::from_reqwest)
    }

    pub async fn create_chat(&self, user: &UserIdentity) -> Result<Chat> {
        let body = CreateChatBody {
            user_id: user.id.clone(),
            user_name: user.name.clone(),
        };
        let response = self
            .http
            .post(self.url("/api/chat/create"))
            .json(&body)
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        Ok(Self::expect_json::<ChatEnvelope>(response).await?.chat)
    }

    pub async fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>> {
        let response = self
            .http
            .get(self.url(&format!("/api/chat/list/{user_id}")))
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        Ok(Self::expect_json::<ChatsEnvelope>(response).await?.chats)
    }

    /// Message history, newest-first as the server serves it.
    pub async fn messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        let response = self
            .http
            .get(self.url(&format!("/api/chat/messages/{chat_id}")))
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        Ok(Self::expect_json::<MessagesEnvelope>(response).await?.messages)
    }

    pub async fn send(&self, body: &SendMessageBody) -> Result<ChatMessage> {
        let response = self
            .http
            .post(self.url("/api/chat/send"))
            .json(body)
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        Ok(Self::expect_json::<MessageEnvelope>(response).await?.message)
    }

    pub async fn mark_read(&self, chat_id: &str, reader_id: &str) -> Result<()> {
        let body = MarkReadBody {
            reader_id: reader_id.to_string(),
        };
        let response = self
            .http
            .post(self.url(&format!("/api/chat/{chat_id}/read")))
            .json(&body)
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        Self::expect_json::<Value>(response).await?;
        Ok(())
    }

    pub async fn admin_chats(&self) -> Result<Vec<Chat>> {
        let response = self
            .http
            .get(self.url("/api/chat"))
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        Ok(Self::expect_json::<ChatsEnvelope>(response).await?.chats)
    }

    pub async fn admin_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        let response = self
            .http
            .get(self.url(&format!("/api/chat/{chat_id}/messages")))
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        Ok(Self::expect_json::<MessagesEnvelope>(response).await?.messages)
    }

    pub async fn admin_reply(&self, chat_id: &str, body: &AdminReplyBody) -> Result<ChatMessage> {
        let response = self
            .http
            .post(self.url(&format!("/api/chat/{chat_id}/messages")))
            .json(body)
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        Ok(Self::expect_json::<MessageEnvelope>(response).await?.message)
    }

    /// Idempotent close; the boolean is whether the status changed.
    pub async fn close_chat(&self, chat_id: &str, admin: &UserIdentity) -> Result<(Chat, bool)> {
        let body = CloseChatBody {
            admin_id: admin.id.clone(),
            admin_name: admin.name.clone(),
        };
        let response = self
            .http
            .post(self.url(&format!("/api/chat/{chat_id}/close")))
            .json(&body)
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        let envelope = Self::expect_json::<TransitionEnvelope>(response).await?;
        Ok((envelope.chat, envelope.changed))
    }

    pub async fn reopen_chat(&self, chat_id: &str) -> Result<(Chat, bool)> {
        let response = self
            .http
            .post(self.url(&format!("/api/chat/{chat_id}/reopen")))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        let envelope = Self::expect_json::<TransitionEnvelope>(response).await?;
        Ok((envelope.chat, envelope.changed))
    }

    pub async fn upload_attachment(
        &self,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<FileData> {
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(ChatError::from_reqwest)?;
        let form = Form::new().part("file", part);
        let response = self
            .http
            .post(self.url("/api/uploads/attachment"))
            .multipart(form)
            .send()
            .await
            .map_err(ChatError::from_reqwest)?;
        Ok(Self::expect_json::<FileEnvelope>(response).await?.file)
    }
}
