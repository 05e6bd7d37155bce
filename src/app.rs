use std::sync::{atomic::Ordering, Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Multipart, Path, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{
    now_iso, AdminReplyBody, AppState, ChatMessage, CloseChatBody, CreateChatBody, EventEnvelope,
    MarkReadBody, SendMessageBody,
};

pub const ADMIN_SENDER_ID: &str = "admin";

fn event_payload<T: serde::Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

async fn emit_to_client<T: serde::Serialize>(
    state: &Arc<AppState>,
    client_id: usize,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };

    if let Some(sender) = tx {
        let _ = sender.send(payload);
    }
}

async fn emit_to_clients<T: serde::Serialize>(
    state: &Arc<AppState>,
    client_ids: &[usize],
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let senders = {
        let rt = state.realtime.lock().await;
        client_ids
            .iter()
            .filter_map(|id| rt.clients.get(id).cloned())
            .collect::<Vec<_>>()
    };

    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

/// Watchers of the chat plus every connected admin, deduplicated.
async fn recipients_for_chat(state: &Arc<AppState>, chat_id: &str) -> Vec<usize> {
    let rt = state.realtime.lock().await;
    let mut ids = std::collections::HashSet::new();
    if let Some(watchers) = rt.chat_watchers.get(chat_id) {
        ids.extend(watchers.iter().copied());
    }
    ids.extend(rt.admins.iter().copied());
    ids.into_iter().collect()
}

async fn admin_client_ids(state: &Arc<AppState>) -> Vec<usize> {
    let rt = state.realtime.lock().await;
    rt.admins.iter().copied().collect()
}

async fn broadcast_new_message(state: &Arc<AppState>, message: &ChatMessage) {
    let recipients = recipients_for_chat(state, &message.chat_id).await;
    emit_to_clients(state, &recipients, "new_message", message).await;

    if let Some(chat) = state.store.chat(&message.chat_id).await {
        let admins = admin_client_ids(state).await;
        emit_to_clients(state, &admins, "chat:updated", chat).await;
    }
}

async fn broadcast_chat_update(state: &Arc<AppState>, chat_id: &str) {
    if let Some(chat) = state.store.chat(chat_id).await {
        let admins = admin_client_ids(state).await;
        emit_to_clients(state, &admins, "chat:updated", chat).await;
    }
}

async fn post_create_chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateChatBody>,
) -> impl IntoResponse {
    if body.user_id.trim().is_empty() || body.user_name.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "userId and userName are required" })),
        )
            .into_response();
    }

    let chat = state.store.create_chat(&body.user_id, &body.user_name).await;
    broadcast_chat_update(&state, &chat.id).await;
    (StatusCode::CREATED, Json(json!({ "chat": chat }))).into_response()
}

async fn get_chat_list(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let chats = state.store.chats_for_user(&user_id).await;
    Json(json!({ "chats": chats }))
}

async fn get_chat_messages(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.store.messages_newest_first(&chat_id).await {
        Some(messages) => Json(json!({ "messages": messages })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "chat not found" })),
        )
            .into_response(),
    }
}

async fn post_send(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    if state.store.chat(&body.chat_id).await.is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "chat not found" })),
        )
            .into_response();
    }

    let chat_id = body.chat_id.clone();
    let sender_id = body.sender_id.clone();
    let sender_name = body.sender_name.clone();
    let payload = body.into_payload();
    if payload.is_blank() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "message text or file is required" })),
        )
            .into_response();
    }

    let Some(message) = state
        .store
        .add_message(&chat_id, &sender_id, &sender_name, payload)
        .await
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unable to create message" })),
        )
            .into_response();
    };

    broadcast_new_message(&state, &message).await;
    (StatusCode::CREATED, Json(json!({ "message": message }))).into_response()
}

async fn post_mark_read(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<MarkReadBody>,
) -> impl IntoResponse {
    let updated = state.store.mark_read(&chat_id, &body.reader_id).await;
    Json(json!({ "updated": updated }))
}

async fn admin_list_chats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let chats = state.store.all_chats().await;
    Json(json!({ "chats": chats }))
}

async fn admin_post_message(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AdminReplyBody>,
) -> impl IntoResponse {
    if state.store.chat(&chat_id).await.is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "chat not found" })),
        )
            .into_response();
    }

    let payload = match body.file_data {
        Some(file) => file.into(),
        None => crate::types::MessagePayload::text(body.message),
    };
    if payload.is_blank() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "message text or file is required" })),
        )
            .into_response();
    }

    // Admin replies always carry the fixed admin sender id.
    let Some(message) = state
        .store
        .add_message(&chat_id, ADMIN_SENDER_ID, &body.sender_name, payload)
        .await
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unable to create message" })),
        )
            .into_response();
    };

    broadcast_new_message(&state, &message).await;
    (StatusCode::CREATED, Json(json!({ "message": message }))).into_response()
}

async fn post_close_chat(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CloseChatBody>,
) -> impl IntoResponse {
    let Some((chat, changed)) = state.store.close_chat(&chat_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "chat not found" })),
        )
            .into_response();
    };

    debug!(chat_id = %chat.id, admin = %body.admin_id, changed, "chat closed");
    broadcast_chat_update(&state, &chat.id).await;
    Json(json!({ "chat": chat, "changed": changed })).into_response()
}

async fn post_reopen_chat(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Some((chat, changed)) = state.store.reopen_chat(&chat_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "chat not found" })),
        )
            .into_response();
    };

    broadcast_chat_update(&state, &chat.id).await;
    Json(json!({ "chat": chat, "changed": changed })).into_response()
}

fn media_extension_from_filename(name: &str) -> Option<String> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext)
}

fn is_safe_media_file_name(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        && !value.contains("..")
}

fn media_content_type_from_extension(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

async fn upload_attachment(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut uploaded: Option<Value> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name().unwrap_or("") != "file" {
            continue;
        }
        let filename = field.file_name().unwrap_or("").to_string();
        let content_type = field
            .content_type()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let bytes = match field.bytes().await {
            Ok(b) if !b.is_empty() => b,
            _ => continue,
        };

        let ext = media_extension_from_filename(&filename).unwrap_or_else(|| "bin".to_string());
        let file_name = format!("{}.{}", Uuid::new_v4(), ext);
        let path = state.media_dir.join(&file_name);
        if tokio::fs::write(&path, &bytes).await.is_err() {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to store uploaded file" })),
            )
                .into_response();
        }

        uploaded = Some(json!({
            "url": format!("/api/media/{file_name}"),
            "name": if filename.is_empty() { file_name.clone() } else { filename.clone() },
            "type": content_type,
        }));
        break;
    }

    let Some(file) = uploaded else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing file field in multipart form" })),
        )
            .into_response();
    };

    (StatusCode::CREATED, Json(json!({ "file": file }))).into_response()
}

async fn serve_media(
    Path(file_name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if !is_safe_media_file_name(&file_name) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid file name" })),
        )
            .into_response();
    }

    let path = state.media_dir.join(&file_name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let ext = media_extension_from_filename(&file_name).unwrap_or_default();
            (
                [(header::CONTENT_TYPE, media_content_type_from_extension(&ext))],
                bytes,
            )
                .into_response()
        }
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "file not found" })),
        )
            .into_response(),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }
    debug!(client_id, "push client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelope>(&text) else {
            emit_to_client(
                &state,
                client_id,
                "error",
                json!({ "message": "malformed event frame" }),
            )
            .await;
            continue;
        };

        match envelope.event.as_str() {
            "visitor:join" => {
                if let Some(chat_id) = envelope.data.get("chatId").and_then(Value::as_str) {
                    let mut rt = state.realtime.lock().await;
                    if let Some(previous) = rt.watched_chat.insert(client_id, chat_id.to_string()) {
                        if let Some(set) = rt.chat_watchers.get_mut(&previous) {
                            set.remove(&client_id);
                        }
                    }
                    rt.chat_watchers
                        .entry(chat_id.to_string())
                        .or_default()
                        .insert(client_id);
                }
            }
            "admin:join" => {
                {
                    let mut rt = state.realtime.lock().await;
                    rt.admins.insert(client_id);
                }
                let chats = state.store.all_chats().await;
                emit_to_client(&state, client_id, "chats:list", chats).await;
            }
            "typing" => {
                let chat_id = envelope
                    .data
                    .get("chatId")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let active = envelope
                    .data
                    .get("active")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if chat_id.is_empty() {
                    continue;
                }

                {
                    let mut rt = state.realtime.lock().await;
                    if active {
                        rt.typing_chat.insert(client_id, chat_id.to_string());
                    } else {
                        rt.typing_chat.remove(&client_id);
                    }
                }

                let recipients: Vec<usize> = recipients_for_chat(&state, chat_id)
                    .await
                    .into_iter()
                    .filter(|id| *id != client_id)
                    .collect();
                emit_to_clients(
                    &state,
                    &recipients,
                    "typing",
                    json!({ "chatId": chat_id, "active": active }),
                )
                .await;
            }
            other => {
                warn!(client_id, event = other, "ignoring unknown push event");
            }
        }
    }

    // Disconnect cleanup; a dangling typing flag is cleared for everyone else.
    let typing_chat = {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
        rt.admins.remove(&client_id);
        if let Some(previous) = rt.watched_chat.remove(&client_id) {
            if let Some(set) = rt.chat_watchers.get_mut(&previous) {
                set.remove(&client_id);
            }
        }
        for watchers in rt.chat_watchers.values_mut() {
            watchers.remove(&client_id);
        }
        rt.typing_chat.remove(&client_id)
    };

    if let Some(chat_id) = typing_chat {
        let recipients = recipients_for_chat(&state, &chat_id).await;
        emit_to_clients(
            &state,
            &recipients,
            "typing",
            json!({ "chatId": chat_id, "active": false }),
        )
        .await;
    }

    debug!(client_id, "push client disconnected");
    send_task.abort();
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/media/{file_name}", get(serve_media))
        .route("/api/uploads/attachment", post(upload_attachment))
        .route("/api/chat/create", post(post_create_chat))
        .route("/api/chat/list/{user_id}", get(get_chat_list))
        .route("/api/chat/messages/{chat_id}", get(get_chat_messages))
        .route("/api/chat/send", post(post_send))
        .route("/api/chat/{chat_id}/read", post(post_mark_read))
        .route("/api/chat", get(admin_list_chats))
        .route("/api/chat/{chat_id}/messages", get(get_chat_messages).post(admin_post_message))
        .route("/api/chat/{chat_id}/close", post(post_close_chat))
        .route("/api/chat/{chat_id}/reopen", post(post_reopen_chat))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
