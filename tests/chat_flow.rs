use std::{sync::Arc, time::Duration};

use support_chat::{
    admin::AdminPanel,
    api::ChatApi,
    app,
    context::MemoryStorage,
    error::ChatError,
    session::ChatSession,
    transport::{OutboundEvent, PollingTransport, Transport, TransportEvent},
    types::{AppState, ChatStatus, UserIdentity},
};

async fn spawn_server() -> (String, tokio::task::JoinHandle<()>) {
    let media_dir =
        std::env::temp_dir().join(format!("support-chat-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&media_dir).unwrap();
    let state = Arc::new(AppState::new(media_dir));
    let router = app::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (format!("http://{addr}"), handle)
}

fn visitor() -> UserIdentity {
    UserIdentity {
        id: "u1".into(),
        name: "Sara".into(),
    }
}

fn admin() -> UserIdentity {
    UserIdentity {
        id: "admin".into(),
        name: "Support".into(),
    }
}

#[tokio::test]
async fn first_contact_creates_exactly_one_open_chat() {
    let (base, _server) = spawn_server().await;

    let mut session = ChatSession::new(
        ChatApi::new(&base),
        Arc::new(MemoryStorage::new()),
        visitor(),
    );
    let chat_id = session.initialize().await.unwrap();

    // A second widget for the same user adopts the same open chat.
    let mut second = ChatSession::new(
        ChatApi::new(&base),
        Arc::new(MemoryStorage::new()),
        visitor(),
    );
    let second_id = second.initialize().await.unwrap();
    assert_eq!(chat_id, second_id);

    let api = ChatApi::new(&base);
    let chats = api.admin_chats().await.unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].status, ChatStatus::Open);
    assert!(!chats[0].is_closed);
}

#[tokio::test]
async fn optimistic_send_reconciles_with_the_server_ack() {
    let (base, _server) = spawn_server().await;

    let mut session = ChatSession::new(
        ChatApi::new(&base),
        Arc::new(MemoryStorage::new()),
        visitor(),
    );
    session.initialize().await.unwrap();

    let confirmed = session.send_message("سلام", None).await.unwrap().unwrap();
    assert_eq!(session.messages().len(), 1);

    // The optimistic entry was replaced in place, not re-appended.
    let rendered = &session.messages()[0];
    assert_eq!(rendered.id, confirmed.id);
    assert!(!rendered.id.starts_with("temp-"));
    assert_eq!(rendered.sender_id, "u1");
}

#[tokio::test]
async fn visitor_and_admin_exchange_renders_in_timestamp_order() {
    let (base, _server) = spawn_server().await;

    let mut session = ChatSession::new(
        ChatApi::new(&base),
        Arc::new(MemoryStorage::new()),
        visitor(),
    );
    let chat_id = session.initialize().await.unwrap();
    session.send_message("سوال اول", None).await.unwrap();
    session.send_message("سوال دوم", None).await.unwrap();

    let mut panel = AdminPanel::new(ChatApi::new(&base), admin());
    panel.refresh_chat_list().await.unwrap();
    assert_eq!(panel.chats().len(), 1);
    panel.select_chat(&chat_id).await.unwrap();
    assert_eq!(panel.messages().len(), 2);

    panel.send_reply("پاسخ پشتیبانی").await.unwrap();
    panel.refresh_messages().await.unwrap();
    assert_eq!(panel.messages().len(), 3);
    for pair in panel.messages().windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    // The list refresh picked up the reply as the preview.
    let preview = panel.chats()[0].last_message.as_ref().unwrap();
    assert_eq!(preview.sender_id, "admin");

    // Visitor refresh sees all three in the same order.
    session.refresh_history().await.unwrap();
    assert_eq!(session.messages().len(), 3);
}

#[tokio::test]
async fn close_then_reopen_ends_open_with_two_transitions() {
    let (base, _server) = spawn_server().await;
    let api = ChatApi::new(&base);

    let mut session = ChatSession::new(
        ChatApi::new(&base),
        Arc::new(MemoryStorage::new()),
        visitor(),
    );
    let chat_id = session.initialize().await.unwrap();

    let (closed, changed) = api.close_chat(&chat_id, &admin()).await.unwrap();
    assert!(changed);
    assert_eq!(closed.status, ChatStatus::Closed);
    assert!(closed.is_closed);

    // A list poll between the transitions never observes an inconsistent
    // pair of status fields.
    for chat in api.admin_chats().await.unwrap() {
        assert_eq!(chat.is_closed, chat.status == ChatStatus::Closed);
    }

    // Closing again changes nothing.
    let (_, changed_again) = api.close_chat(&chat_id, &admin()).await.unwrap();
    assert!(!changed_again);

    let (reopened, changed) = api.reopen_chat(&chat_id).await.unwrap();
    assert!(changed);
    assert_eq!(reopened.status, ChatStatus::Open);
    assert!(!reopened.is_closed);
}

#[tokio::test]
async fn history_failure_keeps_cached_messages_visible() {
    let (base, server) = spawn_server().await;

    let mut session = ChatSession::new(
        ChatApi::new(&base),
        Arc::new(MemoryStorage::new()),
        visitor(),
    );
    session.initialize().await.unwrap();
    session.send_message("سلام", None).await.unwrap();
    session.refresh_history().await.unwrap();
    assert_eq!(session.messages().len(), 1);

    // Server goes away; the fetch fails but the cache survives.
    server.abort();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = session.refresh_history().await.unwrap_err();
    assert!(matches!(err, ChatError::Offline | ChatError::Api(_) | ChatError::HttpStatus(_)));
    assert_eq!(session.messages().len(), 1);
    assert!(!session.take_notifications().is_empty());

    // A manual retry is the same fetch again.
    assert!(session.refresh_history().await.is_err());
    assert_eq!(session.messages().len(), 1);
}

#[tokio::test]
async fn file_attachments_round_trip_through_upload_and_send() {
    let (base, _server) = spawn_server().await;
    let api = ChatApi::new(&base);

    let mut session = ChatSession::new(
        ChatApi::new(&base),
        Arc::new(MemoryStorage::new()),
        visitor(),
    );
    session.initialize().await.unwrap();

    let file = api
        .upload_attachment("report.pdf", "application/pdf", b"%PDF-1.4 test".to_vec())
        .await
        .unwrap();
    assert_eq!(file.name, "report.pdf");
    assert!(file.url.starts_with("/api/media/"));

    let sent = session.send_message("", Some(file)).await.unwrap().unwrap();
    match sent.payload {
        support_chat::types::MessagePayload::File { ref name, .. } => {
            assert_eq!(name, "report.pdf")
        }
        _ => panic!("expected a file payload"),
    }
}

#[tokio::test]
async fn polling_transport_surfaces_new_messages_exactly_once() {
    let (base, _server) = spawn_server().await;
    let api = ChatApi::new(&base);

    let mut session = ChatSession::new(
        ChatApi::new(&base),
        Arc::new(MemoryStorage::new()),
        visitor(),
    );
    let chat_id = session.initialize().await.unwrap();

    let mut transport = PollingTransport::new(api.clone(), Duration::from_millis(50));
    let mut events = transport.subscribe();
    transport.connect().unwrap();
    transport
        .send(OutboundEvent::Join {
            chat_id: chat_id.clone(),
            as_admin: false,
        })
        .unwrap();

    session.send_message("سلام", None).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("poll event expected")
        .unwrap();
    let first_id = match event {
        TransportEvent::Message(m) => {
            assert_eq!(m.chat_id, chat_id);
            m.id
        }
        other => panic!("unexpected event: {other:?}"),
    };

    // Subsequent polls re-fetch the same history but emit nothing new.
    let duplicate = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(duplicate.is_err(), "duplicate event for {first_id}");

    transport.shutdown();
}
