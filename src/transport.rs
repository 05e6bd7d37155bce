use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::json;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::warn;

use crate::api::ChatApi;
use crate::error::Result;
use crate::types::{ChatMessage, EventEnvelope};

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Push events as the client cores consume them.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(ChatMessage),
    Typing { chat_id: String, active: bool },
    Error(String),
}

/// Client-to-server signals. State-changing calls (send, close, reopen)
/// always go over REST; the push channel only carries presence signals.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    Join { chat_id: String, as_admin: bool },
    Typing { chat_id: String, active: bool },
}

/// One seam, two delivery strategies: a persistent push connection or
/// plain polling. Duplicate delivery is allowed on both; deduplication is
/// the consumer's job.
pub trait Transport: Send + Sync {
    fn connect(&mut self) -> Result<()>;
    fn send(&self, event: OutboundEvent) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
    fn shutdown(&mut self);
}

/// Decodes event envelopes arriving on an established socket. The socket
/// read/write loops live with the connection owner; this type only owns the
/// two channel halves.
pub struct RealtimeTransport {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: Option<mpsc::UnboundedReceiver<String>>,
    events: broadcast::Sender<TransportEvent>,
    decode_task: Option<JoinHandle<()>>,
}

impl RealtimeTransport {
    pub fn new(
        outgoing: mpsc::UnboundedSender<String>,
        incoming: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            outgoing,
            incoming: Some(incoming),
            events,
            decode_task: None,
        }
    }

    fn decode(raw: &str) -> Option<TransportEvent> {
        let envelope: EventEnvelope = serde_json::from_str(raw).ok()?;
        match envelope.event.as_str() {
            "new_message" => serde_json::from_value(envelope.data)
                .ok()
                .map(TransportEvent::Message),
            "typing" => {
                let chat_id = envelope.data.get("chatId")?.as_str()?.to_string();
                let active = envelope
                    .data
                    .get("active")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                Some(TransportEvent::Typing { chat_id, active })
            }
            "error" => {
                let message = envelope
                    .data
                    .get("message")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("push channel error")
                    .to_string();
                Some(TransportEvent::Error(message))
            }
            _ => None,
        }
    }
}

impl Transport for RealtimeTransport {
    fn connect(&mut self) -> Result<()> {
        let Some(mut incoming) = self.incoming.take() else {
            return Ok(());
        };
        let events = self.events.clone();
        self.decode_task = Some(tokio::spawn(async move {
            while let Some(raw) = incoming.recv().await {
                if let Some(event) = Self::decode(&raw) {
                    let _ = events.send(event);
                }
            }
        }));
        Ok(())
    }

    fn send(&self, event: OutboundEvent) -> Result<()> {
        let frame = match event {
            OutboundEvent::Join { chat_id, as_admin } => {
                let name = if as_admin { "admin:join" } else { "visitor:join" };
                json!({ "event": name, "data": { "chatId": chat_id } })
            }
            OutboundEvent::Typing { chat_id, active } => {
                json!({ "event": "typing", "data": { "chatId": chat_id, "active": active } })
            }
        };
        let _ = self.outgoing.send(frame.to_string());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.decode_task.take() {
            task.abort();
        }
    }
}

/// REST-only fallback: re-fetches the watched chat on an interval and
/// synthesizes `Message` events for ids it has not seen before. Typing
/// signals have no channel here and are dropped.
pub struct PollingTransport {
    api: ChatApi,
    watched: Arc<Mutex<Option<String>>>,
    interval: Duration,
    events: broadcast::Sender<TransportEvent>,
    poll_task: Option<JoinHandle<()>>,
}

impl PollingTransport {
    pub fn new(api: ChatApi, interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            api,
            watched: Arc::new(Mutex::new(None)),
            interval,
            events,
            poll_task: None,
        }
    }
}

impl Transport for PollingTransport {
    fn connect(&mut self) -> Result<()> {
        if self.poll_task.is_some() {
            return Ok(());
        }

        let api = self.api.clone();
        let watched = Arc::clone(&self.watched);
        let events = self.events.clone();
        let interval = self.interval;

        self.poll_task = Some(tokio::spawn(async move {
            let mut seen: HashSet<String> = HashSet::new();
            let mut current: Option<String> = None;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let chat_id = watched.lock().ok().and_then(|guard| guard.clone());
                let Some(chat_id) = chat_id else {
                    continue;
                };
                if current.as_deref() != Some(&chat_id) {
                    seen.clear();
                    current = Some(chat_id.clone());
                }

                match api.messages(&chat_id).await {
                    Ok(messages) => {
                        // Newest-first on the wire; replay oldest-first.
                        for message in messages.into_iter().rev() {
                            if seen.insert(message.id.clone()) {
                                let _ = events.send(TransportEvent::Message(message));
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%chat_id, "message poll failed: {err}");
                        let _ = events.send(TransportEvent::Error(err.user_message()));
                    }
                }
            }
        }));
        Ok(())
    }

    fn send(&self, event: OutboundEvent) -> Result<()> {
        match event {
            OutboundEvent::Join { chat_id, .. } => {
                if let Ok(mut guard) = self.watched.lock() {
                    *guard = Some(chat_id);
                }
            }
            // No typing channel over plain REST.
            OutboundEvent::Typing { .. } => {}
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Drop for RealtimeTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
