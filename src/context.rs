use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Rolling window size for the conversational context.
pub const MAX_CONTEXT_MESSAGES: usize = 10;

pub const KEY_ACTIVE_CHAT_ID: &str = "support_chat.active_chat_id";
pub const KEY_CONVERSATION_CONTEXT: &str = "support_chat.conversation_context";
pub const KEY_AUTH_TOKEN: &str = "support_chat.auth_token";

/// Local-storage analog. One owning session writes it; concurrent writers
/// get last-write-wins, nothing stronger.
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

/// JSON-map file on disk, rewritten whole on every set. A missing or
/// unreadable file just behaves as empty.
pub struct FileStorage {
    path: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let cache = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            cache: Mutex::new(cache),
        }
    }

    fn flush(&self, entries: &HashMap<String, String>) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(entries) {
            Ok(raw) => {
                if let Err(err) = fs::write(&self.path, raw) {
                    debug!(path = %self.path.display(), %err, "failed to flush storage");
                }
            }
            Err(err) => debug!(%err, "failed to serialize storage"),
        }
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.cache.lock() {
            entries.insert(key.to_string(), value.to_string());
            self.flush(&entries);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.cache.lock() {
            entries.remove(key);
            self.flush(&entries);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub sender_id: String,
    pub text: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Formal,
    Casual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    pub language: String,
    pub tone: Tone,
    pub topics: Vec<String>,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            language: "fa".to_string(),
            tone: Tone::Formal,
            topics: Vec::new(),
        }
    }
}

/// Partial preference update; `None` fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesPatch {
    pub language: Option<String>,
    pub tone: Option<Tone>,
    pub topics: Option<Vec<String>>,
}

/// Bounded recent-message window plus preferences, sent along with outbound
/// messages to bias the assistant. Owned by one browser profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    pub last_messages: Vec<ContextEntry>,
    pub user_preferences: UserPreferences,
}

impl ConversationContext {
    /// Appends one entry, evicting the oldest once the window is full.
    pub fn record(&mut self, entry: ContextEntry) {
        if self.last_messages.len() >= MAX_CONTEXT_MESSAGES {
            self.last_messages.remove(0);
        }
        self.last_messages.push(entry);
    }

    /// Loads the whole context as one unit. Corrupt or missing storage
    /// yields the default context; there is no partial recovery.
    pub fn load(storage: &dyn KeyValueStorage) -> Self {
        match storage.get(KEY_CONVERSATION_CONTEXT) {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                debug!(%err, "conversation context was corrupt, resetting");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn persist(&self, storage: &dyn KeyValueStorage) {
        if let Ok(raw) = serde_json::to_string(self) {
            storage.set(KEY_CONVERSATION_CONTEXT, &raw);
        }
    }

    /// Shallow-merges the patch and persists immediately.
    pub fn update_preferences(&mut self, patch: PreferencesPatch, storage: &dyn KeyValueStorage) {
        if let Some(language) = patch.language {
            self.user_preferences.language = language;
        }
        if let Some(tone) = patch.tone {
            self.user_preferences.tone = tone;
        }
        if let Some(topics) = patch.topics {
            self.user_preferences.topics = topics;
        }
        self.persist(storage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: usize) -> ContextEntry {
        ContextEntry {
            sender_id: "u1".into(),
            text: format!("m{i}"),
            timestamp: format!("2026-01-01T00:00:{i:02}Z"),
        }
    }

    #[test]
    fn eleventh_record_evicts_the_oldest() {
        let mut ctx = ConversationContext::default();
        for i in 0..11 {
            ctx.record(entry(i));
        }
        assert_eq!(ctx.last_messages.len(), MAX_CONTEXT_MESSAGES);
        assert_eq!(ctx.last_messages[0].text, "m1");
        assert_eq!(ctx.last_messages[9].text, "m10");
        // Relative order of the survivors is untouched.
        for (i, e) in ctx.last_messages.iter().enumerate() {
            assert_eq!(e.text, format!("m{}", i + 1));
        }
    }

    #[test]
    fn corrupt_storage_loads_defaults() {
        let storage = MemoryStorage::new();
        storage.set(KEY_CONVERSATION_CONTEXT, "{not json!");
        let ctx = ConversationContext::load(&storage);
        assert_eq!(ctx, ConversationContext::default());
    }

    #[test]
    fn context_round_trips_as_one_unit() {
        let storage = MemoryStorage::new();
        let mut ctx = ConversationContext::default();
        ctx.record(entry(0));
        ctx.persist(&storage);

        let loaded = ConversationContext::load(&storage);
        assert_eq!(loaded, ctx);
    }

    #[test]
    fn preference_patch_merges_and_persists() {
        let storage = MemoryStorage::new();
        let mut ctx = ConversationContext::default();
        ctx.update_preferences(
            PreferencesPatch {
                tone: Some(Tone::Casual),
                topics: Some(vec!["ثبت‌نام".into()]),
                ..Default::default()
            },
            &storage,
        );

        assert_eq!(ctx.user_preferences.tone, Tone::Casual);
        // Untouched field keeps its default.
        assert_eq!(ctx.user_preferences.language, "fa");
        assert_eq!(ConversationContext::load(&storage), ctx);
    }

    #[test]
    fn file_storage_survives_reload() {
        let path = std::env::temp_dir().join(format!("support-chat-{}.json", uuid::Uuid::new_v4()));
        {
            let storage = FileStorage::new(&path);
            storage.set(KEY_ACTIVE_CHAT_ID, "chat-1");
        }
        let reloaded = FileStorage::new(&path);
        assert_eq!(reloaded.get(KEY_ACTIVE_CHAT_ID).as_deref(), Some("chat-1"));
        let _ = std::fs::remove_file(&path);
    }
}
