use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use shared::{ChatMessage, ReportId};
use tracing::{debug, warn};

use crate::error::CacheError;

/// Key-value store the chat history is persisted into.
pub trait ChatCache: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn save(&self, key: &str, value: &str) -> Result<(), CacheError>;
}

pub fn cache_key(report_id: &ReportId) -> String {
    format!("report_chat_{report_id}")
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.entries.lock().insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }
}

impl ChatCache for MemoryCache {
    fn load(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.get(key))
    }

    fn save(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.insert(key, value);
        Ok(())
    }
}

/// One JSON file per key under `dir`.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Percent-encoded, so distinct keys never share a file and no key
    /// escapes `dir`.
    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(key)))
    }
}

impl ChatCache for FileCache {
    fn load(&self, key: &str) -> Result<Option<String>, CacheError> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).map_err(|source| CacheError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.path_for(key);
        fs::write(&path, value).map_err(|source| CacheError::Io { path, source })
    }
}

/// Arrival-ordered chat history for one report, written through to the
/// cache on every append.
pub struct ChatLog {
    report_id: ReportId,
    key: String,
    messages: Vec<ChatMessage>,
    cache: Arc<dyn ChatCache>,
}

impl ChatLog {
    /// Never fails: a missing, unreadable or corrupt entry yields an empty log.
    pub fn load(report_id: ReportId, cache: Arc<dyn ChatCache>) -> Self {
        let key = cache_key(&report_id);
        let messages = match cache.load(&key) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<ChatMessage>>(&raw) {
                Ok(mut messages) => {
                    let stored = messages.len();
                    messages.retain(|message| message.report_id == report_id);
                    if messages.len() != stored {
                        warn!(%report_id, dropped = stored - messages.len(), "discarding cached messages of another report");
                    }
                    messages
                }
                Err(err) => {
                    warn!(%report_id, %err, "discarding corrupt chat cache");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(%report_id, %err, "chat cache unreadable");
                Vec::new()
            }
        };
        debug!(%report_id, restored = messages.len(), "chat log loaded");
        Self {
            report_id,
            key,
            messages,
            cache,
        }
    }

    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.persist();
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn report_id(&self) -> &ReportId {
        &self.report_id
    }

    fn persist(&self) {
        let serialized = match serde_json::to_string(&self.messages) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!(report_id = %self.report_id, %err, "failed to serialize chat log");
                return;
            }
        };
        if let Err(err) = self.cache.save(&self.key, &serialized) {
            warn!(report_id = %self.report_id, %err, "failed to persist chat log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(report: &str, text: &str) -> ChatMessage {
        ChatMessage::compose(ReportId::new(report).expect("id"), "Officer", text).expect("message")
    }

    #[test]
    fn missing_entry_loads_empty() {
        let log = ChatLog::load(ReportId::new("r1").expect("id"), MemoryCache::new());
        assert!(log.is_empty());
    }

    #[test]
    fn corrupt_entry_loads_empty() {
        let cache = MemoryCache::new();
        cache.insert("report_chat_r1", "{not: json]");
        let log = ChatLog::load(ReportId::new("r1").expect("id"), cache.clone());
        assert!(log.is_empty());
        // still usable, and the next append overwrites the corrupt entry
        let mut log = log;
        log.append(message("r1", "hello"));
        let stored: Vec<ChatMessage> =
            serde_json::from_str(&cache.get("report_chat_r1").expect("saved")).expect("valid json");
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn append_rewrites_the_whole_history() {
        let cache = MemoryCache::new();
        let report_id = ReportId::new("r1").expect("id");
        let mut log = ChatLog::load(report_id.clone(), cache.clone());
        log.append(message("r1", "one"));
        log.append(message("r1", "two"));

        let reopened = ChatLog::load(report_id, cache);
        let texts: Vec<&str> = reopened.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[test]
    fn histories_are_scoped_per_report() {
        let cache = MemoryCache::new();
        let mut first = ChatLog::load(ReportId::new("r1").expect("id"), cache.clone());
        first.append(message("r1", "for r1"));
        let second = ChatLog::load(ReportId::new("r2").expect("id"), cache);
        assert!(second.is_empty());
    }

    #[test]
    fn file_cache_round_trips_and_treats_missing_as_none() {
        let dir = std::env::temp_dir().join(format!("tracker-chat-{}", uuid::Uuid::new_v4()));
        let cache = FileCache::new(&dir);
        assert_eq!(cache.load("report_chat_r1").expect("load"), None);

        cache.save("report_chat_r1", "[]").expect("save");
        assert_eq!(cache.load("report_chat_r1").expect("load").as_deref(), Some("[]"));
        assert!(cache.path_for("report_chat_../etc").starts_with(&dir));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn similar_report_ids_never_share_a_file() {
        let dir = std::env::temp_dir().join(format!("tracker-chat-{}", uuid::Uuid::new_v4()));
        let cache: Arc<dyn ChatCache> = Arc::new(FileCache::new(&dir));

        let mut dotted = ChatLog::load(ReportId::new("case.1").expect("id"), Arc::clone(&cache));
        dotted.append(message("case.1", "secret for case.1"));
        let underscored = ChatLog::load(ReportId::new("case_1").expect("id"), Arc::clone(&cache));
        assert!(underscored.is_empty());
        let slashed = ChatLog::load(ReportId::new("case/1").expect("id"), Arc::clone(&cache));
        assert!(slashed.is_empty());

        let reopened = ChatLog::load(ReportId::new("case.1").expect("id"), cache);
        assert_eq!(reopened.len(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn messages_of_another_report_are_dropped_on_load() {
        let cache = MemoryCache::new();
        let foreign = serde_json::to_string(&vec![message("r2", "not yours"), message("r1", "yours")])
            .expect("serialize");
        cache.insert("report_chat_r1", &foreign);

        let log = ChatLog::load(ReportId::new("r1").expect("id"), cache);
        let texts: Vec<&str> = log.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["yours"]);
    }
}
