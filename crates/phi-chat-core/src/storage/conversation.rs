use tracing::{debug, info, warn};

use super::KeyValueStore;
use crate::{ChatError, ChatTurn, ConversationHistory};

/// Default slot name for the persisted history.
pub const DEFAULT_HISTORY_KEY: &str = "chat_memory";

/// How the history was obtained at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    /// Nothing was stored under the key.
    Empty,
    /// A previously persisted history was parsed.
    Restored { turns: usize },
    /// Stored data could not be parsed and was ignored; the session starts
    /// with an empty history. The bad value stays in the slot until the next
    /// successful write overwrites it.
    Discarded { reason: String },
}

/// Ordered chat history mirrored into a single key-value slot.
///
/// Every mutation serializes the would-be history and writes it first; the
/// in-memory copy is only updated once the write succeeded, so the slot and
/// memory never diverge.
#[derive(Debug)]
pub struct ConversationStore {
    kv: Box<dyn KeyValueStore>,
    key: String,
    history: ConversationHistory,
}

impl ConversationStore {
    /// Read the history stored under `key`.
    ///
    /// Malformed data falls back to an empty history and is reported as
    /// [`LoadStatus::Discarded`]. I/O failures while reading are returned as
    /// errors.
    pub fn load(
        kv: Box<dyn KeyValueStore>,
        key: impl Into<String>,
    ) -> Result<(Self, LoadStatus), ChatError> {
        let key = key.into();
        let (history, status) = match kv.get(&key)? {
            None => (Vec::new(), LoadStatus::Empty),
            Some(raw) => match serde_json::from_str::<ConversationHistory>(&raw) {
                Ok(history) => {
                    let turns = history.len();
                    (history, LoadStatus::Restored { turns })
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "stored chat history is malformed; starting empty");
                    (
                        Vec::new(),
                        LoadStatus::Discarded {
                            reason: e.to_string(),
                        },
                    )
                }
            },
        };
        info!(key = %key, turns = history.len(), status = ?status, "chat history loaded");
        Ok((Self { kv, key, history }, status))
    }

    /// Create a store with an empty history without reading the slot.
    pub fn empty(kv: Box<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            kv,
            key: key.into(),
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn append(&mut self, turn: ChatTurn) -> Result<(), ChatError> {
        self.extend(std::iter::once(turn))
    }

    /// Append several turns as one write.
    pub fn extend<I>(&mut self, turns: I) -> Result<(), ChatError>
    where
        I: IntoIterator<Item = ChatTurn>,
    {
        let mut next = self.history.clone();
        next.extend(turns);

        let serialized =
            serde_json::to_string(&next).map_err(|source| ChatError::storage(&self.key, source))?;
        self.kv.set(&self.key, &serialized)?;

        debug!(key = %self.key, turns = next.len(), "chat history persisted");
        self.history = next;
        Ok(())
    }

    /// Drop every turn and remove the slot.
    pub fn clear(&mut self) -> Result<(), ChatError> {
        self.kv.remove(&self.key)?;
        self.history.clear();
        info!(key = %self.key, "chat history cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStore, MemoryStore};
    use std::sync::Arc;
    use tracing_test::traced_test;

    /// Accepts reads, refuses every write.
    #[derive(Debug)]
    struct ReadOnlyStore;

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, _key: &str) -> Result<Option<String>, ChatError> {
            Ok(None)
        }
        fn set(&self, key: &str, _value: &str) -> Result<(), ChatError> {
            Err(ChatError::storage(key, anyhow::anyhow!("read-only")))
        }
        fn remove(&self, _key: &str) -> Result<(), ChatError> {
            Ok(())
        }
    }

    #[test]
    fn missing_slot_loads_empty() {
        let (store, status) =
            ConversationStore::load(Box::new(MemoryStore::new()), DEFAULT_HISTORY_KEY).unwrap();
        assert!(store.is_empty());
        assert_eq!(status, LoadStatus::Empty);
    }

    #[test]
    #[traced_test]
    fn malformed_slot_loads_empty_and_logs() {
        let kv = MemoryStore::with_value(DEFAULT_HISTORY_KEY, "{not json");
        let (store, status) = ConversationStore::load(Box::new(kv), DEFAULT_HISTORY_KEY).unwrap();

        assert!(store.is_empty());
        assert!(matches!(status, LoadStatus::Discarded { .. }));
        assert!(logs_contain("stored chat history is malformed"));
    }

    #[test]
    fn wrong_shape_is_treated_as_malformed() {
        let kv = MemoryStore::with_value(DEFAULT_HISTORY_KEY, r#"[{"role":"robot","content":"x"}]"#);
        let (store, status) = ConversationStore::load(Box::new(kv), DEFAULT_HISTORY_KEY).unwrap();
        assert!(store.is_empty());
        assert!(matches!(status, LoadStatus::Discarded { .. }));
    }

    #[test]
    fn history_survives_restart() {
        let shared = Arc::new(MemoryStore::new());
        let turns = vec![
            ChatTurn::system("be brief"),
            ChatTurn::user("Hi"),
            ChatTurn::assistant("Hello!\n\"quoted\" ünïcode"),
        ];

        let (mut store, _) =
            ConversationStore::load(Box::new(shared.clone()), DEFAULT_HISTORY_KEY).unwrap();
        store.extend(turns.clone()).unwrap();
        drop(store);

        let (reloaded, status) =
            ConversationStore::load(Box::new(shared), DEFAULT_HISTORY_KEY).unwrap();
        assert_eq!(status, LoadStatus::Restored { turns: 3 });
        assert_eq!(reloaded.history(), turns.as_slice());
    }

    #[test]
    fn file_backed_history_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        let (mut store, _) =
            ConversationStore::load(Box::new(FileStore::new(dir.path()).unwrap()), "memory").unwrap();
        store.append(ChatTurn::user("Hi")).unwrap();
        store.append(ChatTurn::assistant("Hello!")).unwrap();

        let (reloaded, _) =
            ConversationStore::load(Box::new(FileStore::new(dir.path()).unwrap()), "memory").unwrap();
        assert_eq!(
            reloaded.history(),
            &[ChatTurn::user("Hi"), ChatTurn::assistant("Hello!")]
        );
    }

    #[test]
    fn key_outside_the_directory_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Box::new(FileStore::new(dir.path().join("store")).unwrap());

        let err = ConversationStore::load(kv, "../memory").unwrap_err();
        assert!(matches!(err, ChatError::Storage { .. }));
        assert!(!dir.path().join("memory.json").exists());
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let mut store = ConversationStore::empty(Box::new(ReadOnlyStore), DEFAULT_HISTORY_KEY);
        let err = store.append(ChatTurn::user("Hi")).unwrap_err();
        assert!(matches!(err, ChatError::Storage { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn clear_removes_slot() {
        let shared = Arc::new(MemoryStore::new());
        let mut store = ConversationStore::empty(Box::new(shared.clone()), DEFAULT_HISTORY_KEY);
        store.append(ChatTurn::user("Hi")).unwrap();
        store.clear().unwrap();

        assert!(store.is_empty());
        assert_eq!(shared.get(DEFAULT_HISTORY_KEY).unwrap(), None);
    }
}
