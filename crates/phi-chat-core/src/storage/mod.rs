//! Durable key-value slots backing the conversation history.
//!
//! A [`KeyValueStore`] holds whole string values under string keys. Values are
//! always overwritten wholesale; there are no partial updates.

pub mod conversation;

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::ChatError;

pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Returns `Ok(None)` when the key has never been written (or was removed).
    fn get(&self, key: &str) -> Result<Option<String>, ChatError>;

    /// Replace the value stored under `key`.
    fn set(&self, key: &str, value: &str) -> Result<(), ChatError>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), ChatError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, ChatError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ChatError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), ChatError> {
        (**self).remove(key)
    }
}

// ── File-backed store ─────────────────────────────────────────────────────────

/// Stores each key as `<dir>/<key>.json`.
///
/// Writes go to a uniquely named temp file in the same directory that is
/// renamed over the target, so a reader never observes a half-written value
/// and concurrent writers never share a temp file.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) the storage directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, ChatError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| {
            ChatError::storage(dir.display().to_string(), source)
        })?;
        Ok(Self { dir })
    }

    /// Keys name files inside the directory and never leave it.
    fn path_for(&self, key: &str) -> Result<PathBuf, ChatError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && !key.contains(['/', '\\'])
            && !key.contains("..");
        if !valid {
            return Err(ChatError::storage(
                key,
                anyhow::anyhow!("key must be a plain file name"),
            ));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, ChatError> {
        match fs::read_to_string(self.path_for(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ChatError::storage(key, source)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ChatError> {
        let target = self.path_for(key)?;

        let write = || -> io::Result<()> {
            let mut tmp = NamedTempFile::new_in(&self.dir)?;
            tmp.write_all(value.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        };

        write().map_err(|source| ChatError::storage(key, source))?;
        debug!(key, bytes = value.len(), path = %target.display(), "slot written");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), ChatError> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ChatError::storage(key, source)),
        }
    }
}

// ── In-memory store ───────────────────────────────────────────────────────────

/// Process-local store; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a slot, e.g. with previously persisted (or corrupt) data.
    pub fn with_value(key: impl Into<String>, value: impl Into<String>) -> Self {
        let store = Self::default();
        if let Ok(mut slots) = store.slots.lock() {
            slots.insert(key.into(), value.into());
        }
        store
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, ChatError> {
        let slots = self.slots.lock().map_err(|_| ChatError::LockPoisoned {
            operation: "read memory store",
        })?;
        Ok(slots.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ChatError> {
        let mut slots = self.slots.lock().map_err(|_| ChatError::LockPoisoned {
            operation: "write memory store",
        })?;
        slots.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), ChatError> {
        let mut slots = self.slots.lock().map_err(|_| ChatError::LockPoisoned {
            operation: "write memory store",
        })?;
        slots.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_roundtrips_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        assert_eq!(store.get("chat_memory").unwrap(), None);
        store.set("chat_memory", "[1]").unwrap();
        store.set("chat_memory", "[1,2]").unwrap();
        assert_eq!(store.get("chat_memory").unwrap().as_deref(), Some("[1,2]"));
        assert!(dir.path().join("chat_memory.json").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn concurrent_writers_sharing_a_directory_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let store = FileStore::new(dir.path()).unwrap();
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|i| store.set("chat_memory", &format!("[{writer},{i}]")).is_err())
                        .count()
                })
            })
            .collect();

        let failed: usize = writers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(failed, 0);

        let stored = FileStore::new(dir.path()).unwrap().get("chat_memory").unwrap().unwrap();
        assert!(serde_json::from_str::<Vec<u32>>(&stored).is_ok());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn keys_cannot_escape_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("data")).unwrap();

        for key in ["a/b", "../chat_memory", "a\\b", "", ".hidden"] {
            assert!(matches!(store.get(key), Err(ChatError::Storage { .. })), "{key}");
            assert!(matches!(store.set(key, "[]"), Err(ChatError::Storage { .. })), "{key}");
        }
        assert!(store.get("chat_memory").unwrap().is_none());
    }

    #[test]
    fn file_store_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.set("k", "v").unwrap();
        store.remove("k").unwrap();
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn memory_store_seeded_value_is_visible() {
        let store = MemoryStore::with_value("k", "v");
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(store.get("other").unwrap(), None);
    }
}
