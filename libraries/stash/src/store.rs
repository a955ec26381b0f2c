use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::StashError;

/// Byte-level persistence underneath [`crate::LocalCache`].
///
/// Implementations are expected to be cheap and synchronous, like browser local storage.
pub trait KeyValueStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StashError>;

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StashError>;

    /// Deleting a key that does not exist is not an error.
    fn delete(&self, key: &str) -> Result<(), StashError>;

    fn keys(&self) -> Result<Vec<String>, StashError>;
}

/// An in-process store. Entries live as long as the store does.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // a panic while holding this lock cannot leave the map half-written
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StashError> {
        Ok(self.entries().get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StashError> {
        if key.is_empty() {
            return Err(StashError::InvalidKey(key.to_string()));
        }
        self.entries().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StashError> {
        self.entries().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StashError> {
        Ok(self.entries().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store.write("a", b"one").unwrap();
        store.write("b", b"two").unwrap();
        assert_eq!(store.read("a").unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);

        store.delete("a").unwrap();
        store.delete("missing").unwrap();
        assert_eq!(store.read("a").unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_store_rejects_empty_key() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.write("", b"x"),
            Err(StashError::InvalidKey(_))
        ));
    }
}
