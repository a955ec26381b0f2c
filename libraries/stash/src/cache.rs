use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{KeyValueStore, Keyed, Mutation, StashError};

pub const DEFAULT_TTL: TimeDelta = TimeDelta::hours(24);
const DEFAULT_NAMESPACE: &str = "stash";

/// A named collection that is cached independently of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Family(&'static str);

impl Family {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub owner_id: String,
    pub data: T,
    pub last_updated: DateTime<Utc>,
    pub version: String,
}

impl CacheEntry<serde_json::Value> {
    /// Parse an entry without committing to an item type.
    pub fn peek(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn item_count(&self) -> Option<usize> {
        self.data.as_array().map(Vec::len)
    }
}

pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UtcClock;

impl TimeSource for UtcClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, thiserror::Error)]
enum Discard {
    #[error("entry belongs to another owner")]
    OwnerMismatch,
    #[error("entry has version {found}, expected {expected}")]
    VersionMismatch { found: String, expected: String },
    #[error("entry expired ({age} old)")]
    Expired { age: TimeDelta },
    #[error("entry is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Owner-partitioned, versioned cache of collections.
///
/// Cloning is cheap; clones share the underlying store.
#[derive(Clone)]
pub struct LocalCache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn TimeSource>,
    namespace: String,
    version: String,
    ttl: TimeDelta,
}

impl LocalCache {
    pub fn new(store: Arc<dyn KeyValueStore>, version: impl Into<String>) -> Self {
        Self {
            store,
            clock: Arc::new(UtcClock),
            namespace: DEFAULT_NAMESPACE.to_string(),
            version: version.into(),
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: TimeDelta) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    pub fn key(&self, family: Family, owner_id: &str) -> String {
        format!("{}:{}:{owner_id}", self.namespace, family.name())
    }

    /// Return the cached collection, or `None` if there is no usable entry.
    /// Entries that are unusable for any reason are purged as a side effect.
    pub fn get<T: DeserializeOwned>(&self, family: Family, owner_id: &str) -> Option<Vec<T>> {
        let key = self.key(family, owner_id);

        let bytes = match self.store.read(&key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(StashError::Corrupt { reason, .. }) => {
                log::debug!("Discarding cache entry {key}: {reason}");
                self.purge(&key);
                return None;
            }
            Err(e) => {
                log::warn!("Failed to read cache entry {key}: {e}");
                return None;
            }
        };

        match self.validate(owner_id, &bytes) {
            Ok(items) => Some(items),
            Err(reason) => {
                log::debug!("Discarding cache entry {key}: {reason}");
                self.purge(&key);
                None
            }
        }
    }

    /// Overwrite the entry with a fresh timestamp and the current version.
    pub fn set<T: Serialize>(
        &self,
        family: Family,
        owner_id: &str,
        items: &[T],
    ) -> Result<(), StashError> {
        let entry = CacheEntry {
            owner_id: owner_id.to_string(),
            data: items,
            last_updated: self.clock.now(),
            version: self.version.clone(),
        };
        let bytes = serde_json::to_vec(&entry)?;
        self.store.write(&self.key(family, owner_id), &bytes)
    }

    /// Read-modify-write. A missing or unusable entry starts from an empty list.
    pub fn update<T, F>(&self, family: Family, owner_id: &str, f: F) -> Result<Vec<T>, StashError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<T>),
    {
        let mut items = self.get(family, owner_id).unwrap_or_default();
        f(&mut items);
        self.set(family, owner_id, &items)?;
        Ok(items)
    }

    pub fn mutate<T>(
        &self,
        family: Family,
        owner_id: &str,
        mutation: Mutation<T>,
    ) -> Result<Vec<T>, StashError>
    where
        T: Serialize + DeserializeOwned + Keyed,
    {
        self.update(family, owner_id, |items| mutation.apply(items))
    }

    pub fn remove(&self, family: Family, owner_id: &str) -> Result<(), StashError> {
        self.store.delete(&self.key(family, owner_id))
    }

    /// Purge every entry in this cache's namespace, for every family and owner.
    /// Returns how many entries were removed.
    pub fn clear_all(&self) -> Result<usize, StashError> {
        let prefix = format!("{}:", self.namespace);
        let mut removed = 0;
        for key in self.store.keys()? {
            if key.starts_with(&prefix) {
                self.store.delete(&key)?;
                removed += 1;
            }
        }
        log::info!("Cleared {removed} cache entries");
        Ok(removed)
    }

    fn validate<T: DeserializeOwned>(
        &self,
        owner_id: &str,
        bytes: &[u8],
    ) -> Result<Vec<T>, Discard> {
        let entry = CacheEntry::peek(bytes)?;

        if entry.owner_id != owner_id {
            return Err(Discard::OwnerMismatch);
        }

        if entry.version != self.version {
            return Err(Discard::VersionMismatch {
                found: entry.version,
                expected: self.version.clone(),
            });
        }

        let age = self.clock.now() - entry.last_updated;
        if age > self.ttl {
            return Err(Discard::Expired { age });
        }

        Ok(serde_json::from_value(entry.data)?)
    }

    fn purge(&self, key: &str) {
        if let Err(e) = self.store.delete(key) {
            log::warn!("Failed to purge cache entry {key}: {e}");
        }
    }
}
