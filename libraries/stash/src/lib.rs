//! This is a library for caching synced collections locally, so that an app can render
//! what it saw last time instead of waiting on the network.
//!
//! Caching strategy:
//! 1. Each collection belongs to a "family" (for example a roster or a routine library) and an
//!    owner (the signed-in principal). Every (family, owner) pair gets exactly one entry.
//! 2. Entries are tagged with the owner id, a schema version and the time they were written.
//! 3. On read, an entry is only returned if its owner matches, its version matches the version the
//!    running app expects, and it is younger than the TTL. Anything else (including entries that
//!    fail to deserialize) is purged and reported as a miss.
//! 4. List-level changes go through [`LocalCache::mutate`], so a successful backend write does not
//!    need a full re-fetch to keep the cache in sync.
//!
//! The byte-level storage is pluggable through [`KeyValueStore`]. [`MemoryStore`] keeps entries in
//! process, [`DirectoryStore`] keeps one file per entry on disk.

mod cache;
pub mod disk;
mod mutation;
mod store;

pub use cache::{CacheEntry, DEFAULT_TTL, Family, LocalCache, ManualClock, TimeSource, UtcClock};
pub use disk::DirectoryStore;
pub use mutation::{Keyed, Mutation};
pub use store::{KeyValueStore, MemoryStore};

#[derive(Debug, thiserror::Error)]
pub enum StashError {
    #[error("local store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize cache entry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("stored value for `{key}` is unreadable: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("invalid store key `{0}`")]
    InvalidKey(String),
}
