//! Keeps a trainer's client roster and routine library in sync with the backend.
//!
//! Each collection is served cache-first: whatever was cached last time is shown immediately
//! while a cheap count query checks whether it is stale. Push channels trigger debounced
//! refreshes, and degrade to polling when the backend cannot hold a subscription. Mutations go
//! to the backend first and are then applied to visible state and the cache in one step.

pub mod backend;
pub mod channel;
mod config;
mod context;
pub mod debounce;
pub mod engine;
mod error;
pub mod notify;
pub mod queries;
pub mod roster;
pub mod routines;
pub mod session;
pub mod state;

pub use backend::{Backend, BackendError, InMemoryBackend};
pub use channel::ChannelState;
pub use config::SyncConfig;
pub use context::{LoadGuard, SyncContext};
pub use error::{SaveStage, SyncError};
pub use notify::{LogNotifier, Notification, NotificationKind, Notifier, RecordingNotifier};
pub use roster::{ROSTER, RosterSync};
pub use routines::{ROUTINES, RoutineSync};
pub use session::{CACHE_VERSION, TrainerSync, build_cache};
pub use state::{ListenerKey, Phase, Snapshot};

pub use trainer_types::{
    Block, BlockExercise, Client, ClientOrigin, ClientStatus, Routine, RoutineId,
};
