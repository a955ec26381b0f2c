use std::sync::Arc;

use chokepoint::ChokePoint;
use stash::{Family, LocalCache};

use crate::engine::LoadOutcome;
use crate::notify::{LogNotifier, Notifier};
use crate::{SyncConfig, SyncError};

/// Collapses concurrent full loads of the same (family, owner).
pub type LoadGuard = Arc<ChokePoint<(Family, String), LoadOutcome, SyncError>>;

/// Everything a synchronizer shares with its siblings apart from the backend.
#[derive(Clone)]
pub struct SyncContext {
    pub owner_id: String,
    pub cache: LocalCache,
    pub config: SyncConfig,
    pub notifier: Arc<dyn Notifier>,
    pub guard: LoadGuard,
}

impl SyncContext {
    pub fn new(owner_id: impl Into<String>, cache: LocalCache) -> Self {
        Self {
            owner_id: owner_id.into(),
            cache,
            config: SyncConfig::default(),
            notifier: Arc::new(LogNotifier),
            guard: Arc::new(ChokePoint::new()),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_guard(mut self, guard: LoadGuard) -> Self {
        self.guard = guard;
        self
    }
}
