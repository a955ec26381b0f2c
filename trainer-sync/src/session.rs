use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use stash::{KeyValueStore, LocalCache};

use crate::backend::Backend;
use crate::notify::Notifier;
use crate::roster::RosterSync;
use crate::routines::RoutineSync;
use crate::{SyncConfig, SyncContext, SyncError};

/// Bump when the cached shape of clients or routines changes. Older entries are discarded.
pub const CACHE_VERSION: &str = "trainer-sync-v1";

pub fn build_cache(store: Arc<dyn KeyValueStore>, config: &SyncConfig) -> LocalCache {
    LocalCache::new(store, CACHE_VERSION).with_ttl(config.cache_ttl())
}

/// Both synchronizers for one signed-in trainer, sharing a backend, a cache and a load guard.
///
/// Dropping the session shuts it down.
pub struct TrainerSync<B: Backend> {
    context: SyncContext,
    roster: RosterSync<B>,
    routines: RoutineSync<B>,
    shut_down: AtomicBool,
}

impl<B: Backend> TrainerSync<B> {
    pub fn new(
        backend: Arc<B>,
        store: Arc<dyn KeyValueStore>,
        owner_id: impl Into<String>,
        config: SyncConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let context = SyncContext::new(owner_id, build_cache(store, &config))
            .with_config(config)
            .with_notifier(notifier);
        Self::with_context(backend, context)
    }

    pub fn with_context(backend: Arc<B>, context: SyncContext) -> Self {
        Self {
            roster: RosterSync::new(Arc::clone(&backend), &context),
            routines: RoutineSync::new(backend, &context),
            context,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.context.owner_id
    }

    pub fn roster(&self) -> &RosterSync<B> {
        &self.roster
    }

    pub fn routines(&self) -> &RoutineSync<B> {
        &self.routines
    }

    /// Run both cache-first loads and open every channel. Channels are opened even if a load
    /// fails, so a later push or poll can recover.
    pub async fn start(&self) -> Result<(), SyncError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }
        log::info!("Starting sync for {}", self.owner_id());
        let (roster, routines) = tokio::join!(self.roster.load(false), self.routines.load(false));
        self.roster.connect();
        self.routines.connect();
        roster?;
        routines?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.roster.shutdown().await;
        self.routines.shutdown().await;
    }

    /// Shut down and wipe every cached collection, for every owner.
    pub async fn sign_out(&self) -> Result<usize, SyncError> {
        self.shutdown().await;
        let removed = self
            .context
            .cache
            .clear_all()
            .inspect_err(|e| log::error!("Failed to clear the local cache on sign-out: {e}"))?;
        Ok(removed)
    }
}

impl<B: Backend> Drop for TrainerSync<B> {
    fn drop(&mut self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            self.roster.engine().shutdown();
            self.routines.engine().shutdown();
        }
    }
}
