//! The cache-first load strategy shared by every synchronized collection.
//!
//! A load first collapses into any load already running for the same (family, owner). Unless it
//! is forced, it then serves the collection from memory or from the local cache and checks the
//! backend's row count in the background. Otherwise it fetches everything, writes the result
//! through to the cache and publishes it.
//!
//! Once [`Engine::shutdown`] has run, nothing the engine does reaches visible state or the cache.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use im::Vector;
use serde::Serialize;
use serde::de::DeserializeOwned;
use stash::{Family, Keyed, LocalCache, Mutation};
use tokio::task::JoinHandle;

use crate::backend::{BackendError, ChangeEvent};
use crate::channel::ChannelTarget;
use crate::context::{LoadGuard, SyncContext};
use crate::debounce::Debouncer;
use crate::notify::{Notification, Notifier};
use crate::state::{ListenerKey, Listeners, Phase, Snapshot};
use crate::{SyncConfig, SyncError};

/// Where a load found its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Memory,
    Cache,
    Backend,
}

/// One synchronized collection: how to fetch it and how to tell whether it is stale.
pub trait Source: Send + Sync + 'static {
    type Item: Keyed + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    const FAMILY: Family;
    /// Plural noun used in logs and notifications.
    const NOUN: &'static str;

    fn fetch(
        &self,
        owner_id: &str,
    ) -> impl Future<Output = Result<Vec<Self::Item>, BackendError>> + Send;

    /// The backend-side count that [`Source::comparable_count`] is checked against.
    fn remote_count(&self, owner_id: &str)
    -> impl Future<Output = Result<usize, BackendError>> + Send;

    fn comparable_count(&self, items: &Vector<Self::Item>) -> usize;

    /// Combine a fresh fetch with what is visible now. Items that only exist locally are lost
    /// unless the source carries them over here.
    fn merge_local(
        &self,
        _visible: &Vector<Self::Item>,
        fetched: Vec<Self::Item>,
    ) -> Vec<Self::Item> {
        fetched
    }

    /// A one-time notification for a pushed change, with the key it is deduplicated by.
    fn announce(&self, _owner_id: &str, _event: &ChangeEvent) -> Option<(String, Notification)> {
        None
    }
}

struct Inner<T: Clone> {
    snapshot: Snapshot<T>,
    /// Whether `snapshot.items` holds a complete collection from the cache or the backend.
    loaded: bool,
}

pub struct Engine<S: Source> {
    me: Weak<Self>,
    source: S,
    owner_id: String,
    cache: LocalCache,
    guard: LoadGuard,
    config: SyncConfig,
    notifier: Arc<dyn Notifier>,
    alive: AtomicBool,
    inner: Mutex<Inner<S::Item>>,
    listeners: Listeners<S::Item>,
    debouncer: Debouncer,
    verification: Mutex<Option<JoinHandle<()>>>,
    announced: Mutex<HashSet<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: Source> Engine<S> {
    pub fn new(source: S, context: &SyncContext) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            source,
            owner_id: context.owner_id.clone(),
            cache: context.cache.clone(),
            guard: Arc::clone(&context.guard),
            config: context.config.clone(),
            notifier: Arc::clone(&context.notifier),
            alive: AtomicBool::new(true),
            inner: Mutex::new(Inner {
                snapshot: Snapshot::default(),
                loaded: false,
            }),
            listeners: Listeners::new(),
            debouncer: Debouncer::new(context.config.debounce()),
            verification: Mutex::new(None),
            announced: Mutex::new(HashSet::new()),
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn notify(&self, notification: Notification) {
        if self.is_alive() {
            self.notifier.notify(notification);
        }
    }

    /// Tell the user how a mutation went. Nothing is reported once the engine is shut down.
    pub fn report<T>(
        &self,
        result: &Result<T, SyncError>,
        success: impl FnOnce(&T) -> Notification,
        failure_title: &str,
    ) {
        match result {
            Ok(value) => self.notify(success(value)),
            Err(SyncError::ShutDown) => {}
            Err(e) => {
                log::error!("{failure_title}: {e}");
                self.notify(Notification::error(failure_title, e.to_string()));
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn ensure_alive(&self) -> Result<(), SyncError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SyncError::ShutDown)
        }
    }

    pub fn snapshot(&self) -> Snapshot<S::Item> {
        lock(&self.inner).snapshot.clone()
    }

    pub fn items(&self) -> Vector<S::Item> {
        lock(&self.inner).snapshot.items.clone()
    }

    pub fn find(&self, key: &<S::Item as Keyed>::Key) -> Option<S::Item> {
        lock(&self.inner)
            .snapshot
            .items
            .iter()
            .find(|item| item.key() == *key)
            .cloned()
    }

    pub fn register_listener(
        &self,
        listener: impl Fn(&Snapshot<S::Item>) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.listeners.register(Arc::new(listener))
    }

    pub fn unregister_listener(&self, key: ListenerKey) -> bool {
        self.listeners.unregister(key)
    }

    /// Load the collection, from memory or the local cache when allowed, else from the backend.
    pub async fn load(&self, force_refresh: bool) -> Result<Vector<S::Item>, SyncError> {
        self.ensure_alive()?;
        let engine = self.me.upgrade().ok_or(SyncError::ShutDown)?;
        let key = (S::FAMILY, self.owner_id.clone());

        let outcome = self
            .guard
            .run(key, async move { engine.load_exclusive(force_refresh).await })
            .await?;

        if outcome != LoadOutcome::Backend {
            self.verify_in_background();
        }
        Ok(self.items())
    }

    pub async fn refresh(&self) -> Result<Vector<S::Item>, SyncError> {
        self.load(true).await
    }

    async fn load_exclusive(&self, force_refresh: bool) -> Result<LoadOutcome, SyncError> {
        if !force_refresh {
            if lock(&self.inner).loaded {
                self.write(|inner| {
                    inner.snapshot.phase = Phase::Ready;
                    inner.snapshot.loading = false;
                })?;
                return Ok(LoadOutcome::Memory);
            }

            if let Some(items) = self.cache.get::<S::Item>(S::FAMILY, &self.owner_id) {
                log::debug!(
                    "Serving {} {} for {} from the local cache",
                    items.len(),
                    S::NOUN,
                    self.owner_id
                );
                self.write(|inner| {
                    inner.snapshot.items = items.into_iter().collect();
                    inner.snapshot.phase = Phase::Ready;
                    inner.snapshot.loading = false;
                    inner.snapshot.error = None;
                    inner.loaded = true;
                })?;
                return Ok(LoadOutcome::Cache);
            }
        }

        self.fetch().await?;
        Ok(LoadOutcome::Backend)
    }

    async fn fetch(&self) -> Result<(), SyncError> {
        self.write(|inner| {
            inner.snapshot.phase = Phase::Loading;
            inner.snapshot.loading = true;
        })?;
        log::info!("Fetching {} for {}", S::NOUN, self.owner_id);

        match self.source.fetch(&self.owner_id).await {
            Ok(items) => {
                self.ensure_alive().inspect_err(|_| {
                    log::debug!("Dropping {} fetched after shutdown", S::NOUN)
                })?;
                let items = self.write(|inner| {
                    let items = self.source.merge_local(&inner.snapshot.items, items);
                    inner.snapshot.items = items.iter().cloned().collect();
                    inner.snapshot.phase = Phase::Ready;
                    inner.snapshot.loading = false;
                    inner.snapshot.error = None;
                    inner.loaded = true;
                    items
                })?;
                if let Err(e) = self.cache.set(S::FAMILY, &self.owner_id, &items) {
                    log::warn!("Failed to cache {}: {e}", S::NOUN);
                }
                Ok(())
            }
            Err(e) => {
                self.ensure_alive()?;
                let error = SyncError::Backend(e);
                log::error!("Failed to load {}: {error}", S::NOUN);
                self.write(|inner| {
                    inner.snapshot.phase = if inner.loaded {
                        Phase::Ready
                    } else {
                        Phase::Empty
                    };
                    inner.snapshot.loading = false;
                    inner.snapshot.error = Some(error.clone());
                })?;
                self.notify(Notification::error(
                    format!("Couldn't load your {}", S::NOUN),
                    error.to_string(),
                ));
                Err(error)
            }
        }
    }

    fn verify_in_background(&self) {
        if !self.config.verify_in_background || !self.is_alive() {
            return;
        }
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            if let Some(engine) = me.upgrade() {
                engine.verify().await;
            }
        });
        if let Some(previous) = lock(&self.verification).replace(task) {
            previous.abort();
        }
    }

    async fn verify(&self) {
        let expected = {
            let inner = lock(&self.inner);
            if inner.snapshot.phase != Phase::Ready {
                return;
            }
            self.source.comparable_count(&inner.snapshot.items)
        };
        if self
            .write(|inner| {
                if inner.snapshot.phase == Phase::Ready {
                    inner.snapshot.phase = Phase::Verifying;
                }
            })
            .is_err()
        {
            return;
        }

        let remote = self.source.remote_count(&self.owner_id).await;
        if self
            .write(|inner| {
                if inner.snapshot.phase == Phase::Verifying {
                    inner.snapshot.phase = Phase::Ready;
                }
            })
            .is_err()
        {
            return;
        }

        match remote {
            Ok(remote) if remote == expected => {
                log::debug!("{} for {} are up to date", S::NOUN, self.owner_id)
            }
            Ok(remote) => {
                log::info!(
                    "{} changed remotely ({expected} local, {remote} remote), refreshing",
                    S::NOUN
                );
                if let Err(e) = self.load(true).await {
                    log::debug!("Refresh after count mismatch failed: {e}");
                }
            }
            Err(e) => log::warn!("Background check of {} failed: {e}", S::NOUN),
        }
    }

    /// Schedule a forced load once change events stop arriving for the debounce window.
    pub fn refresh_debounced(&self) {
        if !self.is_alive() {
            return;
        }
        let me = self.me.clone();
        self.debouncer.schedule(move || async move {
            if let Some(engine) = me.upgrade()
                && let Err(e) = engine.load(true).await
            {
                log::debug!("Debounced refresh of {} failed: {e}", S::NOUN);
            }
        });
    }

    /// Apply a list-level change to visible state and the local cache together.
    pub fn apply(&self, mutation: Mutation<S::Item>) -> Result<Vector<S::Item>, SyncError> {
        let (items, loaded) = self.write(|inner| {
            let mut items: Vec<S::Item> = inner.snapshot.items.iter().cloned().collect();
            mutation.clone().apply(&mut items);
            inner.snapshot.items = items.into_iter().collect();
            (inner.snapshot.items.clone(), inner.loaded)
        })?;

        // A partial list must never be cached as the whole collection.
        if loaded {
            if let Err(e) = self.cache.mutate(S::FAMILY, &self.owner_id, mutation) {
                log::warn!("Failed to update cached {}: {e}", S::NOUN);
            }
        } else {
            log::debug!("{} not loaded yet, cache left untouched", S::NOUN);
        }
        Ok(items)
    }

    /// Stop every timer and background task. Later fetches, checks and mutations leave both
    /// visible state and the cache alone.
    pub fn shutdown(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            log::info!("Shutting down {} sync for {}", S::NOUN, self.owner_id);
        }
        self.debouncer.cancel();
        if let Some(task) = lock(&self.verification).take() {
            task.abort();
        }
    }

    fn write<R>(&self, f: impl FnOnce(&mut Inner<S::Item>) -> R) -> Result<R, SyncError> {
        self.ensure_alive()?;
        let (result, snapshot) = {
            let mut inner = lock(&self.inner);
            let result = f(&mut inner);
            (result, inner.snapshot.clone())
        };
        self.listeners.notify(&snapshot);
        Ok(result)
    }
}

impl<S: Source> ChannelTarget for Engine<S> {
    fn on_change(&self, channel: &str, event: &ChangeEvent) {
        if !self.is_alive() {
            return;
        }
        log::debug!("{channel}: {:?} on {}", event.kind, event.table);
        if let Some((key, notification)) = self.source.announce(&self.owner_id, event)
            && lock(&self.announced).insert(key)
        {
            self.notify(notification);
        }
        self.refresh_debounced();
    }

    fn poll(&self) {
        if !self.is_alive() {
            return;
        }
        let me = self.me.clone();
        tokio::spawn(async move {
            if let Some(engine) = me.upgrade()
                && let Err(e) = engine.load(true).await
            {
                log::debug!("Polling refresh of {} failed: {e}", S::NOUN);
            }
        });
    }
}

impl<S: Source> Drop for Engine<S> {
    fn drop(&mut self) {
        self.debouncer.cancel();
        if let Some(task) = lock(&self.verification).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use stash::MemoryStore;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::sleep;

    use crate::notify::{NotificationKind, RecordingNotifier};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: u32,
    }

    impl Keyed for Item {
        type Key = u32;

        fn key(&self) -> u32 {
            self.id
        }
    }

    #[derive(Default)]
    struct Fake {
        remote: Mutex<Vec<Item>>,
        fetches: AtomicUsize,
        counts: AtomicUsize,
        failing: AtomicBool,
        latency: Mutex<Duration>,
    }

    impl Fake {
        fn with_items(ids: &[u32]) -> Self {
            let fake = Self::default();
            *fake.remote.lock().unwrap() = ids.iter().map(|&id| Item { id }).collect();
            fake
        }
    }

    struct FakeSource(Arc<Fake>);

    impl Source for FakeSource {
        type Item = Item;
        const FAMILY: Family = Family::new("items");
        const NOUN: &'static str = "items";

        async fn fetch(&self, _owner_id: &str) -> Result<Vec<Item>, BackendError> {
            self.0.fetches.fetch_add(1, Ordering::SeqCst);
            let latency = *self.0.latency.lock().unwrap();
            sleep(latency).await;
            if self.0.failing.load(Ordering::SeqCst) {
                return Err(BackendError::Network("offline".to_string()));
            }
            Ok(self.0.remote.lock().unwrap().clone())
        }

        async fn remote_count(&self, _owner_id: &str) -> Result<usize, BackendError> {
            self.0.counts.fetch_add(1, Ordering::SeqCst);
            Ok(self.0.remote.lock().unwrap().len())
        }

        fn comparable_count(&self, items: &Vector<Item>) -> usize {
            items.len()
        }
    }

    fn cache() -> LocalCache {
        LocalCache::new(Arc::new(MemoryStore::new()), "test-v1")
    }

    fn engine(
        fake: &Arc<Fake>,
        cache: &LocalCache,
    ) -> (Arc<Engine<FakeSource>>, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let context = SyncContext::new("owner", cache.clone()).with_notifier(notifier.clone());
        (Engine::new(FakeSource(Arc::clone(fake)), &context), notifier)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_load_fetches_and_writes_through() {
        let fake = Arc::new(Fake::with_items(&[1, 2]));
        let cache = cache();
        let (engine, _) = engine(&fake, &cache);

        let items = engine.load(false).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(engine.snapshot().phase, Phase::Ready);
        assert_eq!(cache.get::<Item>(FakeSource::FAMILY, "owner").unwrap().len(), 2);
        assert_eq!(fake.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_fetch_and_verifies_in_background() {
        let fake = Arc::new(Fake::with_items(&[1, 2, 3]));
        let cache = cache();
        cache
            .set(FakeSource::FAMILY, "owner", &[Item { id: 1 }, Item { id: 2 }])
            .unwrap();
        let (engine, _) = engine(&fake, &cache);

        let items = engine.load(false).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(fake.fetches.load(Ordering::SeqCst), 0);

        // The count check finds three remote rows and triggers a full refresh.
        sleep(Duration::from_millis(10)).await;
        assert_eq!(fake.counts.load(Ordering::SeqCst), 1);
        assert_eq!(fake.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(engine.items().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_hit_after_first_load() {
        let fake = Arc::new(Fake::with_items(&[1]));
        let (engine, _) = engine(&fake, &cache());

        engine.load(false).await.unwrap();
        engine.load(false).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(fake.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_forced_loads_share_one_fetch() {
        let fake = Arc::new(Fake::with_items(&[1]));
        *fake.latency.lock().unwrap() = Duration::from_millis(200);
        let (engine, _) = engine(&fake, &cache());

        let (a, b) = tokio::join!(engine.load(true), engine.load(true));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(fake.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_keeps_data_and_notifies() {
        let fake = Arc::new(Fake::with_items(&[1, 2]));
        let (engine, notifier) = engine(&fake, &cache());
        engine.load(false).await.unwrap();

        fake.failing.store(true, Ordering::SeqCst);
        let result = engine.load(true).await;
        assert!(matches!(result, Err(SyncError::Backend(_))));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.items.len(), 2);
        assert!(snapshot.error.is_some());
        assert!(!snapshot.loading);
        assert_eq!(notifier.count(NotificationKind::Error), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_updates_state_cache_and_listeners() {
        let fake = Arc::new(Fake::with_items(&[1]));
        let cache = cache();
        let (engine, _) = engine(&fake, &cache);
        engine.load(false).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let key = engine.register_listener(move |snapshot| {
            counter.store(snapshot.items.len(), Ordering::SeqCst);
        });

        engine.apply(Mutation::Prepend(Item { id: 9 })).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(engine.items().front(), Some(&Item { id: 9 }));
        assert_eq!(
            cache.get::<Item>(FakeSource::FAMILY, "owner").unwrap(),
            vec![Item { id: 9 }, Item { id: 1 }]
        );

        assert!(engine.unregister_listener(key));
        engine.apply(Mutation::Remove(9)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_before_load_leaves_cache_alone() {
        let fake = Arc::new(Fake::with_items(&[1]));
        let cache = cache();
        let (engine, _) = engine(&fake, &cache);

        engine.apply(Mutation::Add(Item { id: 5 })).unwrap();
        assert_eq!(engine.items().len(), 1);
        assert_eq!(cache.get::<Item>(FakeSource::FAMILY, "owner"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_resolving_after_shutdown_writes_nothing() {
        let fake = Arc::new(Fake::with_items(&[1, 2]));
        *fake.latency.lock().unwrap() = Duration::from_millis(500);
        let cache = cache();
        let (engine, _) = engine(&fake, &cache);

        let loading = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.load(true).await }
        });
        sleep(Duration::from_millis(100)).await;
        engine.shutdown();

        let result = loading.await.unwrap();
        assert!(matches!(result, Err(SyncError::ShutDown)));
        assert!(engine.items().is_empty());
        assert_eq!(cache.get::<Item>(FakeSource::FAMILY, "owner"), None);
        assert!(matches!(
            engine.apply(Mutation::Add(Item { id: 3 })),
            Err(SyncError::ShutDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_after_shutdown_skips_the_count_query() {
        let fake = Arc::new(Fake::with_items(&[1, 2, 3]));
        let cache = cache();
        cache
            .set(FakeSource::FAMILY, "owner", &[Item { id: 1 }])
            .unwrap();
        let (engine, _) = engine(&fake, &cache);
        engine.load(false).await.unwrap();

        engine.shutdown();
        engine.verify().await;

        assert_eq!(fake.counts.load(Ordering::SeqCst), 0);
        assert_eq!(fake.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(engine.items().len(), 1);
    }
}
