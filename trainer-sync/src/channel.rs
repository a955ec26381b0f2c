use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::SyncConfig;
use crate::backend::{Backend, ChangeEvent, ChannelHandle, ChannelSignal, Subscription};

/// What a channel drives. Channels only hold a weak reference to it.
pub trait ChannelTarget: Send + Sync + 'static {
    fn on_change(&self, channel: &str, event: &ChangeEvent);
    /// Called on every tick while the channel is polling instead of listening.
    fn poll(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Subscribed,
    ReconnectScheduled,
    PollingFallback,
    Closed,
}

struct Shared {
    state: Mutex<ChannelState>,
    handle: Mutex<Option<ChannelHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_state(&self, channel: &str, state: ChannelState) {
        let mut current = lock(&self.state);
        if *current != state && *current != ChannelState::Closed {
            log::debug!("Channel {channel}: {:?} -> {state:?}", *current);
            *current = state;
        }
    }
}

struct Channel {
    name: String,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

/// Keeps push channels open: reconnects with linear backoff, falls back to polling after too
/// many failed attempts and keeps trying to resubscribe while polling.
pub struct ChannelManager<B: Backend> {
    backend: Arc<B>,
    config: SyncConfig,
    channels: Mutex<Vec<Channel>>,
}

impl<B: Backend> ChannelManager<B> {
    pub fn new(backend: Arc<B>, config: SyncConfig) -> Self {
        Self {
            backend,
            config,
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn open(&self, subscription: Subscription, target: Weak<dyn ChannelTarget>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(ChannelState::Connecting),
            handle: Mutex::new(None),
        });
        let name = subscription.channel.clone();
        log::info!("Opening channel {name}");

        let task = tokio::spawn(run_channel(
            Arc::clone(&self.backend),
            self.config.clone(),
            subscription,
            target,
            Arc::clone(&shared),
        ));
        lock(&self.channels).push(Channel { name, shared, task });
    }

    pub fn state(&self, channel: &str) -> Option<ChannelState> {
        lock(&self.channels)
            .iter()
            .find(|open| open.name == channel)
            .map(|open| *lock(&open.shared.state))
    }

    pub fn states(&self) -> Vec<(String, ChannelState)> {
        lock(&self.channels)
            .iter()
            .map(|open| (open.name.clone(), *lock(&open.shared.state)))
            .collect()
    }

    /// Stop every channel task and unsubscribe whatever is still subscribed.
    pub async fn close_all(&self) {
        let handles = self.abort_all();
        for handle in handles {
            if let Err(e) = self.backend.unsubscribe(&handle).await {
                log::warn!("Failed to unsubscribe {}: {e}", handle.channel);
            }
        }
    }

    /// Stop every channel task without waiting. Returns the handles that were still live.
    fn abort_all(&self) -> Vec<ChannelHandle> {
        lock(&self.channels)
            .iter()
            .filter_map(|open| {
                open.task.abort();
                open.shared.set_state(&open.name, ChannelState::Closed);
                lock(&open.shared.handle).take()
            })
            .collect()
    }
}

impl<B: Backend> Drop for ChannelManager<B> {
    fn drop(&mut self) {
        let handles = self.abort_all();
        if handles.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let backend = Arc::clone(&self.backend);
                runtime.spawn(async move {
                    for handle in handles {
                        let _ = backend.unsubscribe(&handle).await;
                    }
                });
            }
            Err(_) => log::debug!("No runtime left to unsubscribe {} channels", handles.len()),
        }
    }
}

async fn subscribe<B: Backend>(
    backend: &B,
    config: &SyncConfig,
    subscription: &Subscription,
) -> Option<(ChannelHandle, mpsc::UnboundedReceiver<ChannelSignal>)> {
    let (sink, signals) = mpsc::unbounded_channel();
    let attempt = tokio::time::timeout(
        config.subscribe_timeout(),
        backend.subscribe(subscription.clone(), sink),
    )
    .await;
    match attempt {
        Ok(Ok(handle)) => Some((handle, signals)),
        Ok(Err(e)) => {
            log::warn!("Subscribing to {} failed: {e}", subscription.channel);
            None
        }
        Err(_) => {
            log::warn!("Subscribing to {} timed out", subscription.channel);
            None
        }
    }
}

async fn run_channel<B: Backend>(
    backend: Arc<B>,
    config: SyncConfig,
    subscription: Subscription,
    target: Weak<dyn ChannelTarget>,
    shared: Arc<Shared>,
) {
    let name = subscription.channel.as_str();
    let mut failures: u32 = 0;
    let mut polling = false;

    loop {
        let connected = if polling {
            tokio::time::sleep(config.poll_interval()).await;
            let Some(target) = target.upgrade() else {
                return;
            };
            target.poll();
            drop(target);
            subscribe(backend.as_ref(), &config, &subscription).await
        } else {
            shared.set_state(name, ChannelState::Connecting);
            subscribe(backend.as_ref(), &config, &subscription).await
        };

        if let Some((handle, mut signals)) = connected {
            polling = false;
            failures = 0;
            *lock(&shared.handle) = Some(handle);
            shared.set_state(name, ChannelState::Subscribed);

            loop {
                match signals.recv().await {
                    Some(ChannelSignal::Event(event)) => {
                        let Some(target) = target.upgrade() else {
                            return;
                        };
                        target.on_change(name, &event);
                    }
                    Some(ChannelSignal::Failed(reason)) => {
                        log::warn!("Channel {name} failed: {reason}");
                        break;
                    }
                    None => {
                        log::warn!("Channel {name} closed by the backend");
                        break;
                    }
                }
            }

            let handle = lock(&shared.handle).take();
            if let Some(handle) = handle
                && let Err(e) = backend.unsubscribe(&handle).await
            {
                log::debug!("Unsubscribing dead channel {name} failed: {e}");
            }
        }

        if target.strong_count() == 0 {
            return;
        }

        failures = failures.saturating_add(1);
        if failures >= config.max_reconnect_attempts {
            if !polling {
                log::warn!("Channel {name} gave up after {failures} attempts, polling instead");
                polling = true;
                shared.set_state(name, ChannelState::PollingFallback);
            }
        } else {
            shared.set_state(name, ChannelState::ReconnectScheduled);
            tokio::time::sleep(config.reconnect_delay(failures)).await;
        }
    }
}
