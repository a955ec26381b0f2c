use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use super::{
    Backend, BackendError, ChangeEvent, ChangeKind, ChannelHandle, ChannelSignal, ChannelSink,
    Filter, Subscription, Table,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Select,
    Count,
    Insert,
    Update,
    Delete,
    Subscribe,
    Unsubscribe,
}

/// A backend that keeps every table in process.
///
/// Besides the [`Backend`] primitives it lets the caller add latency, inject failures, push
/// change events to live channels and read per-operation call counters.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<Table, Vec<Value>>,
    next_id: BTreeMap<Table, i64>,
    latency: Duration,
    failures: HashMap<(Operation, Table), BackendError>,
    subscribe_failures: usize,
    channels: Vec<LiveChannel>,
    next_channel: u64,
    calls: HashMap<(Operation, Table), usize>,
}

struct LiveChannel {
    handle: ChannelHandle,
    subscription: Subscription,
    sink: ChannelSink,
}

impl State {
    fn allocate_id(&mut self, table: Table) -> i64 {
        let next = self.next_id.entry(table).or_insert(1);
        let id = *next;
        *next += 1;
        id
    }

    fn store(&mut self, table: Table, mut row: Value) -> Result<Value, BackendError> {
        let Some(object) = row.as_object_mut() else {
            return Err(BackendError::Rejected(format!(
                "rows inserted into {table} must be objects"
            )));
        };
        match object.get("id").and_then(Value::as_i64) {
            Some(id) => {
                let next = self.next_id.entry(table).or_insert(1);
                *next = (*next).max(id + 1);
            }
            None if !object.contains_key("id") => {
                let id = self.allocate_id(table);
                object.insert("id".to_string(), Value::from(id));
            }
            None => {}
        }
        if table.stamps_creation() && !object.contains_key("created_at") {
            object.insert(
                "created_at".to_string(),
                serde_json::to_value(Utc::now())?,
            );
        }
        self.tables.entry(table).or_default().push(row.clone());
        Ok(row)
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a row directly, bypassing failure injection and call counters.
    pub fn seed(&self, table: Table, row: Value) -> Value {
        match self.lock().store(table, row.clone()) {
            Ok(stored) => stored,
            Err(e) => {
                log::error!("Failed to seed {table}: {e}");
                row
            }
        }
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.lock().tables.get(&table).cloned().unwrap_or_default()
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Make every `operation` on `table` fail with `error` until [`Self::clear_failures`].
    pub fn fail(&self, operation: Operation, table: Table, error: BackendError) {
        self.lock().failures.insert((operation, table), error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.subscribe_failures = 0;
    }

    /// Refuse the next `count` subscribe attempts, on any table.
    pub fn fail_subscribes(&self, count: usize) {
        self.lock().subscribe_failures = count;
    }

    pub fn calls(&self, operation: Operation, table: Table) -> usize {
        self.lock()
            .calls
            .get(&(operation, table))
            .copied()
            .unwrap_or(0)
    }

    pub fn live_channels(&self) -> Vec<ChannelHandle> {
        self.lock()
            .channels
            .iter()
            .filter(|channel| !channel.sink.is_closed())
            .map(|channel| channel.handle.clone())
            .collect()
    }

    /// Push a change to every live channel listening on `table` whose filter matches `row`.
    /// Returns how many channels received it.
    pub fn emit(&self, table: Table, kind: ChangeKind, row: Value) -> usize {
        let mut state = self.lock();
        state.channels.retain(|channel| !channel.sink.is_closed());
        state
            .channels
            .iter()
            .filter(|channel| {
                channel.subscription.table == table && channel.subscription.filter.matches(&row)
            })
            .filter(|channel| {
                channel
                    .sink
                    .send(ChannelSignal::Event(ChangeEvent {
                        kind,
                        table,
                        row: row.clone(),
                    }))
                    .is_ok()
            })
            .count()
    }

    /// Fail every live channel, as a dropped connection would.
    pub fn drop_channels(&self, reason: &str) -> usize {
        let channels = std::mem::take(&mut self.lock().channels);
        let dropped = channels.len();
        for channel in channels {
            let _ = channel.sink.send(ChannelSignal::Failed(reason.to_string()));
        }
        dropped
    }

    /// Count the call, apply latency, then fail if a failure is injected.
    async fn enter(&self, operation: Operation, table: Table) -> Result<(), BackendError> {
        let latency = {
            let mut state = self.lock();
            *state.calls.entry((operation, table)).or_insert(0) += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.lock().failures.get(&(operation, table)) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

impl Backend for InMemoryBackend {
    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<Value>, BackendError> {
        self.enter(Operation::Select, table).await?;
        let mut rows: Vec<Value> = self
            .lock()
            .tables
            .get(&table)
            .map(|rows| rows.iter().filter(|row| filter.matches(row)).cloned().collect())
            .unwrap_or_default();
        filter.sort(&mut rows);
        Ok(rows)
    }

    async fn count(&self, table: Table, filter: &Filter) -> Result<usize, BackendError> {
        self.enter(Operation::Count, table).await?;
        Ok(self
            .lock()
            .tables
            .get(&table)
            .map(|rows| rows.iter().filter(|row| filter.matches(row)).count())
            .unwrap_or(0))
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, BackendError> {
        self.enter(Operation::Insert, table).await?;
        self.lock().store(table, row)
    }

    async fn update(
        &self,
        table: Table,
        filter: &Filter,
        patch: Value,
    ) -> Result<usize, BackendError> {
        self.enter(Operation::Update, table).await?;
        let Some(patch) = patch.as_object() else {
            return Err(BackendError::Rejected("patch must be an object".to_string()));
        };
        let mut state = self.lock();
        let mut changed = 0;
        for row in state.tables.entry(table).or_default().iter_mut() {
            if !filter.matches(row) {
                continue;
            }
            if let Some(object) = row.as_object_mut() {
                for (column, value) in patch {
                    object.insert(column.clone(), value.clone());
                }
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete(&self, table: Table, filter: &Filter) -> Result<usize, BackendError> {
        self.enter(Operation::Delete, table).await?;
        let mut state = self.lock();
        let rows = state.tables.entry(table).or_default();
        let before = rows.len();
        rows.retain(|row| !filter.matches(row));
        Ok(before - rows.len())
    }

    async fn subscribe(
        &self,
        subscription: Subscription,
        sink: ChannelSink,
    ) -> Result<ChannelHandle, BackendError> {
        self.enter(Operation::Subscribe, subscription.table).await?;
        let mut state = self.lock();
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(BackendError::Rejected(format!(
                "subscription to {} refused",
                subscription.channel
            )));
        }
        state.next_channel += 1;
        let handle = ChannelHandle {
            id: state.next_channel,
            channel: subscription.channel.clone(),
        };
        state.channels.push(LiveChannel {
            handle: handle.clone(),
            subscription,
            sink,
        });
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<(), BackendError> {
        let table = self
            .lock()
            .channels
            .iter()
            .find(|channel| channel.handle == *handle)
            .map(|channel| channel.subscription.table);
        if let Some(table) = table {
            self.enter(Operation::Unsubscribe, table).await?;
        }
        self.lock().channels.retain(|channel| channel.handle != *handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_insert_assigns_ids_and_timestamps() {
        let backend = InMemoryBackend::new();
        let first = backend
            .insert(Table::Routines, json!({"trainer_id": "t1", "name": "Legs"}))
            .await
            .unwrap();
        let second = backend
            .insert(Table::RoutineBlocks, json!({"routine_id": 1, "name": "A", "order": 0}))
            .await
            .unwrap();

        assert_eq!(first["id"], json!(1));
        assert!(first.get("created_at").is_some());
        assert_eq!(second["id"], json!(1));
        assert!(second.get("created_at").is_none());
        assert_eq!(backend.calls(Operation::Insert, Table::Routines), 1);
    }

    #[tokio::test]
    async fn test_seeded_ids_advance_the_counter() {
        let backend = InMemoryBackend::new();
        backend.seed(Table::Routines, json!({"id": 41, "trainer_id": "t1", "name": "Old"}));
        let row = backend
            .insert(Table::Routines, json!({"trainer_id": "t1", "name": "New"}))
            .await
            .unwrap();
        assert_eq!(row["id"], json!(42));
        assert_eq!(backend.calls(Operation::Insert, Table::Routines), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete_report_affected_rows() {
        let backend = InMemoryBackend::new();
        for id in [1, 2] {
            backend.seed(
                Table::TrainerRequests,
                json!({"id": id, "trainer_id": "t1", "status": "pending"}),
            );
        }

        let changed = backend
            .update(
                Table::TrainerRequests,
                &Filter::new().eq("id", 1),
                json!({"status": "rejected"}),
            )
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let pending = Filter::new().eq("status", "pending");
        assert_eq!(backend.count(Table::TrainerRequests, &pending).await.unwrap(), 1);
        assert_eq!(backend.delete(Table::TrainerRequests, &pending).await.unwrap(), 1);
        assert_eq!(backend.rows(Table::TrainerRequests).len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_returned() {
        let backend = InMemoryBackend::new();
        backend.fail(Operation::Select, Table::Profiles, BackendError::Timeout);

        assert_eq!(
            backend.select(Table::Profiles, &Filter::new()).await,
            Err(BackendError::Timeout)
        );
        backend.clear_failures();
        assert_eq!(backend.select(Table::Profiles, &Filter::new()).await, Ok(vec![]));
        assert_eq!(backend.calls(Operation::Select, Table::Profiles), 2);
    }

    #[tokio::test]
    async fn test_emit_reaches_matching_channels_only() {
        let backend = InMemoryBackend::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        backend
            .subscribe(
                Subscription {
                    channel: "requests".to_string(),
                    table: Table::TrainerRequests,
                    filter: Filter::new().eq("trainer_id", "t1"),
                },
                tx,
            )
            .await
            .unwrap();

        assert_eq!(
            backend.emit(Table::TrainerRequests, ChangeKind::Insert, json!({"trainer_id": "t2"})),
            0
        );
        assert_eq!(
            backend.emit(Table::TrainerRequests, ChangeKind::Insert, json!({"trainer_id": "t1"})),
            1
        );
        assert!(matches!(
            rx.recv().await,
            Some(ChannelSignal::Event(event)) if event.kind == ChangeKind::Insert
        ));

        assert_eq!(backend.drop_channels("gone"), 1);
        assert_eq!(rx.recv().await, Some(ChannelSignal::Failed("gone".to_string())));
        assert!(backend.live_channels().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_failures_are_consumed() {
        let backend = InMemoryBackend::new();
        backend.fail_subscribes(1);
        let subscription = Subscription {
            channel: "routines".to_string(),
            table: Table::Routines,
            filter: Filter::new(),
        };

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(backend.subscribe(subscription.clone(), tx.clone()).await.is_err());
        let handle = backend.subscribe(subscription, tx).await.unwrap();
        assert_eq!(backend.live_channels(), vec![handle.clone()]);

        backend.unsubscribe(&handle).await.unwrap();
        assert!(backend.live_channels().is_empty());
    }
}
