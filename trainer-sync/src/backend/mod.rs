//! The remote backend as the engine sees it: a handful of table-level primitives plus push
//! subscriptions. Typed queries live in [`crate::queries`] and are built on top of these.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

pub mod memory;
#[cfg(feature = "supabase")]
pub mod supabase;

pub use memory::{InMemoryBackend, Operation};
#[cfg(feature = "supabase")]
pub use supabase::{SupabaseBackend, SupabaseConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    TrainerStudents,
    TrainerRequests,
    Profiles,
    TrainerGuests,
    Routines,
    RoutineBlocks,
    BlockExercises,
    RoutineAssignments,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::TrainerStudents,
        Table::TrainerRequests,
        Table::Profiles,
        Table::TrainerGuests,
        Table::Routines,
        Table::RoutineBlocks,
        Table::BlockExercises,
        Table::RoutineAssignments,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::TrainerStudents => "trainer_students",
            Table::TrainerRequests => "trainer_requests",
            Table::Profiles => "profiles",
            Table::TrainerGuests => "trainer_guests",
            Table::Routines => "routines",
            Table::RoutineBlocks => "routine_blocks",
            Table::BlockExercises => "block_exercises",
            Table::RoutineAssignments => "routine_assignments",
        }
    }

    /// Whether the backend stamps `created_at` on insert.
    pub fn stamps_creation(&self) -> bool {
        !matches!(
            self,
            Table::Profiles | Table::RoutineBlocks | Table::BlockExercises
        )
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq { column: String, value: Value },
    In { column: String, values: Vec<Value> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

/// A conjunction of column conditions, optionally ordered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
    order: Option<OrderBy>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq {
            column: column.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn is_in<V: Into<Value>>(
        mut self,
        column: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.conditions.push(Condition::In {
            column: column.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn order_by(mut self, column: &str, direction: Direction) -> Self {
        self.order = Some(OrderBy {
            column: column.to_string(),
            direction,
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn order(&self) -> Option<&OrderBy> {
        self.order.as_ref()
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq { column, value } => row.get(column) == Some(value),
            Condition::In { column, values } => row
                .get(column)
                .is_some_and(|found| values.iter().any(|value| value == found)),
        })
    }

    /// Sort `rows` by this filter's ordering, if it has one. Timestamps compare as instants.
    pub fn sort(&self, rows: &mut [Value]) {
        let Some(order) = &self.order else {
            return;
        };
        rows.sort_by(|a, b| {
            let ordering = compare_values(a.get(&order.column), b.get(&order.column));
            match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            }
        });
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => {
            match (a.parse::<DateTime<Utc>>(), b.parse::<DateTime<Utc>>()) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                _ => a.cmp(b),
            }
        }
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// What a push channel listens to.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub channel: String,
    pub table: Table,
    pub filter: Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: Table,
    pub row: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    Event(ChangeEvent),
    /// The channel is gone and will deliver nothing else.
    Failed(String),
}

pub type ChannelSink = mpsc::UnboundedSender<ChannelSignal>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub id: u64,
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),
    #[error("backend responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("backend rejected the request: {0}")]
    Rejected(String),
    #[error("failed to decode backend response: {0}")]
    Decode(String),
    #[error("backend request timed out")]
    Timeout,
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
}

impl From<serde_json::Error> for BackendError {
    fn from(error: serde_json::Error) -> Self {
        BackendError::Decode(error.to_string())
    }
}

/// Table-level access to the remote store.
///
/// Rows travel as JSON objects with snake_case columns. Implementations return structured
/// errors and never panic on bad responses.
pub trait Backend: Send + Sync + 'static {
    fn select(
        &self,
        table: Table,
        filter: &Filter,
    ) -> impl Future<Output = Result<Vec<Value>, BackendError>> + Send;

    fn count(
        &self,
        table: Table,
        filter: &Filter,
    ) -> impl Future<Output = Result<usize, BackendError>> + Send;

    /// Insert one row and return it as stored, with its id and timestamps filled in.
    fn insert(
        &self,
        table: Table,
        row: Value,
    ) -> impl Future<Output = Result<Value, BackendError>> + Send;

    /// Merge `patch` into every matching row. Returns how many rows changed.
    fn update(
        &self,
        table: Table,
        filter: &Filter,
        patch: Value,
    ) -> impl Future<Output = Result<usize, BackendError>> + Send;

    fn delete(
        &self,
        table: Table,
        filter: &Filter,
    ) -> impl Future<Output = Result<usize, BackendError>> + Send;

    fn subscribe(
        &self,
        subscription: Subscription,
        sink: ChannelSink,
    ) -> impl Future<Output = Result<ChannelHandle, BackendError>> + Send;

    fn unsubscribe(
        &self,
        handle: &ChannelHandle,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}
