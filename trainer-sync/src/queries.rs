//! Typed reads over the [`Backend`] primitives.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use trainer_types::rows::{
    BlockExerciseRow, BlockRow, GuestRow, ProfileRow, RelationshipRow, RequestRow, RoutineRow,
};

use crate::backend::{Backend, BackendError, Direction, Filter, Table};

const PENDING: &str = "pending";

async fn select_rows<B: Backend, T: DeserializeOwned>(
    backend: &B,
    table: Table,
    filter: &Filter,
) -> Result<Vec<T>, BackendError> {
    let rows = backend.select(table, filter).await?;
    rows.into_iter().map(|row| decode_row(table, row)).collect()
}

pub fn decode_row<T: DeserializeOwned>(table: Table, row: Value) -> Result<T, BackendError> {
    serde_json::from_value(row).map_err(|e| BackendError::Decode(format!("bad {table} row: {e}")))
}

pub fn relationships_filter(trainer_id: &str) -> Filter {
    Filter::new().eq("trainer_id", trainer_id)
}

pub fn pending_requests_filter(trainer_id: &str) -> Filter {
    Filter::new()
        .eq("trainer_id", trainer_id)
        .eq("status", PENDING)
}

pub async fn query_relationships<B: Backend>(
    backend: &B,
    trainer_id: &str,
) -> Result<Vec<RelationshipRow>, BackendError> {
    let filter = relationships_filter(trainer_id).order_by("created_at", Direction::Ascending);
    select_rows(backend, Table::TrainerStudents, &filter).await
}

pub async fn count_relationships<B: Backend>(
    backend: &B,
    trainer_id: &str,
) -> Result<usize, BackendError> {
    backend
        .count(Table::TrainerStudents, &relationships_filter(trainer_id))
        .await
}

pub async fn query_pending_requests<B: Backend>(
    backend: &B,
    trainer_id: &str,
) -> Result<Vec<RequestRow>, BackendError> {
    let filter = pending_requests_filter(trainer_id).order_by("created_at", Direction::Ascending);
    select_rows(backend, Table::TrainerRequests, &filter).await
}

pub async fn count_pending_requests<B: Backend>(
    backend: &B,
    trainer_id: &str,
) -> Result<usize, BackendError> {
    backend
        .count(Table::TrainerRequests, &pending_requests_filter(trainer_id))
        .await
}

/// One batched query for every profile in `ids`. An empty id list skips the round trip.
pub async fn query_profiles<B: Backend>(
    backend: &B,
    ids: &[String],
) -> Result<Vec<ProfileRow>, BackendError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let filter = Filter::new().is_in("id", ids.iter().cloned());
    select_rows(backend, Table::Profiles, &filter).await
}

pub async fn query_guests<B: Backend>(
    backend: &B,
    trainer_id: &str,
) -> Result<Vec<GuestRow>, BackendError> {
    let filter = Filter::new()
        .eq("trainer_id", trainer_id)
        .order_by("created_at", Direction::Ascending);
    select_rows(backend, Table::TrainerGuests, &filter).await
}

pub fn routines_filter(trainer_id: &str) -> Filter {
    Filter::new().eq("trainer_id", trainer_id)
}

/// Newest first.
pub async fn query_routines<B: Backend>(
    backend: &B,
    trainer_id: &str,
) -> Result<Vec<RoutineRow>, BackendError> {
    let filter = routines_filter(trainer_id).order_by("created_at", Direction::Descending);
    select_rows(backend, Table::Routines, &filter).await
}

pub async fn count_routines<B: Backend>(
    backend: &B,
    trainer_id: &str,
) -> Result<usize, BackendError> {
    backend.count(Table::Routines, &routines_filter(trainer_id)).await
}

pub async fn query_blocks<B: Backend>(
    backend: &B,
    routine_ids: &[i64],
) -> Result<Vec<BlockRow>, BackendError> {
    if routine_ids.is_empty() {
        return Ok(Vec::new());
    }
    let filter = Filter::new().is_in("routine_id", routine_ids.iter().copied());
    select_rows(backend, Table::RoutineBlocks, &filter).await
}

pub async fn query_block_exercises<B: Backend>(
    backend: &B,
    block_ids: &[i64],
) -> Result<Vec<BlockExerciseRow>, BackendError> {
    if block_ids.is_empty() {
        return Ok(Vec::new());
    }
    let filter = Filter::new().is_in("block_id", block_ids.iter().copied());
    select_rows(backend, Table::BlockExercises, &filter).await
}

pub fn encode_row<T: Serialize>(row: &T) -> Result<Value, BackendError> {
    Ok(serde_json::to_value(row)?)
}
