//! Rows as the backend stores them. Field names follow the backend's snake_case columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ClientStatus;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

/// A confirmed trainer/student link.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RelationshipRow {
    pub id: i64,
    pub trainer_id: String,
    pub student_id: String,
    pub status: ClientStatus,
    pub created_at: DateTime<Utc>,
}

/// A link request that has not been answered yet. Either party may have sent it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RequestRow {
    pub id: i64,
    pub trainer_id: String,
    pub student_id: String,
    pub requested_by: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProfileRow {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

/// A client the trainer manages without a backend account.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GuestRow {
    pub id: i64,
    pub trainer_id: String,
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    pub status: ClientStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RoutineRow {
    pub id: i64,
    pub trainer_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BlockRow {
    pub id: i64,
    pub routine_id: i64,
    pub name: String,
    pub order: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BlockExerciseRow {
    pub id: i64,
    pub block_id: i64,
    pub name: String,
    pub sets: u32,
    pub reps: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub order: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AssignmentRow {
    pub id: i64,
    pub routine_id: i64,
    pub student_id: String,
    pub trainer_id: String,
    pub created_at: DateTime<Utc>,
}

// Insert payloads. Ids and creation timestamps are assigned by the backend.

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct NewRelationship {
    pub trainer_id: String,
    pub student_id: String,
    pub status: ClientStatus,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct NewGuest {
    pub trainer_id: String,
    pub full_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    pub status: ClientStatus,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct NewRoutine {
    pub trainer_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct NewBlock {
    pub routine_id: i64,
    pub name: String,
    pub order: u32,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct NewBlockExercise {
    pub block_id: i64,
    pub name: String,
    pub sets: u32,
    pub reps: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rest_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub order: u32,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct NewAssignment {
    pub routine_id: i64,
    pub student_id: String,
    pub trainer_id: String,
}

// Patches

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct StatusPatch<S> {
    pub status: S,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct RoutinePatch {
    pub name: String,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}
