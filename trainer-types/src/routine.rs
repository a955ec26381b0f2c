use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stash::Keyed;

use crate::rows::{NewBlock, NewBlockExercise, NewRoutine, RoutinePatch};

const TEMPORARY_PREFIX: &str = "temp-";

/// A routine's identity. Routines created locally carry a `temp-<millis>` token until the
/// backend assigns them a real id on first save.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RoutineId {
    Persisted(i64),
    Temporary(String),
}

impl RoutineId {
    pub fn is_temporary(&self) -> bool {
        matches!(self, RoutineId::Temporary(_))
    }

    pub fn persisted(&self) -> Option<i64> {
        match self {
            RoutineId::Persisted(id) => Some(*id),
            RoutineId::Temporary(_) => None,
        }
    }
}

impl From<i64> for RoutineId {
    fn from(id: i64) -> Self {
        RoutineId::Persisted(id)
    }
}

impl fmt::Display for RoutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutineId::Persisted(id) => write!(f, "{id}"),
            RoutineId::Temporary(token) => f.write_str(token),
        }
    }
}

/// Hands out temporary routine ids. Two drafts created in the same millisecond still get
/// distinct tokens: the timestamp is bumped past the last one issued.
#[derive(Debug, Default)]
pub struct TemporaryIds {
    last: AtomicI64,
}

impl TemporaryIds {
    pub const fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    pub fn next(&self, now: DateTime<Utc>) -> RoutineId {
        let millis = now.timestamp_millis();
        let bump = |last: i64| if last >= millis { last + 1 } else { millis };
        let previous = match self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(bump(last)))
        {
            Ok(previous) | Err(previous) => previous,
        };
        RoutineId::Temporary(format!("{TEMPORARY_PREFIX}{}", bump(previous)))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Routine {
    pub id: RoutineId,
    pub name: String,
    pub description: Option<String>,
    pub blocks: Vec<Block>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: Option<i64>,
    pub name: String,
    pub order: u32,
    pub exercises: Vec<BlockExercise>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockExercise {
    pub id: Option<i64>,
    pub name: String,
    pub sets: u32,
    pub reps: String,
    pub rest_seconds: Option<u32>,
    pub notes: Option<String>,
    pub order: u32,
}

impl Routine {
    pub fn draft(id: RoutineId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            blocks: Vec::new(),
            created_at: now,
            updated_at: None,
        }
    }

    pub fn exercise_count(&self) -> usize {
        self.blocks.iter().map(|block| block.exercises.len()).sum()
    }

    pub fn insert_row(&self, trainer_id: &str) -> NewRoutine {
        NewRoutine {
            trainer_id: trainer_id.to_string(),
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }

    pub fn patch(&self, now: DateTime<Utc>) -> RoutinePatch {
        RoutinePatch {
            name: self.name.clone(),
            description: self.description.clone(),
            updated_at: now,
        }
    }
}

impl Keyed for Routine {
    type Key = RoutineId;

    fn key(&self) -> RoutineId {
        self.id.clone()
    }
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            order: 0,
            exercises: Vec::new(),
        }
    }

    pub fn insert_row(&self, routine_id: i64, order: u32) -> NewBlock {
        NewBlock {
            routine_id,
            name: self.name.clone(),
            order,
        }
    }
}

impl BlockExercise {
    pub fn new(name: impl Into<String>, sets: u32, reps: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            sets,
            reps: reps.into(),
            rest_seconds: None,
            notes: None,
            order: 0,
        }
    }

    pub fn insert_row(&self, block_id: i64, order: u32) -> NewBlockExercise {
        NewBlockExercise {
            block_id,
            name: self.name.clone(),
            sets: self.sets,
            reps: self.reps.clone(),
            rest_seconds: self.rest_seconds,
            notes: self.notes.clone(),
            order,
        }
    }
}
