use std::fmt;

use crate::backend::BackendError;

/// How far a hierarchical routine write got before it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStage {
    Routine,
    Blocks,
    Block { block: usize },
    Exercise { block: usize, exercise: usize },
}

impl fmt::Display for SaveStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveStage::Routine => f.write_str("writing the routine row"),
            SaveStage::Blocks => f.write_str("clearing the old blocks"),
            SaveStage::Block { block } => write!(f, "writing block {}", block + 1),
            SaveStage::Exercise { block, exercise } => {
                write!(f, "writing exercise {} of block {}", exercise + 1, block + 1)
            }
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("local cache failed: {0}")]
    Cache(String),
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
    #[error("routine `{0}` has not been saved yet")]
    TemporaryRoutine(String),
    #[error("cannot {action} `{client_id}`: {reason}")]
    InvalidAction {
        action: &'static str,
        client_id: String,
        reason: &'static str,
    },
    #[error("saving failed while {stage}: {source}")]
    PartialWrite {
        stage: SaveStage,
        source: BackendError,
    },
    #[error("synchronizer has been shut down")]
    ShutDown,
}

impl From<stash::StashError> for SyncError {
    fn from(error: stash::StashError) -> Self {
        SyncError::Cache(error.to_string())
    }
}
