//! Engine error types.

use neuropipe_core::{Key, PipelineError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("table {table} uses compute function {compute}, which is not registered")]
    ComputeNotFound { table: String, compute: String },

    #[error("{table} {key} is reserved by {owner}")]
    Reserved {
        table: String,
        key: Key,
        owner: String,
    },

    #[error("invalid entries file: {0}")]
    Entries(String),

    #[error("worker task failed: {0}")]
    Task(String),
}

impl EngineError {
    /// True for a cascade delete or invalidate blocked by a running job.
    pub fn is_delete_conflict(&self) -> bool {
        matches!(self, EngineError::Pipeline(PipelineError::DeleteConflict { .. }))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
