//! Store errors. Every one surfaces to the engine as `PipelineError::Storage`.

use neuropipe_core::PipelineError;
use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open store: {0}")]
    Open(String),

    #[error("store transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open redb table: {0}")]
    Table(String),

    #[error("store read failed: {0}")]
    Read(String),

    #[error("store write failed: {0}")]
    Write(String),

    #[error("cannot encode record: {0}")]
    Encode(String),

    /// A stored value no longer decodes as the record type it was written as.
    #[error("corrupt record {record}: {reason}")]
    Corrupt { record: String, reason: String },
}

impl From<StateError> for PipelineError {
    fn from(err: StateError) -> Self {
        PipelineError::Storage(err.to_string())
    }
}
