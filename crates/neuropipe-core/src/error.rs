//! Error types shared by every neuropipe crate.

use thiserror::Error;

use crate::key::Key;
use crate::value::Value;

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Structural errors. Per-key compute failures are not errors; they are
/// recorded in the failure ledger and reported by the populator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("schema error in table {table}: {reason}")]
    Schema { table: String, reason: String },

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("key conflict on attribute {attribute}: {left} != {right}")]
    KeyConflict {
        attribute: String,
        left: Value,
        right: Value,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid restriction: {0}")]
    InvalidRestriction(String),

    #[error("delete conflict: {table} {key} is reserved by a running job")]
    DeleteConflict { table: String, key: Key },

    #[error("{table} {key} still has dependent rows in {dependent}")]
    DependentsExist {
        table: String,
        key: Key,
        dependent: String,
    },

    #[error("missing parent row in {parent} for {table} {key}")]
    MissingParent {
        table: String,
        parent: String,
        key: Key,
    },

    #[error("duplicate entry in {table}: {key}")]
    Duplicate { table: String, key: Key },

    #[error("row not found in {table}: {key}")]
    RowNotFound { table: String, key: Key },

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    pub fn schema(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Schema {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Conflicts that clear up once a running job finishes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeleteConflict { .. })
    }
}
