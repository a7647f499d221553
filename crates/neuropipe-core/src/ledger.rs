//! Bookkeeping records kept next to the rows: commits, jobs, failures.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::key::Key;
use crate::row::TableKey;

/// Monotonic sequence number of a committed write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitToken(pub u64);

impl fmt::Display for CommitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The row-set committed for one candidate key of one table.
///
/// Its presence is what makes a key "already populated".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub table: String,
    /// Candidate key the row-set was computed for.
    pub key: Key,
    /// Keys of the committed rows (zero or more).
    pub rows: Vec<Key>,
    /// Upstream rows the computation consumed.
    pub parents: Vec<TableKey>,
    pub token: CommitToken,
    /// Unix milliseconds.
    pub committed_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// A worker is computing the key.
    Reserved,
    /// The key is excluded from population until the record is cleared.
    Ignored,
}

/// Marker for in-progress (or ignored) work on one (table, key) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub table: String,
    pub key: Key,
    pub status: JobStatus,
    /// Reservation id, unique per attempt.
    pub owner: String,
    pub host: String,
    pub pid: u32,
    /// Unix milliseconds.
    pub reserved_at: u64,
    /// Upstream rows the job reads.
    #[serde(default)]
    pub parents: Vec<TableKey>,
}

impl JobRecord {
    /// A reserved job older than the liveness window is considered abandoned.
    pub fn is_stale(&self, now_ms: u64, liveness: Duration) -> bool {
        self.status == JobStatus::Reserved
            && now_ms.saturating_sub(self.reserved_at) > liveness.as_millis() as u64
    }

    pub fn is_live(&self, now_ms: u64, liveness: Duration) -> bool {
        self.status == JobStatus::Reserved && !self.is_stale(now_ms, liveness)
    }
}

/// Last failure recorded for a (table, key) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub table: String,
    pub key: Key,
    pub reason: String,
    pub attempts: u32,
    /// Unix milliseconds.
    pub failed_at: u64,
}
