//! Storage collaborator interface.
//!
//! The engine never issues queries of its own; it reads through a
//! [`StorageView`] snapshot and mutates only inside a [`StorageTxn`] that
//! covers one key's full row-set plus its bookkeeping records.

use crate::error::PipelineResult;
use crate::key::Key;
use crate::ledger::{CommitRecord, CommitToken, FailureRecord, JobRecord};
use crate::row::Row;

/// Which rows of a table a read returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    All,
    /// The row whose key equals this one.
    Exact(Key),
    /// Rows whose key agrees on every attribute given here.
    Partial(Key),
}

impl KeyFilter {
    pub fn accepts(&self, key: &Key) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Exact(k) => k == key,
            KeyFilter::Partial(k) => key.matches(k),
        }
    }
}

/// Consistent read-only view of the store.
pub trait StorageView {
    fn read_rows(&self, table: &str, filter: &KeyFilter) -> PipelineResult<Vec<Row>>;

    fn get_commit(&self, table: &str, key: &Key) -> PipelineResult<Option<CommitRecord>>;

    fn list_commits(&self, table: &str) -> PipelineResult<Vec<CommitRecord>>;

    fn get_job(&self, table: &str, key: &Key) -> PipelineResult<Option<JobRecord>>;

    /// Job records of one table, or of every table.
    fn list_jobs(&self, table: Option<&str>) -> PipelineResult<Vec<JobRecord>>;

    fn get_failure(&self, table: &str, key: &Key) -> PipelineResult<Option<FailureRecord>>;

    fn list_failures(&self, table: Option<&str>) -> PipelineResult<Vec<FailureRecord>>;

    fn row_exists(&self, table: &str, key: &Key) -> PipelineResult<bool> {
        Ok(!self
            .read_rows(table, &KeyFilter::Exact(key.clone()))?
            .is_empty())
    }
}

/// A write transaction. Dropping it without `commit` discards every change.
pub trait StorageTxn: StorageView {
    /// Token the transaction will carry once committed.
    fn token(&self) -> CommitToken;

    /// Insert rows, replacing any row with the same key.
    fn write_rows(&mut self, table: &str, rows: &[Row]) -> PipelineResult<()>;

    /// Remove rows by key. Returns how many existed.
    fn delete_rows(&mut self, table: &str, keys: &[Key]) -> PipelineResult<usize>;

    fn put_commit(&mut self, record: &CommitRecord) -> PipelineResult<()>;

    fn remove_commit(&mut self, table: &str, key: &Key) -> PipelineResult<bool>;

    fn put_job(&mut self, record: &JobRecord) -> PipelineResult<()>;

    fn remove_job(&mut self, table: &str, key: &Key) -> PipelineResult<bool>;

    fn put_failure(&mut self, record: &FailureRecord) -> PipelineResult<()>;

    fn remove_failure(&mut self, table: &str, key: &Key) -> PipelineResult<bool>;

    fn commit(self: Box<Self>) -> PipelineResult<CommitToken>;

    fn rollback(self: Box<Self>) -> PipelineResult<()>;
}

/// A transactional store shared by every worker.
pub trait Storage: Send + Sync {
    fn snapshot(&self) -> PipelineResult<Box<dyn StorageView + '_>>;

    fn begin(&self) -> PipelineResult<Box<dyn StorageTxn + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters() {
        let key = Key::new().with("session_id", 1).with("filter_name", "low");
        assert!(KeyFilter::All.accepts(&key));
        assert!(KeyFilter::Exact(key.clone()).accepts(&key));
        assert!(!KeyFilter::Exact(Key::new().with("session_id", 1)).accepts(&key));
        assert!(KeyFilter::Partial(Key::new().with("session_id", 1)).accepts(&key));
        assert!(!KeyFilter::Partial(Key::new().with("session_id", 2)).accepts(&key));
    }
}
