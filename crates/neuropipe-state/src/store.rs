//! StateStore: redb-backed persistence for rows and their ledgers.
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Reads go through a `ReadTransaction` snapshot; writes through a single
//! `WriteTransaction`, which redb serializes across threads. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use neuropipe_core::{
    CommitRecord, CommitToken, FailureRecord, JobRecord, Key, KeyFilter, PipelineResult, Row,
    Storage, StorageTxn, StorageView,
};
use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROWS).map_err(map_err!(Table))?;
        txn.open_table(COMMITS).map_err(map_err!(Table))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(FAILURES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Token of the most recent committed write, zero for a fresh store.
    pub fn last_token(&self) -> StateResult<CommitToken> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        let last = meta.get(COMMIT_SEQ).map_err(map_err!(Read))?.map(|g| g.value());
        Ok(CommitToken(last.unwrap_or(0)))
    }
}

impl Storage for StateStore {
    fn snapshot(&self) -> PipelineResult<Box<dyn StorageView + '_>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        Ok(Box::new(StoreView { txn }))
    }

    fn begin(&self) -> PipelineResult<Box<dyn StorageTxn + '_>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let last = {
            let meta = txn.open_table(META).map_err(map_err!(Table))?;
            let value = meta.get(COMMIT_SEQ).map_err(map_err!(Read))?.map(|g| g.value());
            value.unwrap_or(0)
        };
        let token = CommitToken(last + 1);
        debug!(%token, "write transaction started");
        Ok(Box::new(StoreTxn { txn, token }))
    }
}

/// Read-only snapshot.
pub struct StoreView {
    txn: ReadTransaction,
}

/// Write transaction. Dropped without `commit`, redb aborts it.
pub struct StoreTxn {
    txn: WriteTransaction,
    token: CommitToken,
}

fn fetch<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let record = serde_json::from_slice(guard.value()).map_err(|e| corrupt(key, e))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn corrupt(record: &str, err: serde_json::Error) -> StateError {
    StateError::Corrupt {
        record: record.to_string(),
        reason: err.to_string(),
    }
}

/// Every record whose key starts with `prefix`, in key order.
fn scan<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        let record = serde_json::from_slice(value.value()).map_err(|e| corrupt(key.value(), e))?;
        results.push(record);
    }
    Ok(results)
}

/// Reads are identical for snapshots and write transactions; only the
/// concrete table type returned by `open_table` differs.
macro_rules! impl_storage_view {
    ($ty:ty) => {
        impl StorageView for $ty {
            fn read_rows(&self, table: &str, filter: &KeyFilter) -> PipelineResult<Vec<Row>> {
                let records = self.txn.open_table(ROWS).map_err(map_err!(Table))?;
                let rows: Vec<Row> = match filter {
                    KeyFilter::Exact(key) => fetch::<Row>(&records, &record_key(table, key))?
                        .into_iter()
                        .collect(),
                    _ => scan(&records, &table_prefix(table))?,
                };
                Ok(rows.into_iter().filter(|r| filter.accepts(&r.key)).collect())
            }

            fn get_commit(&self, table: &str, key: &Key) -> PipelineResult<Option<CommitRecord>> {
                let records = self.txn.open_table(COMMITS).map_err(map_err!(Table))?;
                Ok(fetch(&records, &record_key(table, key))?)
            }

            fn list_commits(&self, table: &str) -> PipelineResult<Vec<CommitRecord>> {
                let records = self.txn.open_table(COMMITS).map_err(map_err!(Table))?;
                Ok(scan(&records, &table_prefix(table))?)
            }

            fn get_job(&self, table: &str, key: &Key) -> PipelineResult<Option<JobRecord>> {
                let records = self.txn.open_table(JOBS).map_err(map_err!(Table))?;
                Ok(fetch(&records, &record_key(table, key))?)
            }

            fn list_jobs(&self, table: Option<&str>) -> PipelineResult<Vec<JobRecord>> {
                let records = self.txn.open_table(JOBS).map_err(map_err!(Table))?;
                let prefix = table.map(table_prefix).unwrap_or_default();
                Ok(scan(&records, &prefix)?)
            }

            fn get_failure(&self, table: &str, key: &Key) -> PipelineResult<Option<FailureRecord>> {
                let records = self.txn.open_table(FAILURES).map_err(map_err!(Table))?;
                Ok(fetch(&records, &record_key(table, key))?)
            }

            fn list_failures(&self, table: Option<&str>) -> PipelineResult<Vec<FailureRecord>> {
                let records = self.txn.open_table(FAILURES).map_err(map_err!(Table))?;
                let prefix = table.map(table_prefix).unwrap_or_default();
                Ok(scan(&records, &prefix)?)
            }
        }
    };
}

impl_storage_view!(StoreView);
impl_storage_view!(StoreTxn);

impl StoreTxn {
    fn put<T: Serialize>(&self, definition: RecordTable, key: &str, record: &T) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Encode))?;
        let mut table = self.txn.open_table(definition).map_err(map_err!(Table))?;
        table
            .insert(key, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn remove(&self, definition: RecordTable, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(definition).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }
}

impl StorageTxn for StoreTxn {
    fn token(&self) -> CommitToken {
        self.token
    }

    fn write_rows(&mut self, table: &str, rows: &[Row]) -> PipelineResult<()> {
        let mut records = self.txn.open_table(ROWS).map_err(map_err!(Table))?;
        for row in rows {
            let value = serde_json::to_vec(row).map_err(map_err!(Encode))?;
            records
                .insert(record_key(table, &row.key).as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        Ok(())
    }

    fn delete_rows(&mut self, table: &str, keys: &[Key]) -> PipelineResult<usize> {
        let mut records = self.txn.open_table(ROWS).map_err(map_err!(Table))?;
        let mut removed = 0;
        for key in keys {
            if records
                .remove(record_key(table, key).as_str())
                .map_err(map_err!(Write))?
                .is_some()
            {
                removed += 1;
            }
        }
        debug!(table, removed, "rows deleted");
        Ok(removed)
    }

    fn put_commit(&mut self, record: &CommitRecord) -> PipelineResult<()> {
        Ok(self.put(COMMITS, &record_key(&record.table, &record.key), record)?)
    }

    fn remove_commit(&mut self, table: &str, key: &Key) -> PipelineResult<bool> {
        Ok(self.remove(COMMITS, &record_key(table, key))?)
    }

    fn put_job(&mut self, record: &JobRecord) -> PipelineResult<()> {
        Ok(self.put(JOBS, &record_key(&record.table, &record.key), record)?)
    }

    fn remove_job(&mut self, table: &str, key: &Key) -> PipelineResult<bool> {
        Ok(self.remove(JOBS, &record_key(table, key))?)
    }

    fn put_failure(&mut self, record: &FailureRecord) -> PipelineResult<()> {
        Ok(self.put(FAILURES, &record_key(&record.table, &record.key), record)?)
    }

    fn remove_failure(&mut self, table: &str, key: &Key) -> PipelineResult<bool> {
        Ok(self.remove(FAILURES, &record_key(table, key))?)
    }

    fn commit(self: Box<Self>) -> PipelineResult<CommitToken> {
        let StoreTxn { txn, token } = *self;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.insert(COMMIT_SEQ, token.0).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%token, "transaction committed");
        Ok(token)
    }

    fn rollback(self: Box<Self>) -> PipelineResult<()> {
        let StoreTxn { txn, token } = *self;
        txn.abort().map_err(map_err!(Transaction))?;
        debug!(%token, "transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuropipe_core::{JobStatus, TableKey, Value};

    fn session(id: i64) -> Row {
        Row::new(Key::new().with("session_id", id)).with("subject", "rat1")
    }

    fn signal(session: i64, filter: &str) -> Row {
        let key = Key::new().with("session_id", session).with("filter_name", filter);
        let mut row = Row::new(key.clone()).with("cutoff_hz", 300.0);
        row.source = Some(key);
        row
    }

    fn commit_record(table: &str, key: Key, token: CommitToken) -> CommitRecord {
        CommitRecord {
            table: table.to_string(),
            rows: vec![key.clone()],
            parents: vec![TableKey::new("Session", key.project(&["session_id"]))],
            key,
            token,
            committed_at: 1000,
        }
    }

    // ── Rows ───────────────────────────────────────────────────────

    #[test]
    fn rows_written_and_read_back() {
        let store = StateStore::open_in_memory().unwrap();
        let mut txn = store.begin().unwrap();
        txn.write_rows("Session", &[session(1), session(2)]).unwrap();
        txn.commit().unwrap();

        let view = store.snapshot().unwrap();
        assert_eq!(view.read_rows("Session", &KeyFilter::All).unwrap().len(), 2);
        let exact = view
            .read_rows("Session", &KeyFilter::Exact(Key::new().with("session_id", 2)))
            .unwrap();
        assert_eq!(exact, vec![session(2)]);
        assert!(view.read_rows("Other", &KeyFilter::All).unwrap().is_empty());
    }

    #[test]
    fn partial_filter_and_table_isolation() {
        let store = StateStore::open_in_memory().unwrap();
        let mut txn = store.begin().unwrap();
        txn.write_rows("FilteredSignal", &[signal(1, "low"), signal(1, "high"), signal(2, "low")])
            .unwrap();
        // A table whose name extends another's must not leak into its scan.
        txn.write_rows("FilteredSignalV2", &[signal(1, "low")]).unwrap();
        txn.commit().unwrap();

        let view = store.snapshot().unwrap();
        let partial = KeyFilter::Partial(Key::new().with("session_id", 1));
        assert_eq!(view.read_rows("FilteredSignal", &partial).unwrap().len(), 2);
        assert_eq!(view.read_rows("FilteredSignal", &KeyFilter::All).unwrap().len(), 3);
        assert!(view.row_exists("FilteredSignal", &signal(2, "low").key).unwrap());
    }

    #[test]
    fn delete_rows_counts_existing() {
        let store = StateStore::open_in_memory().unwrap();
        let mut txn = store.begin().unwrap();
        txn.write_rows("Session", &[session(1)]).unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin().unwrap();
        let removed = txn
            .delete_rows(
                "Session",
                &[Key::new().with("session_id", 1), Key::new().with("session_id", 9)],
            )
            .unwrap();
        assert_eq!(removed, 1);
        txn.commit().unwrap();
        assert!(store.snapshot().unwrap().read_rows("Session", &KeyFilter::All).unwrap().is_empty());
    }

    #[test]
    fn non_finite_attributes_read_back() {
        let store = StateStore::open_in_memory().unwrap();
        let empty_window = Row::new(Key::new().with("session_id", 1))
            .with("rms", f64::NAN)
            .with("peak", f64::NEG_INFINITY);
        let normal = Row::new(Key::new().with("session_id", 2))
            .with("rms", 0.25)
            .with("peak", 3.5);
        let mut txn = store.begin().unwrap();
        txn.write_rows("Stats", &[empty_window.clone()]).unwrap();
        txn.commit().unwrap();
        let mut txn = store.begin().unwrap();
        txn.write_rows("Stats", &[normal.clone()]).unwrap();
        txn.commit().unwrap();

        let rows = store.snapshot().unwrap().read_rows("Stats", &KeyFilter::All).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.contains(&empty_window));
        assert!(rows.contains(&normal));
        let nan_row = rows.iter().find(|r| r.key == empty_window.key).unwrap();
        assert!(nan_row.get("rms").and_then(Value::as_f64).unwrap().is_nan());
    }

    // ── Transactions ───────────────────────────────────────────────

    #[test]
    fn rollback_and_drop_discard_changes() {
        let store = StateStore::open_in_memory().unwrap();
        let mut txn = store.begin().unwrap();
        txn.write_rows("Session", &[session(1)]).unwrap();
        txn.rollback().unwrap();

        {
            let mut txn = store.begin().unwrap();
            txn.write_rows("Session", &[session(2)]).unwrap();
        }

        let view = store.snapshot().unwrap();
        assert!(view.read_rows("Session", &KeyFilter::All).unwrap().is_empty());
    }

    #[test]
    fn writes_are_visible_inside_their_transaction() {
        let store = StateStore::open_in_memory().unwrap();
        let mut txn = store.begin().unwrap();
        txn.write_rows("Session", &[session(1)]).unwrap();
        assert!(txn.row_exists("Session", &session(1).key).unwrap());
        txn.rollback().unwrap();
    }

    #[test]
    fn tokens_increase_per_commit() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.last_token().unwrap(), CommitToken(0));

        let txn = store.begin().unwrap();
        assert_eq!(txn.token(), CommitToken(1));
        assert_eq!(txn.commit().unwrap(), CommitToken(1));

        let txn = store.begin().unwrap();
        txn.rollback().unwrap();

        let txn = store.begin().unwrap();
        assert_eq!(txn.commit().unwrap(), CommitToken(2));
        assert_eq!(store.last_token().unwrap(), CommitToken(2));
    }

    #[test]
    fn snapshot_does_not_see_later_commits() {
        let store = StateStore::open_in_memory().unwrap();
        let view = store.snapshot().unwrap();
        let mut txn = store.begin().unwrap();
        txn.write_rows("Session", &[session(1)]).unwrap();
        txn.commit().unwrap();
        assert!(view.read_rows("Session", &KeyFilter::All).unwrap().is_empty());
    }

    // ── Ledgers ────────────────────────────────────────────────────

    #[test]
    fn commit_records_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        let key = signal(1, "low").key;
        let mut txn = store.begin().unwrap();
        let record = commit_record("FilteredSignal", key.clone(), txn.token());
        txn.put_commit(&record).unwrap();
        txn.commit().unwrap();

        let view = store.snapshot().unwrap();
        assert_eq!(view.get_commit("FilteredSignal", &key).unwrap(), Some(record));
        assert_eq!(view.list_commits("FilteredSignal").unwrap().len(), 1);
        drop(view);

        let mut txn = store.begin().unwrap();
        assert!(txn.remove_commit("FilteredSignal", &key).unwrap());
        assert!(!txn.remove_commit("FilteredSignal", &key).unwrap());
        txn.commit().unwrap();
    }

    #[test]
    fn jobs_and_failures_list_per_table() {
        let store = StateStore::open_in_memory().unwrap();
        let mut txn = store.begin().unwrap();
        for (table, id) in [("A", 1), ("A", 2), ("B", 1)] {
            let key = Key::new().with("id", id);
            txn.put_job(&JobRecord {
                table: table.to_string(),
                key: key.clone(),
                status: JobStatus::Reserved,
                owner: format!("w#{id}"),
                host: "localhost".to_string(),
                pid: 1,
                reserved_at: 0,
                parents: Vec::new(),
            })
            .unwrap();
            txn.put_failure(&FailureRecord {
                table: table.to_string(),
                key,
                reason: "boom".to_string(),
                attempts: 1,
                failed_at: 0,
            })
            .unwrap();
        }
        txn.commit().unwrap();

        let view = store.snapshot().unwrap();
        assert_eq!(view.list_jobs(Some("A")).unwrap().len(), 2);
        assert_eq!(view.list_jobs(None).unwrap().len(), 3);
        assert_eq!(view.list_failures(Some("B")).unwrap().len(), 1);
        assert_eq!(view.list_failures(None).unwrap().len(), 3);
        drop(view);

        let mut txn = store.begin().unwrap();
        assert!(txn.remove_job("A", &Key::new().with("id", 1)).unwrap());
        assert!(txn.remove_failure("B", &Key::new().with("id", 1)).unwrap());
        txn.commit().unwrap();
        let view = store.snapshot().unwrap();
        assert_eq!(view.list_jobs(None).unwrap().len(), 2);
        assert!(view.get_failure("B", &Key::new().with("id", 1)).unwrap().is_none());
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.redb");

        {
            let store = StateStore::open(&path).unwrap();
            let mut txn = store.begin().unwrap();
            txn.write_rows("Session", &[session(7)]).unwrap();
            txn.commit().unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let rows = store.snapshot().unwrap().read_rows("Session", &KeyFilter::All).unwrap();
        assert_eq!(rows, vec![session(7)]);
        assert_eq!(store.last_token().unwrap(), CommitToken(1));
    }
}
