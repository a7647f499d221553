//! Shared fixtures: the Session / FilterParams / FilteredSignal pipeline on
//! an in-memory store.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use neuropipe_core::*;
use neuropipe_engine::*;
use neuropipe_state::StateStore;

pub fn session(id: i64) -> Key {
    Key::new().with("session_id", id)
}

pub fn signal(id: i64, filter: &str) -> Key {
    session(id).with("filter_name", filter)
}

pub fn scenario_tables() -> Vec<TableDescriptor> {
    vec![
        TableDescriptor::manual("Session", &["session_id"]).with_attributes(&["subject"]),
        TableDescriptor::lookup("FilterParams", &["filter_name"]).with_attributes(&["cutoff_hz"]),
        TableDescriptor::computed(
            "FilteredSignal",
            &["session_id", "filter_name"],
            &["Session", "FilterParams"],
            "passthrough",
        )
        .with_attributes(&["cutoff_hz"]),
    ]
}

/// Scenario tables plus a fan-out table of sorted units per filtered signal.
pub fn sorting_tables() -> Vec<TableDescriptor> {
    let mut tables = scenario_tables();
    tables.push(
        TableDescriptor::computed(
            "Units",
            &["session_id", "filter_name", "unit_id"],
            &["FilteredSignal"],
            "split",
        )
        .with_param("fan_out", 2),
    );
    tables
}

pub fn pipeline_on(
    storage: Arc<dyn Storage>,
    tables: Vec<TableDescriptor>,
    catalog: ComputeCatalog,
) -> Pipeline {
    let registry = Registry::from_descriptors(tables).unwrap();
    Pipeline::new(registry, storage, catalog).unwrap()
}

pub fn pipeline(tables: Vec<TableDescriptor>, catalog: ComputeCatalog) -> Pipeline {
    pipeline_on(Arc::new(StateStore::open_in_memory().unwrap()), tables, catalog)
}

pub fn scenario() -> Pipeline {
    pipeline(scenario_tables(), ComputeCatalog::with_builtins())
}

/// Insert sessions and the `low` / `high` filter parameter sets.
pub fn seed(pipeline: &Pipeline, sessions: &[i64]) {
    let ingestor = pipeline.ingestor();
    let rows = sessions
        .iter()
        .map(|&id| Row::new(session(id)).with("subject", format!("rat{id}")))
        .collect();
    ingestor.insert_rows("Session", rows, true).unwrap();
    let filters = vec![
        Row::new(Key::new().with("filter_name", "low")).with("cutoff_hz", 300),
        Row::new(Key::new().with("filter_name", "high")).with("cutoff_hz", 6000),
    ];
    ingestor.insert_rows("FilterParams", filters, true).unwrap();
}

pub fn rows(pipeline: &Pipeline, table: &str) -> Vec<Row> {
    pipeline
        .storage()
        .snapshot()
        .unwrap()
        .read_rows(table, &KeyFilter::All)
        .unwrap()
}

pub fn count(pipeline: &Pipeline, table: &str) -> usize {
    rows(pipeline, table).len()
}

/// Put a reserved job record straight into the store.
pub fn plant_job(pipeline: &Pipeline, table: &str, key: Key, parents: Vec<TableKey>, reserved_at: u64) {
    let mut txn = pipeline.storage().begin().unwrap();
    txn.put_job(&JobRecord {
        table: table.to_string(),
        key,
        status: JobStatus::Reserved,
        owner: "other-host:1#1".to_string(),
        host: "other-host".to_string(),
        pid: 1,
        reserved_at,
        parents,
    })
    .unwrap();
    txn.commit().unwrap();
}

/// Store wrapper that records the table of every `delete_rows` call and
/// can be told to fail `write_rows` for one table.
pub struct RecordingStore {
    inner: StateStore,
    pub deletes: Arc<Mutex<Vec<String>>>,
    pub fail_writes: Arc<Mutex<Option<String>>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: StateStore::open_in_memory().unwrap(),
            deletes: Arc::new(Mutex::new(Vec::new())),
            fail_writes: Arc::new(Mutex::new(None)),
        }
    }
}

impl Storage for RecordingStore {
    fn snapshot(&self) -> PipelineResult<Box<dyn StorageView + '_>> {
        self.inner.snapshot()
    }

    fn begin(&self) -> PipelineResult<Box<dyn StorageTxn + '_>> {
        Ok(Box::new(RecordingTxn {
            inner: self.inner.begin()?,
            deletes: self.deletes.clone(),
            fail_writes: self.fail_writes.clone(),
        }))
    }
}

struct RecordingTxn<'a> {
    inner: Box<dyn StorageTxn + 'a>,
    deletes: Arc<Mutex<Vec<String>>>,
    fail_writes: Arc<Mutex<Option<String>>>,
}

impl StorageView for RecordingTxn<'_> {
    fn read_rows(&self, table: &str, filter: &KeyFilter) -> PipelineResult<Vec<Row>> {
        self.inner.read_rows(table, filter)
    }

    fn get_commit(&self, table: &str, key: &Key) -> PipelineResult<Option<CommitRecord>> {
        self.inner.get_commit(table, key)
    }

    fn list_commits(&self, table: &str) -> PipelineResult<Vec<CommitRecord>> {
        self.inner.list_commits(table)
    }

    fn get_job(&self, table: &str, key: &Key) -> PipelineResult<Option<JobRecord>> {
        self.inner.get_job(table, key)
    }

    fn list_jobs(&self, table: Option<&str>) -> PipelineResult<Vec<JobRecord>> {
        self.inner.list_jobs(table)
    }

    fn get_failure(&self, table: &str, key: &Key) -> PipelineResult<Option<FailureRecord>> {
        self.inner.get_failure(table, key)
    }

    fn list_failures(&self, table: Option<&str>) -> PipelineResult<Vec<FailureRecord>> {
        self.inner.list_failures(table)
    }
}

impl StorageTxn for RecordingTxn<'_> {
    fn token(&self) -> CommitToken {
        self.inner.token()
    }

    fn write_rows(&mut self, table: &str, rows: &[Row]) -> PipelineResult<()> {
        if self.fail_writes.lock().unwrap().as_deref() == Some(table) {
            return Err(PipelineError::Storage(format!("disk full writing {table}")));
        }
        self.inner.write_rows(table, rows)
    }

    fn delete_rows(&mut self, table: &str, keys: &[Key]) -> PipelineResult<usize> {
        self.deletes.lock().unwrap().push(table.to_string());
        self.inner.delete_rows(table, keys)
    }

    fn put_commit(&mut self, record: &CommitRecord) -> PipelineResult<()> {
        self.inner.put_commit(record)
    }

    fn remove_commit(&mut self, table: &str, key: &Key) -> PipelineResult<bool> {
        self.inner.remove_commit(table, key)
    }

    fn put_job(&mut self, record: &JobRecord) -> PipelineResult<()> {
        self.inner.put_job(record)
    }

    fn remove_job(&mut self, table: &str, key: &Key) -> PipelineResult<bool> {
        self.inner.remove_job(table, key)
    }

    fn put_failure(&mut self, record: &FailureRecord) -> PipelineResult<()> {
        self.inner.put_failure(record)
    }

    fn remove_failure(&mut self, table: &str, key: &Key) -> PipelineResult<bool> {
        self.inner.remove_failure(table, key)
    }

    fn commit(self: Box<Self>) -> PipelineResult<CommitToken> {
        self.inner.commit()
    }

    fn rollback(self: Box<Self>) -> PipelineResult<()> {
        self.inner.rollback()
    }
}
