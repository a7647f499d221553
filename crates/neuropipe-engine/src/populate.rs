//! Populator: computes the missing candidate keys of a table.
//!
//! Each key runs through reserve → compute → commit on the blocking pool,
//! bounded by a semaphore of `workers` permits. A key's rows, its commit
//! record and the release of its job are written in one transaction, so a
//! failing key leaves nothing behind but a failure record.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use neuropipe_core::{
    CommitRecord, FailureRecord, JobRecord, JobStatus, Key, KeyFilter, PipelineError,
    PipelineResult, Restriction, Row, StorageTxn, StorageView, TableDescriptor, TableKind,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::candidates::{Candidate, candidate_keys};
use crate::catalog::{ComputeFn, ComputeInput};
use crate::error::{EngineError, EngineResult};
use crate::merge::merge_row;
use crate::pipeline::{Pipeline, host_name, now_ms};

/// Order in which missing keys are attempted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulateOrder {
    /// Sorted by candidate key.
    #[default]
    Original,
    Reverse,
    Random,
}

impl PopulateOrder {
    fn arrange<T>(self, items: &mut [T]) {
        match self {
            PopulateOrder::Original => {}
            PopulateOrder::Reverse => items.reverse(),
            PopulateOrder::Random => shuffle(items, now_ms() ^ u64::from(std::process::id())),
        }
    }
}

impl FromStr for PopulateOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "original" => Ok(PopulateOrder::Original),
            "reverse" => Ok(PopulateOrder::Reverse),
            "random" => Ok(PopulateOrder::Random),
            other => Err(format!("unknown populate order {other:?} (original, reverse, random)")),
        }
    }
}

/// xorshift Fisher-Yates; the order only has to spread workers apart.
fn shuffle<T>(items: &mut [T], seed: u64) {
    let mut state = seed | 1;
    for i in (1..items.len()).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let j = (state % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

#[derive(Debug, Clone, Default)]
pub struct PopulateOptions {
    /// Only candidate keys matching this predicate are considered.
    pub restriction: Option<Restriction>,
    /// Overrides the pipeline's `reserve_jobs` setting.
    pub reserve_jobs: Option<bool>,
    /// Attempt at most this many keys.
    pub max_calls: Option<usize>,
    pub order: PopulateOrder,
    /// Overrides the pipeline's worker count.
    pub workers: Option<usize>,
}

impl PopulateOptions {
    pub fn restricted(restriction: Restriction) -> Self {
        Self {
            restriction: Some(restriction),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyFailure {
    pub key: Key,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PopulateReport {
    pub table: String,
    pub candidates: usize,
    pub succeeded: usize,
    pub already_present: usize,
    pub failed: usize,
    /// Keys reserved by another live worker.
    pub in_progress: usize,
    pub ignored: usize,
    /// Keys left unattempted because of cancellation.
    pub cancelled: usize,
    /// Pending keys beyond `max_calls`, left for a later pass.
    pub deferred: usize,
    pub failures: Vec<KeyFailure>,
}

impl PopulateReport {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    /// Every candidate key is committed, ignored, or left to a live worker.
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.cancelled == 0 && self.deferred == 0
    }

    fn record(&mut self, key: Key, outcome: Outcome) {
        match outcome {
            Outcome::Committed => self.succeeded += 1,
            Outcome::AlreadyPresent => self.already_present += 1,
            Outcome::InProgress => self.in_progress += 1,
            Outcome::Ignored => self.ignored += 1,
            Outcome::Failed(reason) => {
                self.failed += 1;
                self.failures.push(KeyFailure { key, reason });
            }
        }
    }
}

impl fmt::Display for PopulateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} candidates, {} succeeded, {} already present, {} failed, {} in progress, {} ignored",
            self.table,
            self.candidates,
            self.succeeded,
            self.already_present,
            self.failed,
            self.in_progress,
            self.ignored
        )?;
        if self.cancelled > 0 {
            write!(f, ", {} cancelled", self.cancelled)?;
        }
        if self.deferred > 0 {
            write!(f, ", {} deferred", self.deferred)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Outcome {
    Committed,
    AlreadyPresent,
    InProgress,
    Ignored,
    Failed(String),
}

/// Computes missing keys, table by table.
pub struct Populator {
    pipeline: Pipeline,
    cancel: Option<watch::Receiver<bool>>,
}

impl Populator {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            cancel: None,
        }
    }

    /// Stop starting new keys once the signal turns `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    pub fn candidate_keys(
        &self,
        table: &str,
        restriction: Option<&Restriction>,
    ) -> EngineResult<Vec<Candidate>> {
        let view = self.pipeline.storage().snapshot()?;
        Ok(candidate_keys(self.pipeline.registry(), &*view, table, restriction)?)
    }

    /// Candidates with no commit record and no live or ignored job.
    pub fn missing_keys(
        &self,
        table: &str,
        restriction: Option<&Restriction>,
    ) -> EngineResult<Vec<Candidate>> {
        let mut scratch = PopulateReport::new(table);
        self.pending(table, restriction, &mut scratch)
    }

    fn pending(
        &self,
        table: &str,
        restriction: Option<&Restriction>,
        report: &mut PopulateReport,
    ) -> EngineResult<Vec<Candidate>> {
        let view = self.pipeline.storage().snapshot()?;
        let candidates = candidate_keys(self.pipeline.registry(), &*view, table, restriction)?;
        let committed: HashSet<Key> = view.list_commits(table)?.into_iter().map(|c| c.key).collect();
        let jobs: HashMap<Key, JobRecord> = view
            .list_jobs(Some(table))?
            .into_iter()
            .map(|j| (j.key.clone(), j))
            .collect();

        let now = now_ms();
        let liveness = self.pipeline.settings().liveness;
        report.candidates = candidates.len();
        let mut pending = Vec::new();
        for candidate in candidates {
            if committed.contains(&candidate.key) {
                report.already_present += 1;
                continue;
            }
            match jobs.get(&candidate.key) {
                Some(job) if job.status == JobStatus::Ignored => report.ignored += 1,
                Some(job) if job.is_live(now, liveness) => report.in_progress += 1,
                _ => pending.push(candidate),
            }
        }
        Ok(pending)
    }

    /// Compute every missing key of `table`.
    ///
    /// Per-key failures are reported, not returned; only structural
    /// problems (unknown table, bad restriction, storage errors) are errors.
    /// Keys that committed before a storage error stay committed, and the
    /// failing key's reservation is released.
    pub async fn populate(&self, table: &str, options: &PopulateOptions) -> EngineResult<PopulateReport> {
        let descriptor = self.pipeline.registry().resolve(table)?.clone();
        let compute = match &descriptor.compute {
            Some(name) => Some(self.pipeline.catalog().get(name).ok_or_else(|| {
                EngineError::ComputeNotFound {
                    table: table.to_string(),
                    compute: name.clone(),
                }
            })?),
            None => None,
        };
        let settings = self.pipeline.settings();
        let reserve = options.reserve_jobs.unwrap_or(settings.reserve_jobs);
        let workers = options.workers.unwrap_or(settings.workers).max(1);

        let mut report = PopulateReport::new(table);
        let mut pending = self.pending(table, options.restriction.as_ref(), &mut report)?;
        options.order.arrange(&mut pending);
        if let Some(max) = options.max_calls {
            report.deferred = pending.len().saturating_sub(max);
            pending.truncate(max);
        }
        debug!(table, pending = pending.len(), workers, reserve, "populate started");

        let worker = Arc::new(KeyWorker {
            pipeline: self.pipeline.clone(),
            table: descriptor,
            compute,
            reserve,
        });
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        let total = pending.len();
        for (started, candidate) in pending.into_iter().enumerate() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| EngineError::Task(e.to_string()))?;
            if self.is_cancelled() {
                report.cancelled = total - started;
                info!(table, remaining = report.cancelled, "populate cancelled");
                break;
            }
            let worker = worker.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let outcome = worker.run(&candidate);
                (candidate.key, outcome)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok(outcome))) => report.record(key, outcome),
                Ok((key, Err(e))) => {
                    error!(table, %key, error = %e, "key aborted by storage error");
                    first_error.get_or_insert(EngineError::from(e));
                }
                Err(e) => {
                    error!(table, error = %e, "populate worker panicked");
                    first_error.get_or_insert(EngineError::Task(e.to_string()));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            table,
            candidates = report.candidates,
            succeeded = report.succeeded,
            already_present = report.already_present,
            failed = report.failed,
            in_progress = report.in_progress,
            ignored = report.ignored,
            deferred = report.deferred,
            "populate finished"
        );
        Ok(report)
    }

    /// Populate `root` and everything downstream of it, or the whole
    /// pipeline, in topological order.
    ///
    /// A restriction applies to the tables whose candidate key carries every
    /// restricted attribute; the other tables are skipped.
    pub async fn populate_downstream(
        &self,
        root: Option<&str>,
        options: &PopulateOptions,
    ) -> EngineResult<Vec<PopulateReport>> {
        let registry = self.pipeline.registry();
        let graph = registry.graph()?;
        let tables: Vec<String> = match root {
            Some(root) => {
                registry.resolve(root)?;
                std::iter::once(root)
                    .chain(graph.descendants(root)?)
                    .map(String::from)
                    .collect()
            }
            None => graph.order().into_iter().map(String::from).collect(),
        };

        let mut reports = Vec::new();
        for table in tables {
            if !registry.resolve(&table)?.kind.is_populated() {
                continue;
            }
            if let Some(restriction) = &options.restriction {
                let attributes = registry.candidate_attributes(&table)?;
                if restriction.check_attributes(&table, &attributes).is_err() {
                    debug!(%table, %restriction, "restriction does not apply, skipping table");
                    continue;
                }
            }
            if self.is_cancelled() {
                break;
            }
            reports.push(self.populate(&table, options).await?);
        }
        Ok(reports)
    }
}

enum Reservation {
    Taken(String),
    Skip(Outcome),
}

/// Per-table state shared by the blocking tasks of one populate call.
struct KeyWorker {
    pipeline: Pipeline,
    table: TableDescriptor,
    compute: Option<ComputeFn>,
    reserve: bool,
}

impl KeyWorker {
    fn run(&self, candidate: &Candidate) -> PipelineResult<Outcome> {
        let owner = if self.reserve {
            match self.reserve(candidate)? {
                Reservation::Taken(owner) => Some(owner),
                Reservation::Skip(outcome) => return Ok(outcome),
            }
        } else {
            let view = self.pipeline.storage().snapshot()?;
            if view.get_commit(&self.table.name, &candidate.key)?.is_some() {
                return Ok(Outcome::AlreadyPresent);
            }
            None
        };

        let result = match self.compute(candidate) {
            Ok(Ok(rows)) => self.commit(candidate, owner.as_deref(), rows),
            Ok(Err(reason)) => self.fail(candidate, owner.as_deref(), reason),
            Err(e) => Err(e),
        };
        if let (Err(cause), Some(owner)) = (&result, owner.as_deref()) {
            self.abandon(candidate, owner, cause);
        }
        result
    }

    /// Drop our reservation after a storage error so the key is retried on
    /// the next pass. If even that fails the job is left for
    /// `recover_stale_jobs`.
    fn abandon(&self, candidate: &Candidate, owner: &str, cause: &PipelineError) {
        let released = self.pipeline.storage().begin().and_then(|mut txn| {
            self.release(&mut *txn, candidate, Some(owner))?;
            txn.commit().map(|_| ())
        });
        if let Err(e) = released {
            warn!(
                table = %self.table.name,
                key = %candidate.key,
                %cause,
                error = %e,
                "cannot release job, left for stale recovery"
            );
        }
    }

    fn reserve(&self, candidate: &Candidate) -> PipelineResult<Reservation> {
        let table = &self.table.name;
        let mut txn = self.pipeline.storage().begin()?;
        if txn.get_commit(table, &candidate.key)?.is_some() {
            txn.rollback()?;
            return Ok(Reservation::Skip(Outcome::AlreadyPresent));
        }
        let now = now_ms();
        if let Some(job) = txn.get_job(table, &candidate.key)? {
            if job.status == JobStatus::Ignored {
                txn.rollback()?;
                return Ok(Reservation::Skip(Outcome::Ignored));
            }
            if job.is_live(now, self.pipeline.settings().liveness) {
                txn.rollback()?;
                return Ok(Reservation::Skip(Outcome::InProgress));
            }
            warn!(table = %table, key = %candidate.key, previous_owner = %job.owner, "taking over stale job");
        }
        let owner = self.pipeline.next_owner();
        txn.put_job(&JobRecord {
            table: table.clone(),
            key: candidate.key.clone(),
            status: JobStatus::Reserved,
            owner: owner.clone(),
            host: host_name(),
            pid: std::process::id(),
            reserved_at: now,
            parents: candidate.parents.clone(),
        })?;
        txn.commit()?;
        debug!(table = %table, key = %candidate.key, %owner, "job reserved");
        Ok(Reservation::Taken(owner))
    }

    /// Read the parent rows, run the compute function and validate its
    /// output. The inner `Err` is a per-key failure reason.
    fn compute(&self, candidate: &Candidate) -> PipelineResult<Result<Vec<Row>, String>> {
        let mut upstream: BTreeMap<String, Vec<Row>> = BTreeMap::new();
        {
            let view = self.pipeline.storage().snapshot()?;
            for parent in &candidate.parents {
                let rows = view.read_rows(&parent.table, &KeyFilter::Exact(parent.key.clone()))?;
                if rows.is_empty() {
                    return Ok(Err(format!("upstream row {parent} no longer exists")));
                }
                upstream.entry(parent.table.clone()).or_default().extend(rows);
            }
        }

        let rows = if self.table.kind == TableKind::Merge {
            match candidate.parents.first() {
                Some(source) => vec![merge_row(&candidate.key, source)],
                None => return Ok(Err("merge key has no source row".to_string())),
            }
        } else {
            let Some(compute) = &self.compute else {
                return Err(PipelineError::schema(&self.table.name, "no compute function"));
            };
            let input = ComputeInput {
                table: self.table.name.clone(),
                key: candidate.key.clone(),
                upstream,
                parameters: self.table.params.clone(),
                primary_key: self.table.primary_key.clone(),
                attributes: self.table.attributes.clone(),
            };
            match panic::catch_unwind(AssertUnwindSafe(|| compute(&input))) {
                Ok(Ok(rows)) => rows,
                Ok(Err(e)) => return Ok(Err(e.to_string())),
                Err(payload) => {
                    return Ok(Err(format!("compute function panicked: {}", panic_message(&*payload))));
                }
            }
        };
        Ok(self.validate(candidate, rows))
    }

    /// Rows must fit the schema, extend the candidate key and be unique.
    fn validate(&self, candidate: &Candidate, mut rows: Vec<Row>) -> Result<Vec<Row>, String> {
        let mut seen = HashSet::new();
        for row in &mut rows {
            self.table.check_row(row).map_err(|e| e.to_string())?;
            if !row.key.matches(&candidate.key) {
                return Err(format!(
                    "row key {} does not extend candidate key {}",
                    row.key, candidate.key
                ));
            }
            if !seen.insert(row.key.clone()) {
                return Err(format!("row key {} returned twice", row.key));
            }
            row.source = Some(candidate.key.clone());
        }
        Ok(rows)
    }

    fn commit(&self, candidate: &Candidate, owner: Option<&str>, rows: Vec<Row>) -> PipelineResult<Outcome> {
        let table = &self.table.name;
        let mut txn = self.pipeline.storage().begin()?;
        if txn.get_commit(table, &candidate.key)?.is_some() {
            self.release(&mut *txn, candidate, owner)?;
            txn.commit()?;
            return Ok(Outcome::AlreadyPresent);
        }
        for parent in &candidate.parents {
            if !txn.row_exists(&parent.table, &parent.key)? {
                let reason = format!("upstream row {parent} vanished before commit");
                self.record_failure(&mut *txn, candidate, owner, &reason)?;
                txn.commit()?;
                warn!(table = %table, key = %candidate.key, %reason, "key failed");
                return Ok(Outcome::Failed(reason));
            }
        }

        let token = txn.token();
        txn.write_rows(table, &rows)?;
        txn.put_commit(&CommitRecord {
            table: table.clone(),
            key: candidate.key.clone(),
            rows: rows.iter().map(|r| r.key.clone()).collect(),
            parents: candidate.parents.clone(),
            token,
            committed_at: now_ms(),
        })?;
        self.release(&mut *txn, candidate, owner)?;
        txn.remove_failure(table, &candidate.key)?;
        txn.commit()?;
        debug!(table = %table, key = %candidate.key, rows = rows.len(), %token, "key committed");
        Ok(Outcome::Committed)
    }

    fn fail(&self, candidate: &Candidate, owner: Option<&str>, reason: String) -> PipelineResult<Outcome> {
        let mut txn = self.pipeline.storage().begin()?;
        self.record_failure(&mut *txn, candidate, owner, &reason)?;
        txn.commit()?;
        warn!(table = %self.table.name, key = %candidate.key, %reason, "key failed");
        Ok(Outcome::Failed(reason))
    }

    fn record_failure<T: StorageTxn + ?Sized>(
        &self,
        txn: &mut T,
        candidate: &Candidate,
        owner: Option<&str>,
        reason: &str,
    ) -> PipelineResult<()> {
        let table = &self.table.name;
        let attempts = txn
            .get_failure(table, &candidate.key)?
            .map_or(0, |f| f.attempts)
            + 1;
        txn.put_failure(&FailureRecord {
            table: table.clone(),
            key: candidate.key.clone(),
            reason: reason.to_string(),
            attempts,
            failed_at: now_ms(),
        })?;
        self.release(txn, candidate, owner)
    }

    /// Drop our job record, unless another worker has taken it over.
    fn release<T: StorageTxn + ?Sized>(
        &self,
        txn: &mut T,
        candidate: &Candidate,
        owner: Option<&str>,
    ) -> PipelineResult<()> {
        let Some(owner) = owner else {
            return Ok(());
        };
        let table = &self.table.name;
        match txn.get_job(table, &candidate.key)? {
            Some(job) if job.owner == owner => {
                txn.remove_job(table, &candidate.key)?;
            }
            Some(job) => {
                warn!(table = %table, key = %candidate.key, taken_by = %job.owner, "job was taken over");
            }
            None => {}
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
