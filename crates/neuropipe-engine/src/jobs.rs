//! Job ledger: reservations, ignored keys and failure records.

use neuropipe_core::{FailureRecord, JobRecord, JobStatus, Key, PipelineError, StorageView};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::pipeline::{Pipeline, host_name, now_ms};

pub struct JobLedger {
    pipeline: Pipeline,
}

impl JobLedger {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub fn jobs(&self, table: Option<&str>) -> EngineResult<Vec<JobRecord>> {
        if let Some(table) = table {
            self.pipeline.registry().resolve(table)?;
        }
        let view = self.pipeline.storage().snapshot()?;
        Ok(view.list_jobs(table)?)
    }

    pub fn failures(&self, table: Option<&str>) -> EngineResult<Vec<FailureRecord>> {
        if let Some(table) = table {
            self.pipeline.registry().resolve(table)?;
        }
        let view = self.pipeline.storage().snapshot()?;
        Ok(view.list_failures(table)?)
    }

    /// Exclude a candidate key from population until its job is cleared.
    pub fn ignore(&self, table: &str, key: &Key) -> EngineResult<JobRecord> {
        let registry = self.pipeline.registry();
        let descriptor = registry.resolve(table)?;
        if !descriptor.kind.is_populated() {
            return Err(PipelineError::schema(
                table,
                format!("{} tables have no jobs", descriptor.kind.label()),
            )
            .into());
        }
        let attributes = registry.candidate_attributes(table)?;
        if !key.has_schema(&attributes) {
            return Err(PipelineError::InvalidKey(format!(
                "{key} is not a candidate key of {table} (expected [{}])",
                attributes.join(", ")
            ))
            .into());
        }

        let now = now_ms();
        let mut txn = self.pipeline.storage().begin()?;
        if let Some(job) = txn.get_job(table, key)? {
            if job.is_live(now, self.pipeline.settings().liveness) {
                txn.rollback()?;
                return Err(EngineError::Reserved {
                    table: table.to_string(),
                    key: key.clone(),
                    owner: job.owner,
                });
            }
        }
        let record = JobRecord {
            table: table.to_string(),
            key: key.clone(),
            status: JobStatus::Ignored,
            owner: self.pipeline.worker_id().to_string(),
            host: host_name(),
            pid: std::process::id(),
            reserved_at: now,
            parents: Vec::new(),
        };
        txn.put_job(&record)?;
        txn.commit()?;
        info!(table, %key, "key ignored");
        Ok(record)
    }

    /// Remove a job record of either status. Returns whether one existed.
    pub fn clear_job(&self, table: &str, key: &Key) -> EngineResult<bool> {
        self.pipeline.registry().resolve(table)?;
        let mut txn = self.pipeline.storage().begin()?;
        let existed = txn.remove_job(table, key)?;
        txn.commit()?;
        Ok(existed)
    }

    /// Turn reserved jobs older than the liveness window into failure
    /// records, making their keys eligible again.
    pub fn recover_stale_jobs(&self, now_ms: u64) -> EngineResult<Vec<FailureRecord>> {
        let liveness = self.pipeline.settings().liveness;
        let mut txn = self.pipeline.storage().begin()?;
        let mut recovered = Vec::new();
        for job in txn.list_jobs(None)? {
            if !job.is_stale(now_ms, liveness) {
                continue;
            }
            let attempts = txn
                .get_failure(&job.table, &job.key)?
                .map_or(0, |f| f.attempts)
                + 1;
            let record = FailureRecord {
                table: job.table.clone(),
                key: job.key.clone(),
                reason: format!("abandoned by worker {} on {} (pid {})", job.owner, job.host, job.pid),
                attempts,
                failed_at: now_ms,
            };
            txn.put_failure(&record)?;
            txn.remove_job(&job.table, &job.key)?;
            warn!(table = %job.table, key = %job.key, owner = %job.owner, "stale job recovered");
            recovered.push(record);
        }
        txn.commit()?;
        Ok(recovered)
    }

    /// Drop failure records of one table, or all. Returns how many.
    pub fn clear_failures(&self, table: Option<&str>) -> EngineResult<usize> {
        if let Some(table) = table {
            self.pipeline.registry().resolve(table)?;
        }
        let mut txn = self.pipeline.storage().begin()?;
        let failures = txn.list_failures(table)?;
        for failure in &failures {
            txn.remove_failure(&failure.table, &failure.key)?;
        }
        txn.commit()?;
        Ok(failures.len())
    }
}
