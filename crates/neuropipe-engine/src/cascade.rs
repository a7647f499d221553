//! Cascade delete: remove rows together with everything derived from them.
//!
//! The plan walks descendants in topological order, collecting rows whose
//! lineage touches an already affected row. Populated tables are matched
//! through commit parents and removed as whole row-sets; ingested tables
//! are matched by projecting their key onto each upstream primary key.
//! Execution replays the plan deepest table first inside one transaction.

use std::collections::HashSet;
use std::time::Duration;

use neuropipe_core::{
    Key, KeyFilter, PipelineError, PipelineResult, Registry, Restriction, StorageView, TableKey,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::EngineResult;
use crate::pipeline::{Pipeline, now_ms};

/// Rows (and the commit records owning them) removed from one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteStep {
    pub table: String,
    pub rows: Vec<Key>,
    /// Candidate keys whose commit records go with the rows.
    pub commits: Vec<Key>,
}

impl DeleteStep {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.commits.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletePlan {
    pub table: String,
    pub key: Key,
    /// In deletion order: deepest descendant first, the root table last.
    pub steps: Vec<DeleteStep>,
    /// Live jobs that block execution.
    pub conflicts: Vec<TableKey>,
    pub dry_run: bool,
}

impl DeletePlan {
    pub fn total_rows(&self) -> usize {
        self.steps.iter().map(|s| s.rows.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

pub struct CascadeDeleter {
    pipeline: Pipeline,
}

impl CascadeDeleter {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Delete the rows of `table` matching `key` (all of its attributes or a
    /// subset) and every row derived from them.
    ///
    /// A dry run returns the plan, conflicts included, without touching the
    /// store. Otherwise a live job on an affected key, or one reading an
    /// affected row, fails the whole delete with `DeleteConflict`.
    pub fn delete(&self, table: &str, key: &Key, dry_run: bool) -> EngineResult<DeletePlan> {
        let registry = self.pipeline.registry();
        let liveness = self.pipeline.settings().liveness;

        if dry_run {
            let view = self.pipeline.storage().snapshot()?;
            let mut plan = plan(registry, &*view, table, key, liveness, now_ms())?;
            plan.dry_run = true;
            info!(table, %key, rows = plan.total_rows(), tables = plan.steps.len(), "cascade delete planned");
            return Ok(plan);
        }

        let mut txn = self.pipeline.storage().begin()?;
        let plan = plan(registry, &*txn, table, key, liveness, now_ms())?;
        if let Some(conflict) = plan.conflicts.first() {
            txn.rollback()?;
            warn!(table, %key, blocking = %conflict, "cascade delete blocked by running job");
            return Err(PipelineError::DeleteConflict {
                table: conflict.table.clone(),
                key: conflict.key.clone(),
            }
            .into());
        }
        for step in &plan.steps {
            txn.delete_rows(&step.table, &step.rows)?;
            for commit in &step.commits {
                txn.remove_commit(&step.table, commit)?;
                txn.remove_failure(&step.table, commit)?;
            }
        }
        txn.commit()?;
        info!(table, %key, rows = plan.total_rows(), tables = plan.steps.len(), "cascade delete committed");
        Ok(plan)
    }
}

/// Build the delete plan against any consistent view.
pub(crate) fn plan<V: StorageView + ?Sized>(
    registry: &Registry,
    view: &V,
    table: &str,
    key: &Key,
    liveness: Duration,
    now_ms: u64,
) -> PipelineResult<DeletePlan> {
    let descriptor = registry.resolve(table)?;
    if key.is_empty() {
        return Err(PipelineError::InvalidKey(format!(
            "refusing to delete all of {table} with an empty key"
        )));
    }
    Restriction::from(key).check_attributes(table, &descriptor.primary_key)?;

    let mut root = DeleteStep::new(table);
    let mut affected_commits: HashSet<TableKey> = HashSet::new();
    let matched = view.read_rows(table, &KeyFilter::Partial(key.clone()))?;
    if descriptor.kind.is_populated() {
        // Whole row-sets: a fan-out row drags its siblings along.
        let mut rows: HashSet<Key> = HashSet::new();
        for row in matched {
            let source = row.source.clone().unwrap_or_else(|| row.key.clone());
            match view.get_commit(table, &source)? {
                Some(commit) => {
                    if affected_commits.insert(TableKey::new(table, commit.key.clone())) {
                        root.commits.push(commit.key);
                        rows.extend(commit.rows);
                    }
                }
                None => {
                    rows.insert(row.key);
                }
            }
        }
        root.rows = rows.into_iter().collect();
        root.rows.sort();
    } else {
        root.rows = matched.into_iter().map(|r| r.key).collect();
    }

    let mut affected: HashSet<TableKey> = root
        .rows
        .iter()
        .map(|k| TableKey::new(table, k.clone()))
        .collect();

    let mut descendants = Vec::new();
    if !affected.is_empty() {
        for child in registry.graph()?.descendants(table)? {
            let step = dependents_in(registry, view, child, &affected)?;
            if step.is_empty() {
                continue;
            }
            affected.extend(step.rows.iter().map(|k| TableKey::new(child, k.clone())));
            affected_commits.extend(step.commits.iter().map(|k| TableKey::new(child, k.clone())));
            descendants.push(step);
        }
    }

    let mut conflicts = Vec::new();
    for job in view.list_jobs(None)? {
        if !job.is_live(now_ms, liveness) {
            continue;
        }
        let address = TableKey::new(job.table.as_str(), job.key.clone());
        if affected_commits.contains(&address)
            || affected.contains(&address)
            || job.parents.iter().any(|p| affected.contains(p))
        {
            conflicts.push(address);
        }
    }

    let mut steps: Vec<DeleteStep> = descendants.into_iter().rev().collect();
    if !root.is_empty() {
        steps.push(root);
    }
    Ok(DeletePlan {
        table: table.to_string(),
        key: key.clone(),
        steps,
        conflicts,
        dry_run: false,
    })
}

/// Rows of `table` whose lineage includes a row in `affected`.
pub(crate) fn dependents_in<V: StorageView + ?Sized>(
    registry: &Registry,
    view: &V,
    table: &str,
    affected: &HashSet<TableKey>,
) -> PipelineResult<DeleteStep> {
    let descriptor = registry.resolve(table)?;
    let mut step = DeleteStep::new(table);
    if descriptor.kind.is_populated() {
        for commit in view.list_commits(table)? {
            if commit.parents.iter().any(|p| affected.contains(p)) {
                step.commits.push(commit.key);
                step.rows.extend(commit.rows);
            }
        }
        return Ok(step);
    }

    let mut upstream_keys = Vec::with_capacity(descriptor.upstream.len());
    for parent in &descriptor.upstream {
        upstream_keys.push((parent, &registry.resolve(parent)?.primary_key));
    }
    for row in view.read_rows(table, &KeyFilter::All)? {
        let derived = upstream_keys.iter().any(|(parent, primary_key)| {
            affected.contains(&TableKey::new(parent.as_str(), row.key.project(primary_key.as_slice())))
        });
        if derived {
            step.rows.push(row.key);
        }
    }
    Ok(step)
}
