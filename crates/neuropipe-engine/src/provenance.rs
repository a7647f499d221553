//! Provenance: lineage queries and single-key invalidation over the
//! commit ledger.

use std::collections::{HashSet, VecDeque};

use neuropipe_core::{
    CommitRecord, CommitToken, Key, KeyFilter, PipelineError, StorageView, TableKey, TableKind,
};
use serde::Serialize;
use tracing::info;

use crate::candidates::candidate_keys;
use crate::cascade::dependents_in;
use crate::error::EngineResult;
use crate::pipeline::{Pipeline, now_ms};

/// One row in a lineage chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineageEntry {
    /// Hops from the queried row (0 for the row itself).
    pub depth: usize,
    pub table: String,
    pub key: Key,
    pub kind: TableKind,
    /// Commit that produced the row; `None` for ingested rows.
    pub commit: Option<CommitToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub populated: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidateReport {
    pub table: String,
    pub key: Key,
    pub rows_removed: usize,
}

pub struct Provenance {
    pipeline: Pipeline,
}

impl Provenance {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// The row itself, then every ancestor row reachable through commit
    /// parents, breadth first. Ingested rows with upstream tables resolve
    /// their parents by key projection.
    pub fn provenance_of(&self, table: &str, key: &Key) -> EngineResult<Vec<LineageEntry>> {
        let registry = self.pipeline.registry();
        registry.resolve(table)?;
        let view = self.pipeline.storage().snapshot()?;
        if !view.row_exists(table, key)? {
            return Err(PipelineError::RowNotFound {
                table: table.to_string(),
                key: key.clone(),
            }
            .into());
        }

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([(TableKey::new(table, key.clone()), 0usize)]);
        let mut lineage = Vec::new();
        while let Some((node, depth)) = queue.pop_front() {
            if !seen.insert(node.clone()) {
                continue;
            }
            let descriptor = registry.resolve(&node.table)?;
            let (parents, commit) = if descriptor.kind.is_populated() {
                let row = view
                    .read_rows(&node.table, &KeyFilter::Exact(node.key.clone()))?
                    .into_iter()
                    .next();
                let source = match row.and_then(|r| r.source) {
                    Some(source) => source,
                    None => node.key.project(&registry.candidate_attributes(&node.table)?),
                };
                match view.get_commit(&node.table, &source)? {
                    Some(record) => (record.parents, Some(record.token)),
                    None => (Vec::new(), None),
                }
            } else {
                let mut parents = Vec::new();
                for parent in &descriptor.upstream {
                    let primary_key = &registry.resolve(parent)?.primary_key;
                    let parent_key = node.key.project(primary_key);
                    if parent_key.has_schema(primary_key) && view.row_exists(parent, &parent_key)? {
                        parents.push(TableKey::new(parent.as_str(), parent_key));
                    }
                }
                (parents, None)
            };
            lineage.push(LineageEntry {
                depth,
                table: node.table.clone(),
                key: node.key.clone(),
                kind: descriptor.kind,
                commit,
            });
            for parent in parents {
                if !seen.contains(&parent) {
                    queue.push_back((parent, depth + 1));
                }
            }
        }
        Ok(lineage)
    }

    /// True once a row-set has been committed for the candidate key.
    pub fn is_populated(&self, table: &str, key: &Key) -> EngineResult<bool> {
        Ok(self.commit_record(table, key)?.is_some())
    }

    pub fn commit_record(&self, table: &str, key: &Key) -> EngineResult<Option<CommitRecord>> {
        self.pipeline.registry().resolve(table)?;
        let view = self.pipeline.storage().snapshot()?;
        Ok(view.get_commit(table, key)?)
    }

    pub fn progress(&self, table: &str) -> EngineResult<Progress> {
        let view = self.pipeline.storage().snapshot()?;
        let candidates = candidate_keys(self.pipeline.registry(), &*view, table, None)?;
        let committed: HashSet<Key> = view.list_commits(table)?.into_iter().map(|c| c.key).collect();
        let populated = candidates
            .iter()
            .filter(|c| committed.contains(&c.key))
            .count();
        Ok(Progress {
            total: candidates.len(),
            populated,
            remaining: candidates.len() - populated,
        })
    }

    /// Remove the row-set committed for one candidate key so the next
    /// populate recomputes it.
    ///
    /// Refuses while the key (or a job reading its rows) is reserved, and
    /// while downstream rows still derive from it.
    pub fn invalidate(&self, table: &str, key: &Key) -> EngineResult<InvalidateReport> {
        let registry = self.pipeline.registry();
        let descriptor = registry.resolve(table)?;
        if !descriptor.kind.is_populated() {
            return Err(PipelineError::schema(
                table,
                format!("{} rows cannot be invalidated, delete them instead", descriptor.kind.label()),
            )
            .into());
        }
        let liveness = self.pipeline.settings().liveness;
        let now = now_ms();

        let mut txn = self.pipeline.storage().begin()?;
        let Some(commit) = txn.get_commit(table, key)? else {
            txn.rollback()?;
            return Err(PipelineError::RowNotFound {
                table: table.to_string(),
                key: key.clone(),
            }
            .into());
        };
        let rows: HashSet<TableKey> = commit
            .rows
            .iter()
            .map(|k| TableKey::new(table, k.clone()))
            .collect();

        let blocking = txn.list_jobs(None)?.into_iter().find(|job| {
            job.is_live(now, liveness)
                && ((job.table == table && job.key == *key)
                    || job.parents.iter().any(|p| rows.contains(p)))
        });
        if let Some(job) = blocking {
            txn.rollback()?;
            return Err(PipelineError::DeleteConflict {
                table: job.table,
                key: job.key,
            }
            .into());
        }

        for child in registry.graph()?.downstream(table)? {
            if !dependents_in(registry, &*txn, child, &rows)?.is_empty() {
                txn.rollback()?;
                return Err(PipelineError::DependentsExist {
                    table: table.to_string(),
                    key: key.clone(),
                    dependent: child.to_string(),
                }
                .into());
            }
        }

        let rows_removed = txn.delete_rows(table, &commit.rows)?;
        txn.remove_commit(table, key)?;
        txn.remove_failure(table, key)?;
        txn.commit()?;
        info!(table, %key, rows_removed, "row-set invalidated");
        Ok(InvalidateReport {
            table: table.to_string(),
            key: key.clone(),
            rows_removed,
        })
    }
}
