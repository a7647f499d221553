//! Merge tables: one table unifying several source tables.
//!
//! A merge row is keyed by `merge_id`, a digest of the source table name
//! and the source key, and carries the source table name plus the source
//! key's attributes so it can be restricted and traced back.

use neuropipe_core::{
    Key, KeyFilter, MERGE_ID, MERGE_SOURCE, PipelineError, Restriction, Row, TableKey, TableKind,
    Value, scoped_digest,
};

use crate::error::EngineResult;
use crate::pipeline::Pipeline;

/// Merge-table key for one source row.
pub fn merge_id_for(source: &str, source_key: &Key) -> Key {
    Key::new().with(MERGE_ID, Value::text(scoped_digest(source, source_key)))
}

/// The row a merge table holds for one source row.
pub(crate) fn merge_row(merge_key: &Key, source: &TableKey) -> Row {
    let mut row = Row::new(merge_key.clone()).with(MERGE_SOURCE, source.table.as_str());
    for (name, value) in source.key.iter() {
        row.attributes.insert(name.to_string(), value.clone());
    }
    row
}

/// Lookups over merge tables.
pub struct MergeTables {
    pipeline: Pipeline,
}

impl MergeTables {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    fn require_merge(&self, merge: &str) -> EngineResult<()> {
        let table = self.pipeline.registry().resolve(merge)?;
        if table.kind != TableKind::Merge {
            return Err(PipelineError::schema(merge, "not a merge table").into());
        }
        Ok(())
    }

    /// Resolve a merge id to the source row it was built from.
    pub fn merge_get_part(&self, merge: &str, merge_id: &str) -> EngineResult<TableKey> {
        self.require_merge(merge)?;
        let key = Key::new().with(MERGE_ID, merge_id);
        let view = self.pipeline.storage().snapshot()?;
        let commit = view
            .get_commit(merge, &key)?
            .ok_or_else(|| PipelineError::RowNotFound {
                table: merge.to_string(),
                key: key.clone(),
            })?;
        commit
            .parents
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::RowNotFound { table: merge.to_string(), key }.into())
    }

    /// Merge rows whose source key (or `source` name) satisfies the restriction.
    pub fn merge_restrict(&self, merge: &str, restriction: &Restriction) -> EngineResult<Vec<Row>> {
        self.require_merge(merge)?;
        let registry = self.pipeline.registry();
        let mut schema = vec![MERGE_ID.to_string(), MERGE_SOURCE.to_string()];
        for source in &registry.resolve(merge)?.upstream {
            for attr in &registry.resolve(source)?.primary_key {
                if !schema.contains(attr) {
                    schema.push(attr.clone());
                }
            }
        }
        restriction.check_attributes(merge, &schema)?;

        let view = self.pipeline.storage().snapshot()?;
        Ok(view
            .read_rows(merge, &KeyFilter::All)?
            .into_iter()
            .filter(|row| restriction.matches_row(row))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_ids_are_deterministic_and_scoped() {
        let key = Key::new().with("session_id", 1);
        assert_eq!(merge_id_for("TrodesPos", &key), merge_id_for("TrodesPos", &key));
        assert_ne!(merge_id_for("TrodesPos", &key), merge_id_for("DLCPos", &key));
        assert_ne!(
            merge_id_for("TrodesPos", &key),
            merge_id_for("TrodesPos", &Key::new().with("session_id", 2))
        );
    }

    #[test]
    fn merge_row_carries_source_and_key() {
        let source = TableKey::new("TrodesPos", Key::new().with("session_id", 1));
        let merge_key = merge_id_for(&source.table, &source.key);
        let row = merge_row(&merge_key, &source);
        assert_eq!(row.get(MERGE_SOURCE), Some(&Value::text("TrodesPos")));
        assert_eq!(row.get("session_id"), Some(&Value::Int(1)));
        assert_eq!(row.key, merge_key);
    }
}
