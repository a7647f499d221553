//! Ingestion of Manual and Lookup rows, single rows or a prepopulate file.
//!
//! A prepopulate file is TOML with one array of tables per pipeline table:
//!
//! ```toml
//! [[FilterParams]]
//! filter_name = "low"
//! cutoff_hz = 300
//! ```
//!
//! Entries whose primary key already exists are skipped, so the same file
//! can be applied any number of times.

use std::collections::BTreeMap;
use std::path::Path;

use neuropipe_core::{Key, PipelineError, Row, StorageTxn, TableDescriptor, Value};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::pipeline::Pipeline;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertReport {
    pub inserted: usize,
    pub skipped: usize,
}

impl std::ops::AddAssign for InsertReport {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
    }
}

pub struct Ingestor {
    pipeline: Pipeline,
}

impl Ingestor {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Insert rows into a Manual or Lookup table in one transaction.
    ///
    /// Every row must fit the schema and have its upstream parent rows
    /// present. An existing key is skipped when `skip_duplicates` is set and
    /// fails the whole batch with `Duplicate` otherwise.
    pub fn insert_rows(&self, table: &str, rows: Vec<Row>, skip_duplicates: bool) -> EngineResult<InsertReport> {
        let descriptor = self.ingestible(table)?;
        let mut txn = self.pipeline.storage().begin()?;
        let report = self.insert_into(&mut *txn, descriptor, rows, skip_duplicates);
        match report {
            Ok(report) => {
                txn.commit()?;
                info!(table, inserted = report.inserted, skipped = report.skipped, "rows inserted");
                Ok(report)
            }
            Err(e) => {
                txn.rollback()?;
                Err(e)
            }
        }
    }

    /// Apply a prepopulate document. Tables are filled upstream first, so
    /// entries may reference rows defined later in the same file.
    pub fn prepopulate(&self, entries: &str) -> EngineResult<InsertReport> {
        let document: toml::Table = entries
            .parse()
            .map_err(|e: toml::de::Error| EngineError::Entries(e.to_string()))?;

        let mut batches: BTreeMap<String, Vec<Row>> = BTreeMap::new();
        for (table, value) in document {
            let descriptor = self.ingestible(&table)?;
            let toml::Value::Array(items) = value else {
                return Err(EngineError::Entries(format!(
                    "{table} must be an array of tables ([[{table}]])"
                )));
            };
            let mut rows = Vec::with_capacity(items.len());
            for item in items {
                let toml::Value::Table(fields) = item else {
                    return Err(EngineError::Entries(format!("{table} entries must be tables")));
                };
                rows.push(entry_row(descriptor, fields)?);
            }
            batches.insert(table, rows);
        }

        let graph = self.pipeline.registry().graph()?;
        let names: Vec<&String> = batches.keys().collect();
        let order: Vec<String> = graph
            .topological_order(&names)?
            .into_iter()
            .map(String::from)
            .collect();

        let mut txn = self.pipeline.storage().begin()?;
        let mut total = InsertReport::default();
        for table in order {
            let descriptor = self.ingestible(&table)?;
            let rows = batches.remove(&table).unwrap_or_default();
            match self.insert_into(&mut *txn, descriptor, rows, true) {
                Ok(report) => {
                    debug!(%table, inserted = report.inserted, skipped = report.skipped, "entries applied");
                    total += report;
                }
                Err(e) => {
                    txn.rollback()?;
                    return Err(e);
                }
            }
        }
        txn.commit()?;
        info!(inserted = total.inserted, skipped = total.skipped, "prepopulate finished");
        Ok(total)
    }

    pub fn prepopulate_file(&self, path: &Path) -> EngineResult<InsertReport> {
        let entries = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Entries(format!("{}: {e}", path.display())))?;
        self.prepopulate(&entries)
    }

    fn ingestible(&self, table: &str) -> EngineResult<&TableDescriptor> {
        let descriptor = self.pipeline.registry().resolve(table)?;
        if !descriptor.kind.is_ingested() {
            return Err(PipelineError::schema(
                table,
                format!("{} tables are filled by populate, not by insert", descriptor.kind.label()),
            )
            .into());
        }
        Ok(descriptor)
    }

    fn insert_into<T: StorageTxn + ?Sized>(
        &self,
        txn: &mut T,
        descriptor: &TableDescriptor,
        rows: Vec<Row>,
        skip_duplicates: bool,
    ) -> EngineResult<InsertReport> {
        let registry = self.pipeline.registry();
        let table = &descriptor.name;
        let mut report = InsertReport::default();
        for mut row in rows {
            descriptor.check_row(&row)?;
            if txn.row_exists(table, &row.key)? {
                if skip_duplicates {
                    debug!(table = %table, key = %row.key, "entry exists, skipped");
                    report.skipped += 1;
                    continue;
                }
                return Err(PipelineError::Duplicate {
                    table: table.clone(),
                    key: row.key,
                }
                .into());
            }
            for parent in &descriptor.upstream {
                let parent_key = row.key.project(&registry.resolve(parent)?.primary_key);
                if !txn.row_exists(parent, &parent_key)? {
                    return Err(PipelineError::MissingParent {
                        table: table.clone(),
                        parent: parent.clone(),
                        key: row.key,
                    }
                    .into());
                }
            }
            row.source = None;
            txn.write_rows(table, std::slice::from_ref(&row))?;
            report.inserted += 1;
        }
        Ok(report)
    }
}

/// Split one entry's fields into key and secondary attributes.
fn entry_row(descriptor: &TableDescriptor, fields: toml::Table) -> EngineResult<Row> {
    let mut key = Key::new();
    let mut row_attributes = BTreeMap::new();
    for (name, value) in fields {
        let value = toml_value(&descriptor.name, &name, value)?;
        if descriptor.primary_key.contains(&name) {
            key.insert(name, value);
        } else {
            row_attributes.insert(name, value);
        }
    }
    let mut row = Row::new(key);
    row.attributes = row_attributes;
    Ok(row)
}

fn toml_value(table: &str, name: &str, value: toml::Value) -> EngineResult<Value> {
    match value {
        toml::Value::Integer(i) => Ok(Value::Int(i)),
        toml::Value::Float(f) => Ok(Value::Float(f)),
        toml::Value::Boolean(b) => Ok(Value::Bool(b)),
        toml::Value::String(s) => match s.strip_prefix("blob:") {
            Some(address) => Ok(Value::blob(address)),
            None => Ok(Value::text(s)),
        },
        other => Err(EngineError::Entries(format!(
            "{table}.{name}: unsupported value type {}",
            other.type_str()
        ))),
    }
}
