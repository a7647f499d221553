//! Table descriptors: the declared shape of every relation in a pipeline.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::row::Row;
use crate::value::Value;

/// Primary-key attribute of every merge table.
pub const MERGE_ID: &str = "merge_id";

/// Secondary attribute naming the source table of a merge row.
pub const MERGE_SOURCE: &str = "source";

/// How rows of a table come into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// Rows inserted by external ingestion.
    Manual,
    /// Parameter sets, inserted by ingestion or prepopulation.
    Lookup,
    /// Rows produced by a compute function that reads external files.
    Imported,
    /// Rows produced purely from upstream rows.
    Computed,
    /// Union of several source tables under a hashed `merge_id`.
    Merge,
}

impl TableKind {
    /// Tables whose rows the populator creates.
    pub fn is_populated(self) -> bool {
        matches!(self, TableKind::Imported | TableKind::Computed | TableKind::Merge)
    }

    /// Tables whose rows are written by ingestion.
    pub fn is_ingested(self) -> bool {
        matches!(self, TableKind::Manual | TableKind::Lookup)
    }

    pub fn label(self) -> &'static str {
        match self {
            TableKind::Manual => "manual",
            TableKind::Lookup => "lookup",
            TableKind::Imported => "imported",
            TableKind::Computed => "computed",
            TableKind::Merge => "merge",
        }
    }
}

/// Declared schema and dependencies of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub kind: TableKind,
    /// Primary-key attribute names.
    pub primary_key: Vec<String>,
    /// Secondary attribute names.
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Upstream tables, in declaration order.
    #[serde(default)]
    pub upstream: Vec<String>,
    /// Name of the compute function in the compute catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<String>,
    /// Static parameters handed to the compute function.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

impl TableDescriptor {
    fn bare(name: &str, kind: TableKind, primary_key: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            primary_key: primary_key.iter().map(|s| s.to_string()).collect(),
            attributes: Vec::new(),
            upstream: Vec::new(),
            compute: None,
            params: BTreeMap::new(),
        }
    }

    pub fn manual(name: &str, primary_key: &[&str]) -> Self {
        Self::bare(name, TableKind::Manual, primary_key)
    }

    pub fn lookup(name: &str, primary_key: &[&str]) -> Self {
        Self::bare(name, TableKind::Lookup, primary_key)
    }

    pub fn computed(name: &str, primary_key: &[&str], upstream: &[&str], compute: &str) -> Self {
        Self::bare(name, TableKind::Computed, primary_key)
            .with_upstream(upstream)
            .with_compute(compute)
    }

    pub fn imported(name: &str, primary_key: &[&str], upstream: &[&str], compute: &str) -> Self {
        Self::bare(name, TableKind::Imported, primary_key)
            .with_upstream(upstream)
            .with_compute(compute)
    }

    /// A merge table over the given source tables.
    pub fn merge(name: &str, sources: &[&str]) -> Self {
        Self::bare(name, TableKind::Merge, &[MERGE_ID])
            .with_attributes(&[MERGE_SOURCE])
            .with_upstream(sources)
    }

    pub fn with_attributes(mut self, attributes: &[&str]) -> Self {
        self.attributes
            .extend(attributes.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_upstream(mut self, upstream: &[&str]) -> Self {
        self.upstream.extend(upstream.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_compute(mut self, compute: &str) -> Self {
        self.compute = Some(compute.to_string());
        self
    }

    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.primary_key.iter().any(|a| a == name) || self.attributes.iter().any(|a| a == name)
    }

    /// Checks that a row fits this table: key attributes match the primary
    /// key exactly and every secondary attribute is declared. Merge rows may
    /// carry the attributes of their source key.
    pub fn check_row(&self, row: &Row) -> PipelineResult<()> {
        if !row.key.has_schema(&self.primary_key) {
            return Err(PipelineError::schema(
                &self.name,
                format!(
                    "row key {} does not match primary key [{}]",
                    row.key,
                    self.primary_key.join(", ")
                ),
            ));
        }
        if self.kind == TableKind::Merge {
            return Ok(());
        }
        for name in row.attributes.keys() {
            if !self.attributes.iter().any(|a| a == name) {
                return Err(PipelineError::schema(
                    &self.name,
                    format!("undeclared attribute {name}"),
                ));
            }
        }
        Ok(())
    }

    /// Static checks that need no other table.
    pub(crate) fn validate_shape(&self) -> PipelineResult<()> {
        if !is_identifier(&self.name) {
            return Err(PipelineError::schema(&self.name, "table name is not an identifier"));
        }
        if self.primary_key.is_empty() {
            return Err(PipelineError::schema(&self.name, "primary key is empty"));
        }
        let mut seen = HashSet::new();
        for attr in self.primary_key.iter().chain(&self.attributes) {
            if !is_identifier(attr) {
                return Err(PipelineError::schema(
                    &self.name,
                    format!("attribute name {attr:?} is not an identifier"),
                ));
            }
            if !seen.insert(attr.as_str()) {
                return Err(PipelineError::schema(
                    &self.name,
                    format!("attribute {attr} declared twice"),
                ));
            }
        }
        let mut upstream = HashSet::new();
        for parent in &self.upstream {
            if parent == &self.name {
                return Err(PipelineError::schema(&self.name, "table lists itself as upstream"));
            }
            if !upstream.insert(parent.as_str()) {
                return Err(PipelineError::schema(
                    &self.name,
                    format!("upstream {parent} listed twice"),
                ));
            }
        }
        match self.kind {
            TableKind::Manual | TableKind::Lookup => {
                if self.compute.is_some() {
                    return Err(PipelineError::schema(
                        &self.name,
                        format!("{} tables take no compute function", self.kind.label()),
                    ));
                }
            }
            TableKind::Imported | TableKind::Computed => {
                if self.compute.is_none() {
                    return Err(PipelineError::schema(
                        &self.name,
                        format!("{} tables need a compute function", self.kind.label()),
                    ));
                }
                if self.upstream.is_empty() {
                    return Err(PipelineError::schema(
                        &self.name,
                        format!("{} tables need at least one upstream table", self.kind.label()),
                    ));
                }
            }
            TableKind::Merge => {
                if self.compute.is_some() {
                    return Err(PipelineError::schema(&self.name, "merge tables take no compute function"));
                }
                if self.primary_key != [MERGE_ID] {
                    return Err(PipelineError::schema(
                        &self.name,
                        format!("merge tables are keyed by [{MERGE_ID}]"),
                    ));
                }
                if !self.attributes.iter().any(|a| a == MERGE_SOURCE) {
                    return Err(PipelineError::schema(
                        &self.name,
                        format!("merge tables declare a {MERGE_SOURCE} attribute"),
                    ));
                }
                if self.upstream.is_empty() {
                    return Err(PipelineError::schema(&self.name, "merge tables need at least one source"));
                }
            }
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
