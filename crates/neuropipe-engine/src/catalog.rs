//! Compute catalog: named compute functions bound to tables by the manifest.
//!
//! A compute function receives one candidate key with the upstream rows it
//! was joined from and returns the rows to commit for that key. Functions
//! are plain synchronous closures; the populator runs them on the blocking
//! pool and treats an `Err` or a panic as a per-key failure.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use neuropipe_core::{Key, Row, Value};
use thiserror::Error;

/// Everything a compute function may read.
#[derive(Debug, Clone)]
pub struct ComputeInput {
    pub table: String,
    /// Candidate key being computed.
    pub key: Key,
    /// Upstream table name → the rows the key was joined from.
    pub upstream: BTreeMap<String, Vec<Row>>,
    /// Static parameters declared on the table.
    pub parameters: BTreeMap<String, Value>,
    pub primary_key: Vec<String>,
    pub attributes: Vec<String>,
}

impl ComputeInput {
    pub fn param(&self, name: &str) -> Result<&Value, ComputeError> {
        self.parameters
            .get(name)
            .ok_or_else(|| ComputeError::MissingParameter(name.to_string()))
    }

    pub fn upstream_rows(&self, table: &str) -> &[Row] {
        self.upstream.get(table).map(Vec::as_slice).unwrap_or_default()
    }

    /// Primary-key attributes the candidate key does not carry.
    pub fn fan_out_attributes(&self) -> Vec<&str> {
        self.primary_key
            .iter()
            .filter(|a| !self.key.contains(a))
            .map(String::as_str)
            .collect()
    }

    /// Declared secondary attributes filled from parameters first, then
    /// from upstream secondary attributes. Undeclared names are dropped.
    pub fn inherited_attributes(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for name in &self.attributes {
            if let Some(value) = self.parameters.get(name) {
                out.insert(name.clone(), value.clone());
                continue;
            }
            let upstream = self
                .upstream
                .values()
                .flatten()
                .find_map(|row| row.attributes.get(name));
            if let Some(value) = upstream {
                out.insert(name.clone(), value.clone());
            }
        }
        out
    }
}

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("missing parameter {0}")]
    MissingParameter(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

impl ComputeError {
    pub fn failed(reason: impl fmt::Display) -> Self {
        ComputeError::Failed(reason.to_string())
    }
}

pub type ComputeFn = Arc<dyn Fn(&ComputeInput) -> Result<Vec<Row>, ComputeError> + Send + Sync>;

/// Name → compute function.
#[derive(Clone, Default)]
pub struct ComputeCatalog {
    functions: HashMap<String, ComputeFn>,
}

impl ComputeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with `passthrough` and `split`.
    pub fn with_builtins() -> Self {
        Self::new()
            .with("passthrough", passthrough)
            .with("split", split)
    }

    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&ComputeInput) -> Result<Vec<Row>, ComputeError> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
    }

    pub fn with<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&ComputeInput) -> Result<Vec<Row>, ComputeError> + Send + Sync + 'static,
    {
        self.register(name, function);
        self
    }

    pub fn get(&self, name: &str) -> Option<ComputeFn> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ComputeCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeCatalog")
            .field("functions", &self.names())
            .finish()
    }
}

/// One row per candidate key. Key attributes the candidate does not carry
/// are taken from parameters of the same name.
pub fn passthrough(input: &ComputeInput) -> Result<Vec<Row>, ComputeError> {
    let mut key = input.key.clone();
    for name in input.fan_out_attributes() {
        key.insert(name, input.param(name)?.clone());
    }
    let mut row = Row::new(key);
    row.attributes = input.inherited_attributes();
    Ok(vec![row])
}

/// Fan-out: `fan_out` rows numbered 0..n on the table's one extra key
/// attribute. `fan_out = 0` commits an empty row-set.
pub fn split(input: &ComputeInput) -> Result<Vec<Row>, ComputeError> {
    let extra = input.fan_out_attributes();
    let [attribute] = extra.as_slice() else {
        return Err(ComputeError::failed(format!(
            "split needs exactly one key attribute beyond the candidate key, found {extra:?}"
        )));
    };
    let count = input.param("fan_out")?;
    let n = count
        .as_i64()
        .filter(|n| *n >= 0)
        .ok_or_else(|| ComputeError::InvalidParameter {
            name: "fan_out".to_string(),
            reason: format!("expected a non-negative integer, got {count}"),
        })?;
    let attributes = input.inherited_attributes();
    Ok((0..n)
        .map(|i| {
            let mut row = Row::new(input.key.clone().with(*attribute, i));
            row.attributes = attributes.clone();
            row
        })
        .collect())
}
