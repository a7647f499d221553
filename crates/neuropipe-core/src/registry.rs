//! Table registry: the directory of every declared table.
//!
//! Registration order is dependency order: a table may only name upstream
//! tables that are already registered. The dependency graph is built lazily
//! on first use and dropped whenever another table is registered.

use std::collections::HashMap;
use std::sync::OnceLock;

use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::graph::DependencyGraph;
use crate::table::{MERGE_ID, TableDescriptor, TableKind};

#[derive(Debug, Default, Clone)]
pub struct Registry {
    tables: Vec<TableDescriptor>,
    index: HashMap<String, usize>,
    graph: OnceLock<DependencyGraph>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register descriptors declared in any order.
    ///
    /// The set is checked for cycles first, then registered upstream-first.
    pub fn from_descriptors(descriptors: Vec<TableDescriptor>) -> PipelineResult<Self> {
        let graph = DependencyGraph::build(&descriptors)?;
        let mut by_name: HashMap<String, TableDescriptor> = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let mut registry = Self::new();
        for name in graph.order() {
            if let Some(descriptor) = by_name.remove(name) {
                registry.register(descriptor)?;
            }
        }
        Ok(registry)
    }

    /// Validate and add a table.
    pub fn register(&mut self, descriptor: TableDescriptor) -> PipelineResult<()> {
        descriptor.validate_shape()?;
        if self.index.contains_key(&descriptor.name) {
            return Err(PipelineError::schema(&descriptor.name, "table already registered"));
        }
        for parent in &descriptor.upstream {
            let parent = self.resolve(parent).map_err(|_| {
                PipelineError::schema(
                    &descriptor.name,
                    format!("upstream {parent} is not registered yet"),
                )
            })?;
            if descriptor.kind == TableKind::Merge {
                continue;
            }
            // Foreign-key inheritance: the parent's key travels unmodified.
            if parent.kind == TableKind::Merge {
                if !descriptor.primary_key.iter().any(|a| a == MERGE_ID) {
                    return Err(PipelineError::schema(
                        &descriptor.name,
                        format!("primary key must include {MERGE_ID} inherited from {}", parent.name),
                    ));
                }
                continue;
            }
            for attr in &parent.primary_key {
                if !descriptor.primary_key.contains(attr) {
                    return Err(PipelineError::schema(
                        &descriptor.name,
                        format!(
                            "primary key must include {attr} inherited from {}",
                            parent.name
                        ),
                    ));
                }
            }
        }
        debug!(table = %descriptor.name, kind = descriptor.kind.label(), "table registered");
        self.index.insert(descriptor.name.clone(), self.tables.len());
        self.tables.push(descriptor);
        self.graph = OnceLock::new();
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> PipelineResult<&TableDescriptor> {
        self.index
            .get(name)
            .map(|&i| &self.tables[i])
            .ok_or_else(|| PipelineError::UnknownTable(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Tables in registration order.
    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// The dependency graph, built on first use.
    pub fn graph(&self) -> PipelineResult<&DependencyGraph> {
        if let Some(graph) = self.graph.get() {
            return Ok(graph);
        }
        let graph = DependencyGraph::build(&self.tables)?;
        Ok(self.graph.get_or_init(|| graph))
    }

    /// Attributes of a table's candidate keys: its primary-key attributes
    /// that come from upstream tables, in primary-key order.
    pub fn candidate_attributes(&self, name: &str) -> PipelineResult<Vec<String>> {
        let table = self.resolve(name)?;
        if table.kind == TableKind::Merge {
            return Ok(vec![MERGE_ID.to_string()]);
        }
        let mut inherited = Vec::new();
        for parent in &table.upstream {
            inherited.extend(self.resolve(parent)?.primary_key.iter().cloned());
        }
        Ok(table
            .primary_key
            .iter()
            .filter(|a| inherited.contains(a))
            .cloned()
            .collect())
    }
}
