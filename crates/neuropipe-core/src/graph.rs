//! Dependency graph over declared tables.
//!
//! Plain adjacency lists indexed by declaration position. The topological
//! order is computed once at build time with Kahn's algorithm; ties go to
//! the table declared first, so the order is stable across runs.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::table::TableDescriptor;

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    /// node → nodes it reads from.
    upstream: Vec<Vec<usize>>,
    /// node → nodes that read from it.
    downstream: Vec<Vec<usize>>,
    /// Topological order of node indices.
    order: Vec<usize>,
    /// node → position in `order`.
    rank: Vec<usize>,
}

impl DependencyGraph {
    /// Build the graph from descriptors given in any order.
    ///
    /// Fails with `UnknownTable` for a dangling upstream name and with
    /// `CyclicDependency` when the edges contain a cycle.
    pub fn build(descriptors: &[TableDescriptor]) -> PipelineResult<Self> {
        let mut index = HashMap::with_capacity(descriptors.len());
        for (i, d) in descriptors.iter().enumerate() {
            if index.insert(d.name.clone(), i).is_some() {
                return Err(PipelineError::schema(&d.name, "table declared twice"));
            }
        }

        let n = descriptors.len();
        let mut upstream = vec![Vec::new(); n];
        let mut downstream = vec![Vec::new(); n];
        for (i, d) in descriptors.iter().enumerate() {
            for parent in &d.upstream {
                let p = *index
                    .get(parent)
                    .ok_or_else(|| PipelineError::UnknownTable(parent.clone()))?;
                upstream[i].push(p);
                downstream[p].push(i);
            }
        }

        let mut in_degree: Vec<usize> = upstream.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &child in &downstream[node] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    ready.push(Reverse(child));
                }
            }
        }

        let names: Vec<String> = descriptors.iter().map(|d| d.name.clone()).collect();
        if order.len() < n {
            let cycle = find_cycle(&upstream, &in_degree)
                .into_iter()
                .map(|i| names[i].clone())
                .collect();
            return Err(PipelineError::CyclicDependency { cycle });
        }

        let mut rank = vec![0; n];
        for (pos, &node) in order.iter().enumerate() {
            rank[node] = pos;
        }
        debug!(tables = n, "dependency graph built");
        Ok(Self {
            names,
            index,
            upstream,
            downstream,
            order,
            rank,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.index.contains_key(table)
    }

    /// Every table, upstream before downstream.
    pub fn order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.names[i].as_str()).collect()
    }

    /// The given tables sorted so each comes after its upstream dependencies.
    pub fn topological_order<S: AsRef<str>>(&self, subset: &[S]) -> PipelineResult<Vec<&str>> {
        let mut nodes = Vec::with_capacity(subset.len());
        for name in subset {
            let node = self.node(name.as_ref())?;
            if !nodes.contains(&node) {
                nodes.push(node);
            }
        }
        nodes.sort_by_key(|&i| self.rank[i]);
        Ok(nodes.into_iter().map(|i| self.names[i].as_str()).collect())
    }

    /// Direct upstream tables.
    pub fn upstream(&self, table: &str) -> PipelineResult<Vec<&str>> {
        let node = self.node(table)?;
        Ok(self.upstream[node].iter().map(|&i| self.names[i].as_str()).collect())
    }

    /// Direct downstream tables.
    pub fn downstream(&self, table: &str) -> PipelineResult<Vec<&str>> {
        let node = self.node(table)?;
        Ok(self.downstream[node].iter().map(|&i| self.names[i].as_str()).collect())
    }

    /// Transitive upstream closure, in topological order.
    pub fn ancestors(&self, table: &str) -> PipelineResult<Vec<&str>> {
        let node = self.node(table)?;
        Ok(self.closure(node, &self.upstream))
    }

    /// Transitive downstream closure, in topological order.
    pub fn descendants(&self, table: &str) -> PipelineResult<Vec<&str>> {
        let node = self.node(table)?;
        Ok(self.closure(node, &self.downstream))
    }

    fn closure(&self, start: usize, edges: &[Vec<usize>]) -> Vec<&str> {
        let mut seen = vec![false; self.names.len()];
        let mut stack = edges[start].clone();
        let mut found = Vec::new();
        while let Some(node) = stack.pop() {
            if seen[node] {
                continue;
            }
            seen[node] = true;
            found.push(node);
            stack.extend(edges[node].iter().copied());
        }
        found.sort_by_key(|&i| self.rank[i]);
        found.into_iter().map(|i| self.names[i].as_str()).collect()
    }

    fn node(&self, table: &str) -> PipelineResult<usize> {
        self.index
            .get(table)
            .copied()
            .ok_or_else(|| PipelineError::UnknownTable(table.to_string()))
    }
}

/// Walk upstream edges among the nodes Kahn's algorithm could not place
/// until a node repeats; return that loop in data-flow order, closed.
fn find_cycle(upstream: &[Vec<usize>], in_degree: &[usize]) -> Vec<usize> {
    let Some(start) = in_degree.iter().position(|&d| d > 0) else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut position = HashMap::from([(start, 0usize)]);
    let mut current = start;
    loop {
        // Every unplaced node still has an unplaced parent.
        let Some(&next) = upstream[current].iter().find(|&&p| in_degree[p] > 0) else {
            return path;
        };
        if let Some(&at) = position.get(&next) {
            let mut cycle: Vec<usize> = path[at..].to_vec();
            cycle.reverse();
            cycle.push(cycle[0]);
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual(name: &str) -> TableDescriptor {
        TableDescriptor::manual(name, &["id"])
    }

    fn child(name: &str, upstream: &[&str]) -> TableDescriptor {
        TableDescriptor::computed(name, &["id"], upstream, "f")
    }

    fn pipeline() -> Vec<TableDescriptor> {
        vec![
            manual("Session"),
            manual("FilterParams"),
            child("FilteredSignal", &["Session", "FilterParams"]),
            child("SpikeSorting", &["FilteredSignal"]),
            child("Position", &["Session"]),
            child("Decoding", &["SpikeSorting", "Position"]),
        ]
    }

    #[test]
    fn order_respects_dependencies_and_declaration() {
        let graph = DependencyGraph::build(&pipeline()).unwrap();
        assert_eq!(
            graph.order(),
            vec![
                "Session",
                "FilterParams",
                "FilteredSignal",
                "SpikeSorting",
                "Position",
                "Decoding"
            ]
        );
    }

    #[test]
    fn order_is_independent_of_declaration_for_dependencies() {
        let mut tables = pipeline();
        tables.reverse();
        let graph = DependencyGraph::build(&tables).unwrap();
        let order = graph.order();
        let pos = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(pos("Session") < pos("FilteredSignal"));
        assert!(pos("FilterParams") < pos("FilteredSignal"));
        assert!(pos("SpikeSorting") < pos("Decoding"));
        assert!(pos("Position") < pos("Decoding"));
    }

    #[test]
    fn subset_order() {
        let graph = DependencyGraph::build(&pipeline()).unwrap();
        let order = graph
            .topological_order(&["Decoding", "Session", "SpikeSorting"])
            .unwrap();
        assert_eq!(order, vec!["Session", "SpikeSorting", "Decoding"]);
        assert!(graph.topological_order(&["Nope"]).is_err());
    }

    #[test]
    fn ancestors_and_descendants() {
        let graph = DependencyGraph::build(&pipeline()).unwrap();
        assert_eq!(
            graph.descendants("Session").unwrap(),
            vec!["FilteredSignal", "SpikeSorting", "Position", "Decoding"]
        );
        assert_eq!(
            graph.ancestors("Decoding").unwrap(),
            vec!["Session", "FilterParams", "FilteredSignal", "SpikeSorting", "Position"]
        );
        assert!(graph.descendants("Decoding").unwrap().is_empty());
        assert_eq!(graph.upstream("FilteredSignal").unwrap(), vec!["Session", "FilterParams"]);
        assert_eq!(graph.downstream("Session").unwrap(), vec!["FilteredSignal", "Position"]);
    }

    #[test]
    fn cycle_is_named() {
        let tables = vec![
            manual("Root"),
            child("A", &["Root", "C"]),
            child("B", &["A"]),
            child("C", &["B"]),
        ];
        match DependencyGraph::build(&tables).unwrap_err() {
            PipelineError::CyclicDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                for name in ["A", "B", "C"] {
                    assert!(cycle.iter().any(|c| c == name), "{name} missing from {cycle:?}");
                }
                assert!(!cycle.iter().any(|c| c == "Root"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_upstream_is_reported() {
        let tables = vec![child("A", &["Ghost"])];
        assert!(matches!(
            DependencyGraph::build(&tables).unwrap_err(),
            PipelineError::UnknownTable(name) if name == "Ghost"
        ));
    }
}
