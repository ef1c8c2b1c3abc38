//! Dependency ordering for template fields.
//!
//! Calculated fields declare the fields they read; query fields may bind
//! earlier fields as parameters, explicitly or through a `:name` placeholder
//! that matches a field name. This module turns those declarations into a
//! graph and produces a linear evaluation order in which every field comes
//! after everything it depends on.
//!
//! Edges point from a dependency to the field that needs it, so Kahn's
//! algorithm can run directly on the graph. Ties between independent fields
//! are broken by declaration order, which makes the order deterministic for a
//! given template.
//!
//! Cycles (including a field that depends on itself) are detected with
//! Tarjan's SCC algorithm before any ordering is attempted.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;

use crate::model::FieldSpec;

/// Template-authoring errors found while ordering fields.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OrderError {
    #[error("duplicate field name '{0}'")]
    DuplicateField(String),

    #[error("field '{field}' references unknown field '{reference}'")]
    UnknownFieldReference { field: String, reference: String },

    #[error("cyclic dependency between fields: {}", fields.join(", "))]
    CyclicDependency { fields: Vec<String> },
}

pub type OrderResult<T> = Result<T, OrderError>;

/// Field dependency graph of one template.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node weights are field names; node index == declaration index.
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph, failing on the first duplicate name or unknown
    /// reference.
    pub fn build(fields: &[FieldSpec]) -> OrderResult<Self> {
        let (graph, errors) = Self::build_lenient(fields);
        match errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(graph),
        }
    }

    /// Build the graph and return every duplicate and unknown reference
    /// found. Offending edges are left out of the graph.
    pub fn build_lenient(fields: &[FieldSpec]) -> (Self, Vec<OrderError>) {
        let mut graph = DiGraph::with_capacity(fields.len(), fields.len());
        let mut indices = HashMap::with_capacity(fields.len());
        let mut errors = Vec::new();

        for field in fields {
            let idx = graph.add_node(field.name.clone());
            if indices.insert(field.name.clone(), idx).is_some() {
                errors.push(OrderError::DuplicateField(field.name.clone()));
            }
        }

        for (position, field) in fields.iter().enumerate() {
            let dependent = NodeIndex::new(position);
            for dep in field.dependencies() {
                match indices.get(dep) {
                    Some(&dependency) => {
                        graph.update_edge(dependency, dependent, ());
                    }
                    None => errors.push(OrderError::UnknownFieldReference {
                        field: field.name.clone(),
                        reference: dep.to_string(),
                    }),
                }
            }
            // Placeholders naming no field bind execution parameters.
            for name in field.implicit_reads() {
                if let Some(&dependency) = indices.get(&name) {
                    graph.update_edge(dependency, dependent, ());
                }
            }
        }

        (Self { graph, indices }, errors)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Direct dependencies of a field, in declaration order.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        let Some(&idx) = self.indices.get(name) else {
            return Vec::new();
        };
        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        deps.sort();
        deps.into_iter().map(|i| self.graph[i].as_str()).collect()
    }

    /// Every cycle in the graph, each listed in declaration order.
    ///
    /// A single field only forms a cycle when it depends on itself.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut cycles: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || self.graph.find_edge(scc[0], scc[0]).is_some()
            })
            .map(|mut scc| {
                scc.sort();
                scc
            })
            .collect();
        cycles.sort();

        cycles
            .into_iter()
            .map(|scc| scc.into_iter().map(|i| self.graph[i].clone()).collect())
            .collect()
    }

    /// Topological evaluation order, stable by declaration index.
    pub fn evaluation_order(&self) -> OrderResult<EvaluationOrder> {
        if let Some(fields) = self.cycles().into_iter().next() {
            return Err(OrderError::CyclicDependency { fields });
        }

        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = self
            .graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .map(Reverse)
            .collect();

        let mut steps = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(node)) = ready.pop() {
            steps.push(node.index());
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        // Unreachable once cycles are ruled out.
        if steps.len() != self.graph.node_count() {
            let stuck = self
                .graph
                .node_indices()
                .filter(|n| in_degree[n.index()] > 0)
                .map(|n| self.graph[n].clone())
                .collect();
            return Err(OrderError::CyclicDependency { fields: stuck });
        }

        let names = steps.iter().map(|&i| self.graph[NodeIndex::new(i)].clone()).collect();
        Ok(EvaluationOrder { steps, names })
    }
}

/// Linear field evaluation order for one template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationOrder {
    /// Indices into the template's field list.
    steps: Vec<usize>,
    names: Vec<String>,
}

impl EvaluationOrder {
    /// Compute the order for a field list.
    pub fn compute(fields: &[FieldSpec]) -> OrderResult<Self> {
        DependencyGraph::build(fields)?.evaluation_order()
    }

    /// Field indices in evaluation order.
    pub fn steps(&self) -> &[usize] {
        &self.steps
    }

    /// Field names in evaluation order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Position of a field in the order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Only the calculated fields, in evaluation order.
    pub fn calculated<'a>(&'a self, fields: &'a [FieldSpec]) -> Vec<&'a str> {
        self.steps
            .iter()
            .filter(|&&i| fields[i].is_calculated())
            .map(|&i| fields[i].name.as_str())
            .collect()
    }
}
