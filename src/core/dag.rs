//! Dependency graph used to validate task sets.
//!
//! The queue keeps its own position-ordered entries for scheduling; this
//! graph exists to reject malformed task sets (unknown dependency ids,
//! cycles) before anything is scheduled.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Directed graph of task ids. An edge `a -> b` means `b` depends on `a`.
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Build a graph from a full task set.
    ///
    /// # Errors
    /// Returns `UnresolvableDependency` for the first dependency id that does
    /// not name a task in the set.
    pub fn from_tasks<'a, I>(tasks: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Task>,
    {
        let tasks: Vec<&Task> = tasks.into_iter().collect();
        let mut dag = Self::new();
        for task in &tasks {
            dag.add_node(&task.id);
        }
        for task in &tasks {
            for dep in &task.dependencies {
                dag.add_dependency(dep, &task.id)?;
            }
        }
        Ok(dag)
    }

    /// Add a node, returning the existing index when the id is already known.
    pub fn add_node(&mut self, id: &TaskId) -> NodeIndex {
        if let Some(&index) = self.index.get(id) {
            return index;
        }
        let index = self.graph.add_node(id.clone());
        self.index.insert(id.clone(), index);
        index
    }

    /// Record that `dependent` waits on `dependency`.
    pub fn add_dependency(&mut self, dependency: &TaskId, dependent: &TaskId) -> Result<()> {
        let from = *self
            .index
            .get(dependency)
            .ok_or_else(|| Error::UnresolvableDependency {
                task_id: dependent.clone(),
                dependency: dependency.clone(),
            })?;
        let to = *self
            .index
            .get(dependent)
            .ok_or_else(|| Error::TaskNotFound(dependent.clone()))?;
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Task ids ordered so every task follows its dependencies.
    ///
    /// # Errors
    /// Returns `DependencyCycle` naming one task on the cycle.
    pub fn topological_order(&self) -> Result<Vec<&TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::DependencyCycle(id)
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Fail if the graph contains a cycle.
    pub fn check_acyclic(&self) -> Result<()> {
        self.topological_order().map(|_| ())
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.node_count())
            .field("dependencies", &self.edge_count())
            .finish()
    }
}
