//! Dependency graph and resolver.
//!
//! This module provides the [`DependencyGraph`] that holds subtasks and their
//! dependency edges, detects cycles, and turns an acyclic graph into a leveled
//! [`ExecutionPlan`] that can be dispatched level by level.
//!
//! Edges point from a dependency to its dependent: for a subtask `c` that
//! depends on `a`, the graph holds `a -> c`.

use crate::core::plan::ExecutionPlan;
use crate::core::subtask::{Subtask, SubtaskId};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Input record for [`DependencyGraph::build_graph`].
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEntry<T> {
    pub id: SubtaskId,
    pub payload: T,
    pub dependencies: Vec<SubtaskId>,
}

impl<T> GraphEntry<T> {
    pub fn new<I, S>(id: impl Into<SubtaskId>, payload: T, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SubtaskId>,
    {
        Self {
            id: id.into(),
            payload,
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<Subtask> for GraphEntry<Subtask> {
    fn from(subtask: Subtask) -> Self {
        Self {
            id: subtask.id.clone(),
            dependencies: subtask.dependencies.clone(),
            payload: subtask,
        }
    }
}

/// Summary counts over the graph. All zero on an empty graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_edges: usize,
    /// Nodes with neither dependencies nor dependents.
    pub orphan_nodes: usize,
    /// Distinct members of the cycles [`DependencyGraph::detect_cycles`]
    /// reports, self-loops included.
    pub cyclic_nodes: usize,
    /// Number of cycles reported by [`DependencyGraph::detect_cycles`].
    pub cycle_count: usize,
    /// Nodes with no dependencies.
    pub root_nodes: usize,
    /// Nodes nothing depends on.
    pub leaf_nodes: usize,
}

#[derive(Debug, Clone)]
struct GraphNode<T> {
    id: SubtaskId,
    payload: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    OnPath,
    Done,
}

struct Frame {
    node: NodeIndex,
    next: Vec<NodeIndex>,
    pos: usize,
}

/// The subtask dependency graph.
///
/// Backed by petgraph's `DiGraph`. Node indices follow insertion order, which
/// keeps every listing (levels, cycles, statistics) deterministic.
pub struct DependencyGraph<T = Subtask> {
    graph: DiGraph<GraphNode<T>, ()>,
    index: HashMap<SubtaskId, NodeIndex>,
}

impl<T> DependencyGraph<T> {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Build a graph from entries in one step.
    pub fn from_entries(entries: Vec<GraphEntry<T>>) -> Result<Self> {
        let mut graph = Self::new();
        graph.build_graph(entries)?;
        Ok(graph)
    }

    /// Replace the graph contents with `entries`.
    ///
    /// Either every entry and edge is accepted or the graph is left unchanged.
    ///
    /// # Errors
    /// - `DuplicateSubtask` if two entries share an id
    /// - `UnknownDependency` if an entry depends on an id not in `entries`
    pub fn build_graph(&mut self, entries: Vec<GraphEntry<T>>) -> Result<()> {
        let mut graph: DiGraph<GraphNode<T>, ()> = DiGraph::with_capacity(entries.len(), 0);
        let mut index = HashMap::with_capacity(entries.len());
        let mut edges = Vec::with_capacity(entries.len());

        for entry in entries {
            if index.contains_key(&entry.id) {
                return Err(Error::DuplicateSubtask(entry.id));
            }
            let node = graph.add_node(GraphNode {
                id: entry.id.clone(),
                payload: entry.payload,
            });
            index.insert(entry.id.clone(), node);
            edges.push((entry.id, node, entry.dependencies));
        }

        for (id, node, dependencies) in edges {
            for dependency in dependencies {
                let dep_node = *index.get(&dependency).ok_or_else(|| Error::UnknownDependency {
                    subtask: id.clone(),
                    dependency: dependency.clone(),
                })?;
                graph.update_edge(dep_node, node, ());
            }
        }

        debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "dependency graph built"
        );
        self.graph = graph;
        self.index = index;
        Ok(())
    }

    /// Get the number of nodes.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Get the number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: &SubtaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Get the payload stored for `id`.
    pub fn get(&self, id: &SubtaskId) -> Option<&T> {
        self.index
            .get(id)
            .and_then(|&node| self.graph.node_weight(node))
            .map(|node| &node.payload)
    }

    /// All identifiers in insertion order.
    pub fn ids(&self) -> Vec<&SubtaskId> {
        self.graph.node_weights().map(|node| &node.id).collect()
    }

    /// All payloads in insertion order.
    pub fn payloads(&self) -> Vec<&T> {
        self.graph.node_weights().map(|node| &node.payload).collect()
    }

    /// Identifiers `id` depends on.
    pub fn dependencies_of(&self, id: &SubtaskId) -> Vec<&SubtaskId> {
        self.neighbor_ids(id, Direction::Incoming)
    }

    /// Identifiers that depend on `id`.
    pub fn dependents_of(&self, id: &SubtaskId) -> Vec<&SubtaskId> {
        self.neighbor_ids(id, Direction::Outgoing)
    }

    /// Check whether the graph contains any cycle, self-loops included.
    pub fn has_cycles(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Find cycles with a depth-first walk along dependency edges.
    ///
    /// The walk keeps its own frame stack instead of recursing. Each back edge
    /// into a node still on the active path yields one cycle, listed from the
    /// revisited node along the path. A self-dependency is a cycle of one.
    pub fn detect_cycles(&self) -> Vec<Vec<SubtaskId>> {
        let mut state = vec![VisitState::Unvisited; self.graph.node_count()];
        let mut cycles = Vec::new();

        for start in self.graph.node_indices() {
            if state[start.index()] != VisitState::Unvisited {
                continue;
            }

            state[start.index()] = VisitState::OnPath;
            let mut stack = vec![Frame {
                node: start,
                next: self.sorted_neighbors(start, Direction::Incoming),
                pos: 0,
            }];

            while let Some(frame) = stack.last_mut() {
                if frame.pos >= frame.next.len() {
                    state[frame.node.index()] = VisitState::Done;
                    stack.pop();
                    continue;
                }

                let next = frame.next[frame.pos];
                frame.pos += 1;

                match state[next.index()] {
                    VisitState::Unvisited => {
                        state[next.index()] = VisitState::OnPath;
                        stack.push(Frame {
                            node: next,
                            next: self.sorted_neighbors(next, Direction::Incoming),
                            pos: 0,
                        });
                    }
                    VisitState::OnPath => {
                        if let Some(from) = stack.iter().position(|f| f.node == next) {
                            cycles.push(
                                stack[from..]
                                    .iter()
                                    .map(|f| self.graph[f.node].id.clone())
                                    .collect(),
                            );
                        }
                    }
                    VisitState::Done => {}
                }
            }
        }

        cycles
    }

    /// Get identifiers in dependency order.
    ///
    /// # Errors
    /// Returns `CycleDetected` with the full cycle report if the graph has any
    /// cycle; no partial order is produced.
    pub fn topological_sort(&self) -> Result<Vec<SubtaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|_| self.cycle_error())?;
        Ok(sorted
            .into_iter()
            .map(|node| self.graph[node].id.clone())
            .collect())
    }

    /// Group subtasks into levels by iterative frontier expansion.
    ///
    /// Level 0 holds every node without dependencies; level `k` holds the
    /// nodes whose dependencies all sit in levels `0..k`. Within a level the
    /// insertion order is kept.
    ///
    /// # Errors
    /// Returns `CycleDetected` on a cyclic graph.
    pub fn execution_plan(&self) -> Result<ExecutionPlan> {
        if self.has_cycles() {
            return Err(self.cycle_error());
        }

        let count = self.graph.node_count();
        let mut placed = vec![false; count];
        let mut placed_count = 0;
        let mut levels = Vec::new();

        while placed_count < count {
            let frontier: Vec<NodeIndex> = self
                .graph
                .node_indices()
                .filter(|node| !placed[node.index()])
                .filter(|&node| {
                    self.graph
                        .neighbors_directed(node, Direction::Incoming)
                        .all(|dep| placed[dep.index()])
                })
                .collect();

            if frontier.is_empty() {
                return Err(self.cycle_error());
            }

            for node in &frontier {
                placed[node.index()] = true;
            }
            placed_count += frontier.len();
            levels.push(
                frontier
                    .into_iter()
                    .map(|node| self.graph[node].id.clone())
                    .collect(),
            );
        }

        Ok(ExecutionPlan::from_levels_unchecked(levels))
    }

    /// Longest dependency path by node count, root first.
    ///
    /// Used as the critical path estimate. Ties go to the earliest inserted
    /// node. Empty on an empty graph.
    ///
    /// # Errors
    /// Returns `CycleDetected` on a cyclic graph.
    pub fn longest_chain(&self) -> Result<Vec<SubtaskId>> {
        let order = toposort(&self.graph, None).map_err(|_| self.cycle_error())?;

        let count = self.graph.node_count();
        let mut length = vec![0usize; count];
        let mut previous: Vec<Option<NodeIndex>> = vec![None; count];

        for &node in &order {
            let best = self
                .sorted_neighbors(node, Direction::Incoming)
                .into_iter()
                .fold(None::<NodeIndex>, |best, dep| match best {
                    Some(b) if length[b.index()] >= length[dep.index()] => Some(b),
                    _ => Some(dep),
                });
            length[node.index()] = best.map_or(1, |b| length[b.index()] + 1);
            previous[node.index()] = best;
        }

        let Some(mut tail) = self
            .graph
            .node_indices()
            .fold(None::<NodeIndex>, |best, node| match best {
                Some(b) if length[b.index()] >= length[node.index()] => Some(b),
                _ => Some(node),
            })
        else {
            return Ok(Vec::new());
        };

        let mut chain = vec![self.graph[tail].id.clone()];
        while let Some(prev) = previous[tail.index()] {
            chain.push(self.graph[prev].id.clone());
            tail = prev;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Compute summary counts. Works on cyclic and empty graphs.
    pub fn statistics(&self) -> GraphStatistics {
        let cycles = self.detect_cycles();
        let cyclic_nodes = cycles.iter().flatten().collect::<HashSet<_>>().len();

        let mut stats = GraphStatistics {
            total_nodes: self.graph.node_count(),
            total_edges: self.graph.edge_count(),
            cyclic_nodes,
            cycle_count: cycles.len(),
            ..GraphStatistics::default()
        };

        for node in self.graph.node_indices() {
            let has_deps = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .next()
                .is_some();
            let has_dependents = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .next()
                .is_some();
            if !has_deps {
                stats.root_nodes += 1;
            }
            if !has_dependents {
                stats.leaf_nodes += 1;
            }
            if !has_deps && !has_dependents {
                stats.orphan_nodes += 1;
            }
        }

        stats
    }

    fn cycle_error(&self) -> Error {
        Error::CycleDetected {
            cycles: self.detect_cycles(),
        }
    }

    fn sorted_neighbors(&self, node: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> =
            self.graph.neighbors_directed(node, direction).collect();
        neighbors.sort();
        neighbors.dedup();
        neighbors
    }

    fn neighbor_ids(&self, id: &SubtaskId, direction: Direction) -> Vec<&SubtaskId> {
        match self.index.get(id) {
            Some(&node) => self
                .sorted_neighbors(node, direction)
                .into_iter()
                .map(|n| &self.graph[n].id)
                .collect(),
            None => Vec::new(),
        }
    }
}

impl DependencyGraph<Subtask> {
    /// Build a graph whose payloads are the subtasks themselves.
    pub fn from_subtasks(subtasks: Vec<Subtask>) -> Result<Self> {
        Self::from_entries(subtasks.into_iter().map(GraphEntry::from).collect())
    }
}

impl<T> Default for DependencyGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for DependencyGraph<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("nodes", &self.len())
            .field("edges", &self.edge_count())
            .finish()
    }
}
