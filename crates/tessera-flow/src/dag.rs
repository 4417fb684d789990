//! Stage dependency graph.
//!
//! A small wrapper over a petgraph `DiGraph` keyed by stage name. Edges point
//! from a producer stage to each stage consuming its output. Every ordering
//! it returns breaks ties by insertion order, so the same pipeline always
//! runs its stages in the same sequence.

use std::collections::{HashMap, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::error::{Error, Result};

/// A directed graph of stage names.
#[derive(Debug, Clone, Default)]
pub(crate) struct StageGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
    /// Insertion rank of each node, used for deterministic tie-breaking.
    rank: HashMap<NodeIndex, usize>,
}

impl StageGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a stage; adding an existing name returns its index.
    pub(crate) fn add_node(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), idx);
        self.rank.insert(idx, self.rank.len());
        idx
    }

    /// Adds an edge `from -> to` (`to` consumes what `from` produces).
    pub(crate) fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) -> Result<()> {
        for idx in [from, to] {
            self.graph
                .node_weight(idx)
                .ok_or_else(|| Error::DagNodeNotFound {
                    node: format!("index {}", idx.index()),
                })?;
        }
        self.graph.add_edge(from, to, ());
        Ok(())
    }

    fn rank_of(&self, idx: NodeIndex) -> usize {
        self.rank.get(&idx).copied().unwrap_or(usize::MAX)
    }

    fn name_of(&self, idx: NodeIndex) -> Result<String> {
        self.graph
            .node_weight(idx)
            .cloned()
            .ok_or_else(|| Error::DagNodeNotFound {
                node: format!("index {}", idx.index()),
            })
    }

    /// Kahn's algorithm; ready nodes are taken in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `CycleDetected` naming every stage that could not be ordered.
    pub(crate) fn toposort(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<NodeIndex, usize> =
            self.graph.node_indices().map(|idx| (idx, 0)).collect();
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut by_rank: Vec<NodeIndex> = self.graph.node_indices().collect();
        by_rank.sort_by_key(|&idx| self.rank_of(idx));

        let mut queue: VecDeque<NodeIndex> = by_rank
            .iter()
            .copied()
            .filter(|idx| in_degree.get(idx) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(by_rank.len());

        while let Some(idx) = queue.pop_front() {
            order.push(self.name_of(idx)?);
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            next.sort_by_key(|&n| self.rank_of(n));
            next.dedup();
            for n in next {
                if let Some(deg) = in_degree.get_mut(&n) {
                    *deg = deg.saturating_sub(
                        self.graph.edges_connecting(idx, n).count(),
                    );
                    if *deg == 0 {
                        queue.push_back(n);
                    }
                }
            }
        }

        if order.len() != by_rank.len() {
            let cycle = by_rank
                .into_iter()
                .filter(|idx| in_degree.get(idx).copied().unwrap_or(0) > 0)
                .map(|idx| self.name_of(idx))
                .collect::<Result<Vec<_>>>()?;
            return Err(Error::CycleDetected { cycle });
        }
        Ok(order)
    }

    /// Stages that `name` directly depends on, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `DagNodeNotFound` for an unknown stage.
    pub(crate) fn upstream(&self, name: &str) -> Result<Vec<String>> {
        let idx = self
            .index
            .get(name)
            .copied()
            .ok_or_else(|| Error::DagNodeNotFound {
                node: name.to_string(),
            })?;
        let mut parents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        parents.sort_by_key(|&n| self.rank_of(n));
        parents.dedup();
        parents.into_iter().map(|n| self.name_of(n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_graph_sorts_to_nothing() {
        assert!(StageGraph::new().toposort().unwrap().is_empty());
    }

    #[test]
    fn linear_graph_sorts_in_dependency_order() {
        let mut g = StageGraph::new();
        let features = g.add_node("features");
        let combine = g.add_node("combine");
        let collect = g.add_node("collect");
        g.add_edge(collect, combine).unwrap();
        g.add_edge(combine, features).unwrap();

        assert_eq!(
            g.toposort().unwrap(),
            vec!["collect".to_string(), "combine".into(), "features".into()]
        );
    }

    #[test]
    fn independent_stages_keep_insertion_order() {
        let mut g = StageGraph::new();
        let b = g.add_node("collect_b");
        let a = g.add_node("collect_a");
        let c = g.add_node("combine");
        g.add_edge(a, c).unwrap();
        g.add_edge(b, c).unwrap();

        assert_eq!(
            g.toposort().unwrap(),
            vec!["collect_b".to_string(), "collect_a".into(), "combine".into()]
        );
        assert_eq!(
            g.upstream("combine").unwrap(),
            vec!["collect_b".to_string(), "collect_a".into()]
        );
    }

    #[test]
    fn parallel_edges_count_once_per_edge() {
        let mut g = StageGraph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        g.add_edge(a, b).unwrap();
        g.add_edge(a, b).unwrap();
        assert_eq!(g.toposort().unwrap(), vec!["a".to_string(), "b".into()]);
        assert_eq!(g.upstream("b").unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn cycle_is_reported_with_its_members() {
        let mut g = StageGraph::new();
        let root = g.add_node("root");
        let a = g.add_node("a");
        let b = g.add_node("b");
        g.add_edge(root, a).unwrap();
        g.add_edge(a, b).unwrap();
        g.add_edge(b, a).unwrap();

        match g.toposort() {
            Err(Error::CycleDetected { cycle }) => {
                assert_eq!(cycle, vec!["a".to_string(), "b".into()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn upstream_of_unknown_stage_fails() {
        let g = StageGraph::new();
        assert!(matches!(
            g.upstream("missing"),
            Err(Error::DagNodeNotFound { .. })
        ));
    }
}
