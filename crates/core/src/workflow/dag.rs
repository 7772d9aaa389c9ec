use crate::error::{WorkflowError, WorkflowResult};
use crate::types::SerializedWorkflowGraph;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap};

/// Kind of edge between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Next,
    OnError,
}

/// DAG view of a workflow topology used for validation and join readiness
pub struct WorkflowDag {
    graph: DiGraph<String, EdgeKind>,
    node_indices: HashMap<String, NodeIndex>,
}

impl WorkflowDag {
    /// Build a DAG from a serialized topology, rejecting dangling edges and cycles
    pub fn from_graph(workflow: &SerializedWorkflowGraph) -> WorkflowResult<Self> {
        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();

        for node_id in workflow.nodes.keys() {
            let index = graph.add_node(node_id.clone());
            node_indices.insert(node_id.clone(), index);
        }

        let lookup = |from: &str, to: &str| {
            node_indices.get(to).copied().ok_or_else(|| {
                WorkflowError::invalid_definition(
                    &workflow.name,
                    format!("node '{}' points at unknown node '{}'", from, to),
                )
            })
        };

        let mut edges = Vec::new();
        for node in workflow.nodes.values() {
            let from = node_indices[&node.node_id];
            if let Some(next) = &node.next {
                for target in next.all_ids() {
                    edges.push((from, lookup(&node.node_id, target)?, EdgeKind::Next));
                }
            }
            if let Some(on_error) = &node.on_error {
                for target in on_error.ids() {
                    edges.push((from, lookup(&node.node_id, target)?, EdgeKind::OnError));
                }
            }
        }
        for (from, to, kind) in edges {
            graph.add_edge(from, to, kind);
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(WorkflowError::invalid_definition(
                &workflow.name,
                "workflow contains circular dependencies",
            ));
        }

        Ok(Self {
            graph,
            node_indices,
        })
    }

    /// Distinct upstream nodes of a node
    pub fn predecessors(&self, node_id: &str) -> BTreeSet<&str> {
        let Some(index) = self.node_indices.get(node_id) else {
            return BTreeSet::new();
        };
        self.graph
            .neighbors_directed(*index, petgraph::Direction::Incoming)
            .map(|n| self.graph[n].as_str())
            .collect()
    }

    /// Check if a node has more than one upstream node
    pub fn is_join_point(&self, node_id: &str) -> bool {
        self.predecessors(node_id).len() > 1
    }

    /// Check if `to` is reachable from `from` along any edge
    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        match (self.node_indices.get(from), self.node_indices.get(to)) {
            (Some(a), Some(b)) => has_path_connecting(&self.graph, *a, *b, None),
            _ => false,
        }
    }

    /// Nodes no entry point can reach
    pub fn unreachable_from<'a>(&'a self, entries: &[String]) -> Vec<&'a str> {
        self.node_indices
            .keys()
            .filter(|id| !entries.iter().any(|entry| self.can_reach(entry, id)))
            .map(String::as_str)
            .collect()
    }
}
