//! Topology fingerprints.
//!
//! The hash covers node ids, node kinds and the procedures they call, the
//! `next`/`on_error` edges, the entry order and the schema hashes of every
//! referenced procedure. Titles, descriptions, tags, literal inputs and
//! retry settings are left out so cosmetic edits never strand running
//! instances.

use crate::types::{Next, NextTarget, RpcSchema, SerializedNode, SerializedWorkflowGraph, StepKind};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Compute the topology hash of a graph.
pub fn graph_hash(graph: &SerializedWorkflowGraph, schemas: &HashMap<String, RpcSchema>) -> String {
    let mut hasher = Sha256::new();

    write_tag(&mut hasher, "entry");
    write_len(&mut hasher, graph.entry_node_ids.len());
    for entry in &graph.entry_node_ids {
        write_str(&mut hasher, entry);
    }

    // BTreeMap iteration keeps node order independent of definition order
    write_tag(&mut hasher, "nodes");
    write_len(&mut hasher, graph.nodes.len());
    for node in graph.nodes.values() {
        write_node(&mut hasher, node, schemas);
    }

    hex::encode(hasher.finalize())
}

fn write_node(hasher: &mut Sha256, node: &SerializedNode, schemas: &HashMap<String, RpcSchema>) {
    write_str(hasher, &node.node_id);
    write_str(hasher, kind_tag(&node.kind));

    if let Some(rpc_name) = node.kind.rpc_name() {
        write_str(hasher, rpc_name);
        let schema = schemas.get(rpc_name).cloned().unwrap_or_default();
        write_opt(hasher, schema.input_schema_hash.as_deref());
        write_opt(hasher, schema.output_schema_hash.as_deref());
    }

    match &node.next {
        None => write_tag(hasher, "end"),
        Some(Next::Target(target)) => {
            write_tag(hasher, "next");
            write_target(hasher, target);
        }
        Some(Next::Branches(branches)) => {
            write_tag(hasher, "branches");
            write_len(hasher, branches.len());
            for (key, target) in branches {
                write_str(hasher, key);
                write_target(hasher, target);
            }
        }
    }

    match &node.on_error {
        None => write_tag(hasher, "no_error_route"),
        Some(target) => {
            write_tag(hasher, "on_error");
            write_target(hasher, target);
        }
    }
}

fn kind_tag(kind: &StepKind) -> &'static str {
    match kind {
        StepKind::Rpc { .. } => "rpc",
        StepKind::Sleep { .. } => "sleep",
        StepKind::Branch { .. } => "branch",
        StepKind::Parallel => "parallel",
        StepKind::Suspend { .. } => "suspend",
        StepKind::Return => "return",
    }
}

fn write_target(hasher: &mut Sha256, target: &NextTarget) {
    match target {
        NextTarget::One(id) => {
            write_tag(hasher, "one");
            write_str(hasher, id);
        }
        NextTarget::Many(ids) => {
            write_tag(hasher, "many");
            write_len(hasher, ids.len());
            for id in ids {
                write_str(hasher, id);
            }
        }
    }
}

// Length prefixes keep ("ab", "c") and ("a", "bc") apart.
fn write_str(hasher: &mut Sha256, value: &str) {
    write_len(hasher, value.len());
    hasher.update(value.as_bytes());
}

fn write_opt(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        Some(v) => {
            hasher.update([1u8]);
            write_str(hasher, v);
        }
        None => hasher.update([0u8]),
    }
}

fn write_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_be_bytes());
}

fn write_tag(hasher: &mut Sha256, tag: &str) {
    write_str(hasher, tag);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InputValue, SerializedNode};
    use std::collections::BTreeMap;

    fn rpc(id: &str, rpc_name: &str, next: Option<&str>) -> SerializedNode {
        let mut node = SerializedNode::new(
            id,
            StepKind::Rpc {
                rpc_name: rpc_name.to_string(),
            },
        );
        node.next = next.map(|n| Next::Target(NextTarget::One(n.to_string())));
        node
    }

    fn graph(nodes: Vec<SerializedNode>) -> SerializedWorkflowGraph {
        SerializedWorkflowGraph {
            name: "onboard".to_string(),
            entry_node_ids: vec![nodes[0].node_id.clone()],
            nodes: nodes
                .into_iter()
                .map(|n| (n.node_id.clone(), n))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn schemas() -> HashMap<String, RpcSchema> {
        let mut schemas = HashMap::new();
        schemas.insert(
            "createOrg".to_string(),
            RpcSchema {
                input_schema_hash: Some("in-1".to_string()),
                output_schema_hash: Some("out-1".to_string()),
            },
        );
        schemas
    }

    fn base() -> SerializedWorkflowGraph {
        graph(vec![
            rpc("create", "createOrg", Some("notify")),
            rpc("notify", "sendEmail", None),
        ])
    }

    #[test]
    fn test_hash_is_stable() {
        let first = graph_hash(&base(), &schemas());
        let second = graph_hash(&base(), &schemas());
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_metadata_does_not_change_hash() {
        let mut decorated = base();
        for node in decorated.nodes.values_mut() {
            node.title = Some("Pretty title".to_string());
            node.description = Some("Something helpful".to_string());
            node.input
                .insert("note".to_string(), InputValue::literal("cosmetic"));
        }
        assert_eq!(graph_hash(&base(), &schemas()), graph_hash(&decorated, &schemas()));
    }

    #[test]
    fn test_schema_change_changes_hash() {
        let mut changed = schemas();
        changed.get_mut("createOrg").unwrap().output_schema_hash = Some("out-2".to_string());
        assert_ne!(graph_hash(&base(), &schemas()), graph_hash(&base(), &changed));
    }

    #[test]
    fn test_edge_change_changes_hash() {
        let mut rewired = base();
        rewired.nodes.get_mut("create").unwrap().on_error =
            Some(NextTarget::One("notify".to_string()));
        assert_ne!(graph_hash(&base(), &schemas()), graph_hash(&rewired, &schemas()));

        let swapped = graph(vec![
            rpc("notify", "sendEmail", Some("create")),
            rpc("create", "createOrg", None),
        ]);
        assert_ne!(graph_hash(&base(), &schemas()), graph_hash(&swapped, &schemas()));
    }

    #[test]
    fn test_entry_order_changes_hash() {
        let mut a = base();
        a.entry_node_ids = vec!["create".to_string(), "notify".to_string()];
        let mut b = base();
        b.entry_node_ids = vec!["notify".to_string(), "create".to_string()];
        assert_ne!(graph_hash(&a, &schemas()), graph_hash(&b, &schemas()));
    }
}
