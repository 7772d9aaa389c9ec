use crate::error::{WorkflowError, WorkflowResult};
use crate::types::{
    InputValue, Next, NextTarget, RpcSchema, SerializedNode, SerializedWorkflowGraph, StepKind,
    WorkflowRuntimeMeta, WorkflowSource,
};
use crate::workflow::dag::WorkflowDag;
use crate::workflow::hash::graph_hash;
use crate::workflow::path::{parse_path, validate_path, PathSegment, TRIGGER_ROOT};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Build-time description of a workflow, before normalization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub function_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub body: WorkflowBody,
}

/// Definition body, tagged by source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum WorkflowBody {
    /// Steps chained in declaration order
    Dsl { steps: Vec<DslEntry> },
    /// Same shape as `dsl`, extracted from code the inspector could not fully analyze
    Complex { steps: Vec<DslEntry> },
    /// Explicit node graph
    Graph {
        nodes: Vec<SerializedNode>,
        entry_node_ids: Vec<String>,
    },
}

/// One position in a DSL sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DslEntry {
    /// Steps that run concurrently and join into the next entry
    Parallel { parallel: Vec<SerializedNode> },
    Step(SerializedNode),
}

impl DslEntry {
    fn nodes(&self) -> &[SerializedNode] {
        match self {
            DslEntry::Parallel { parallel } => parallel,
            DslEntry::Step(node) => std::slice::from_ref(node),
        }
    }
}

/// Contents of a build-time metadata file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildMetadata {
    #[serde(default)]
    pub rpcs: BTreeMap<String, RpcSchema>,
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
}

/// Normalized workflow definitions by name.
///
/// Populated once at process start, then shared read-only with the
/// orchestrator and executor.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, WorkflowRuntimeMeta>,
    rpc_schemas: HashMap<String, RpcSchema>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from one metadata document.
    pub fn from_metadata(metadata: BuildMetadata) -> WorkflowResult<Self> {
        let mut registry = Self::new();
        registry.extend(metadata)?;
        Ok(registry)
    }

    /// Load every `*.json` metadata file below `dir`.
    pub fn load_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut combined = BuildMetadata::default();

        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.context("Failed to walk workflow metadata directory")?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let metadata: BuildMetadata = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;

            tracing::debug!(
                "Loaded {} workflows from {}",
                metadata.workflows.len(),
                path.display()
            );
            combined.rpcs.extend(metadata.rpcs);
            combined.workflows.extend(metadata.workflows);
        }

        Ok(Self::from_metadata(combined)?)
    }

    fn extend(&mut self, metadata: BuildMetadata) -> WorkflowResult<()> {
        self.rpc_schemas.extend(metadata.rpcs);
        for definition in metadata.workflows {
            self.register(definition)?;
        }
        Ok(())
    }

    /// Register the schema fingerprints of a remote procedure; hashes of
    /// already-registered workflows are recomputed.
    pub fn register_rpc(&mut self, rpc_name: impl Into<String>, schema: RpcSchema) {
        self.rpc_schemas.insert(rpc_name.into(), schema);
        for meta in self.workflows.values_mut() {
            meta.graph_hash = graph_hash(&meta.graph, &self.rpc_schemas);
        }
    }

    /// Normalize, validate and hash a definition.
    pub fn register(&mut self, definition: WorkflowDefinition) -> WorkflowResult<&WorkflowRuntimeMeta> {
        let name = definition.name.clone();
        if name.trim().is_empty() {
            return Err(WorkflowError::invalid_definition(name, "workflow name is empty"));
        }
        if self.workflows.contains_key(&name) {
            return Err(WorkflowError::invalid_definition(name, "workflow registered twice"));
        }

        let meta = normalize(definition, &self.rpc_schemas)?;
        tracing::info!(
            "Registered workflow {} ({:?}, {} nodes, hash {})",
            meta.name,
            meta.source,
            meta.graph.nodes.len(),
            meta.graph_hash
        );

        Ok(&*self.workflows.entry(name).or_insert(meta))
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowRuntimeMeta> {
        self.workflows.get(name)
    }

    /// All registered workflows, sorted by name
    pub fn workflows(&self) -> Vec<&WorkflowRuntimeMeta> {
        let mut workflows: Vec<_> = self.workflows.values().collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        workflows
    }

    pub fn rpc_schemas(&self) -> &HashMap<String, RpcSchema> {
        &self.rpc_schemas
    }
}

/// Turn any definition source into the unified runtime shape.
pub fn normalize(
    definition: WorkflowDefinition,
    schemas: &HashMap<String, RpcSchema>,
) -> WorkflowResult<WorkflowRuntimeMeta> {
    let name = definition.name;
    let (source, graph) = match definition.body {
        WorkflowBody::Dsl { steps } => (WorkflowSource::Dsl, chain_steps(&name, steps)?),
        WorkflowBody::Complex { steps } => (WorkflowSource::Complex, chain_steps(&name, steps)?),
        WorkflowBody::Graph {
            nodes,
            entry_node_ids,
        } => (WorkflowSource::Graph, collect_nodes(&name, nodes, entry_node_ids)?),
    };

    validate_graph(&graph)?;

    Ok(WorkflowRuntimeMeta {
        function_id: definition.function_id.unwrap_or_else(|| name.clone()),
        graph_hash: graph_hash(&graph, schemas),
        name,
        source,
        graph,
        title: definition.title,
        description: definition.description,
        tags: definition.tags,
    })
}

fn chain_steps(name: &str, entries: Vec<DslEntry>) -> WorkflowResult<SerializedWorkflowGraph> {
    let positions: Vec<Vec<String>> = entries
        .iter()
        .map(|entry| entry.nodes().iter().map(|n| n.node_id.clone()).collect())
        .collect();

    let mut nodes = Vec::new();
    for (index, entry) in entries.into_iter().enumerate() {
        if entry.nodes().is_empty() {
            return Err(WorkflowError::invalid_definition(
                name,
                format!("parallel group at position {} is empty", index),
            ));
        }
        let next = match positions.get(index + 1).map(Vec::as_slice) {
            None => None,
            Some([single]) => Some(Next::Target(NextTarget::One(single.clone()))),
            Some(many) => Some(Next::Target(NextTarget::Many(many.to_vec()))),
        };

        let members = match entry {
            DslEntry::Parallel { parallel } => parallel,
            DslEntry::Step(node) => vec![node],
        };
        for mut node in members {
            if node.next.is_some() {
                return Err(WorkflowError::invalid_definition(
                    name,
                    format!("dsl step '{}' must not declare next", node.node_id),
                ));
            }
            node.next = next.clone();
            nodes.push(node);
        }
    }

    let entry_node_ids = positions.into_iter().next().unwrap_or_default();
    collect_nodes(name, nodes, entry_node_ids)
}

fn collect_nodes(
    name: &str,
    nodes: Vec<SerializedNode>,
    entry_node_ids: Vec<String>,
) -> WorkflowResult<SerializedWorkflowGraph> {
    let mut by_id = BTreeMap::new();
    for node in nodes {
        let node_id = node.node_id.clone();
        if by_id.insert(node_id.clone(), node).is_some() {
            return Err(WorkflowError::invalid_definition(
                name,
                format!("duplicate node id '{}'", node_id),
            ));
        }
    }
    Ok(SerializedWorkflowGraph {
        name: name.to_string(),
        nodes: by_id,
        entry_node_ids,
    })
}

fn validate_graph(graph: &SerializedWorkflowGraph) -> WorkflowResult<()> {
    let invalid = |reason: String| WorkflowError::invalid_definition(&graph.name, reason);

    if graph.nodes.is_empty() {
        return Err(invalid("workflow has no nodes".to_string()));
    }
    if graph.entry_node_ids.is_empty() {
        return Err(invalid("workflow has no entry nodes".to_string()));
    }
    for entry in &graph.entry_node_ids {
        if !graph.nodes.contains_key(entry) {
            return Err(invalid(format!("entry node '{}' does not exist", entry)));
        }
    }

    for node in graph.nodes.values() {
        let id = &node.node_id;
        if id.is_empty() || id.contains(['.', '[', ']', '/']) {
            return Err(invalid(format!("invalid node id '{}'", id)));
        }
        if id == TRIGGER_ROOT {
            return Err(invalid(format!("node id '{}' is reserved", TRIGGER_ROOT)));
        }

        match (&node.kind, &node.next) {
            (StepKind::Branch { .. }, Some(Next::Branches(_))) => {}
            (StepKind::Branch { .. }, _) => {
                return Err(invalid(format!("branch node '{}' needs a next map", id)));
            }
            (StepKind::Parallel, Some(Next::Target(NextTarget::Many(_)))) => {}
            (StepKind::Parallel, _) => {
                return Err(invalid(format!("parallel node '{}' needs a list of next nodes", id)));
            }
            _ => {}
        }

        for (input_name, input) in &node.input {
            let InputValue::Ref { path } = input else {
                continue;
            };
            let validation = validate_path(path);
            if let Some(error) = validation.error {
                return Err(invalid(format!("input '{}' of '{}': {}", input_name, id, error)));
            }
            if let Ok(segments) = parse_path(path) {
                if let Some(PathSegment::Property(root)) = segments.first() {
                    if root != TRIGGER_ROOT && !graph.nodes.contains_key(root) {
                        return Err(invalid(format!(
                            "input '{}' of '{}' references unknown node '{}'",
                            input_name, id, root
                        )));
                    }
                }
            }
        }
    }

    let dag = WorkflowDag::from_graph(graph)?;
    let unreachable = dag.unreachable_from(&graph.entry_node_ids);
    if let Some(orphan) = unreachable.first() {
        return Err(invalid(format!("node '{}' is unreachable", orphan)));
    }

    Ok(())
}
