use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::workflow::retry::RetryDelay;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal runs never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Status of a single step attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Suspended,
}

impl StepStatus {
    /// A step that still owes the run a result.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            StepStatus::Pending | StepStatus::Scheduled | StepStatus::Running | StepStatus::Suspended
        )
    }

    /// Whether a step may move from `self` to `next`.
    ///
    /// `Running -> Running` and `Failed -> Scheduled` start a new attempt,
    /// `Pending -> Failed` covers inputs that could not be resolved and
    /// `Suspended -> Succeeded` is the resume path.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Pending, Running)
                | (Pending, Failed)
                | (Scheduled, Running)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Suspended)
                | (Failed, Scheduled)
                | (Suspended, Succeeded)
        )
    }
}

/// Error shape persisted on runs and steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub const WORKFLOW_SUSPENDED: &str = "WORKFLOW_SUSPENDED";
pub const WORKFLOW_CANCELLED: &str = "WORKFLOW_CANCELLED";

impl SerializedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn suspended(reason: impl Into<String>) -> Self {
        Self::new(reason).with_code(WORKFLOW_SUSPENDED)
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(reason).with_code(WORKFLOW_CANCELLED)
    }

    /// Capture an error from an external collaborator, keeping the cause chain.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let code = err
            .downcast_ref::<crate::error::RpcFailure>()
            .map(|failure| failure.code.clone());
        Self {
            message: err.to_string(),
            stack: Some(format!("{:?}", err)),
            code,
        }
    }
}

/// One execution instance of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow_name: String,
    pub status: RunStatus,
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<SerializedError>,
    /// Topology version the run was started against; never changes.
    pub graph_hash: String,
    #[serde(default)]
    pub inline: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(workflow_name: impl Into<String>, input: Value, graph_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Running,
            input,
            output: None,
            error: None,
            graph_hash: graph_hash.into(),
            inline: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Retry budget copied onto a step when it is first inserted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOptions {
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_delay: Option<RetryDelay>,
}

/// Execution record of one node within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub run_id: RunId,
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<SerializedError>,
    /// Branch key selected by the step's own execution.
    #[serde(default)]
    pub branch: Option<String>,
    pub attempt_count: u32,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_delay: Option<RetryDelay>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub running_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub succeeded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub suspended_at: Option<DateTime<Utc>>,
}

impl StepState {
    pub fn pending(run_id: RunId, step_id: impl Into<String>, options: StepOptions) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            branch: None,
            attempt_count: 0,
            retries: options.retries,
            retry_delay: options.retry_delay,
            created_at: Utc::now(),
            scheduled_at: None,
            running_at: None,
            succeeded_at: None,
            failed_at: None,
            suspended_at: None,
        }
    }

    /// True while the retry budget allows another attempt after a failure.
    ///
    /// `retries` bounds the total number of attempts.
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.retries.unwrap_or(0)
    }
}

/// Immutable audit entry appended on every step transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepHistoryEntry {
    pub run_id: RunId,
    pub step_id: String,
    pub attempt: u32,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<SerializedError>,
    #[serde(default)]
    pub branch: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl From<&StepState> for StepHistoryEntry {
    fn from(step: &StepState) -> Self {
        Self {
            run_id: step.run_id,
            step_id: step.step_id.clone(),
            attempt: step.attempt_count,
            status: step.status,
            result: step.result.clone(),
            error: step.error.clone(),
            branch: step.branch.clone(),
            recorded_at: Utc::now(),
        }
    }
}

/// A step input: either a literal or a reference to another step's result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputValue {
    Literal { value: Value },
    Ref { path: String },
}

impl InputValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        InputValue::Literal {
            value: value.into(),
        }
    }

    pub fn reference(path: impl Into<String>) -> Self {
        InputValue::Ref { path: path.into() }
    }
}

/// One node id or a list of node ids scheduled together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextTarget {
    One(String),
    Many(Vec<String>),
}

impl NextTarget {
    pub fn ids(&self) -> Vec<&str> {
        match self {
            NextTarget::One(id) => vec![id.as_str()],
            NextTarget::Many(ids) => ids.iter().map(String::as_str).collect(),
        }
    }
}

/// Outgoing edges of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Next {
    Target(NextTarget),
    Branches(BTreeMap<String, NextTarget>),
}

pub const DEFAULT_BRANCH: &str = "default";

impl Next {
    /// Every node id this edge set can lead to.
    pub fn all_ids(&self) -> Vec<&str> {
        match self {
            Next::Target(target) => target.ids(),
            Next::Branches(branches) => branches.values().flat_map(NextTarget::ids).collect(),
        }
    }
}

/// What a node does when executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Call a named remote procedure with the resolved input
    Rpc { rpc_name: String },
    /// Wait for a fixed duration before succeeding
    Sleep { duration_ms: u64 },
    /// Select a branch from the named input field
    Branch { on: String },
    /// Pass the input through and fan out to every `next` target
    Parallel,
    /// Halt the run until it is resumed
    Suspend { reason: String },
    /// The resolved input becomes the step output
    Return,
}

impl StepKind {
    pub fn rpc_name(&self) -> Option<&str> {
        match self {
            StepKind::Rpc { rpc_name } => Some(rpc_name),
            _ => None,
        }
    }
}

/// Storage form of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedNode {
    pub node_id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub input: BTreeMap<String, InputValue>,
    #[serde(default)]
    pub next: Option<Next>,
    #[serde(default)]
    pub on_error: Option<NextTarget>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_delay: Option<RetryDelay>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl SerializedNode {
    pub fn new(node_id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            input: BTreeMap::new(),
            next: None,
            on_error: None,
            retries: None,
            retry_delay: None,
            title: None,
            description: None,
        }
    }

    pub fn options(&self) -> StepOptions {
        StepOptions {
            retries: self.retries,
            retry_delay: self.retry_delay.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next.is_none()
    }
}

/// Immutable topology of one workflow version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedWorkflowGraph {
    pub name: String,
    pub nodes: BTreeMap<String, SerializedNode>,
    pub entry_node_ids: Vec<String>,
}

impl SerializedWorkflowGraph {
    pub fn node(&self, node_id: &str) -> Option<&SerializedNode> {
        self.nodes.get(node_id)
    }
}

/// Where a workflow definition came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowSource {
    Dsl,
    Complex,
    Graph,
}

/// Normalized runtime description of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRuntimeMeta {
    pub name: String,
    pub function_id: String,
    pub source: WorkflowSource,
    pub graph: SerializedWorkflowGraph,
    pub graph_hash: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Stored topology for `(workflow_name, graph_hash)`, written once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub workflow_name: String,
    pub graph_hash: String,
    pub source: WorkflowSource,
    pub graph: SerializedWorkflowGraph,
    pub created_at: DateTime<Utc>,
}

impl From<&WorkflowRuntimeMeta> for WorkflowVersion {
    fn from(meta: &WorkflowRuntimeMeta) -> Self {
        Self {
            workflow_name: meta.name.clone(),
            graph_hash: meta.graph_hash.clone(),
            source: meta.source,
            graph: meta.graph.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Input/output schema fingerprints of a remote procedure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcSchema {
    #[serde(default)]
    pub input_schema_hash: Option<String>,
    #[serde(default)]
    pub output_schema_hash: Option<String>,
}

/// Queue payload: run one step of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepInput {
    pub run_id: RunId,
    pub step_name: String,
    #[serde(default)]
    pub rpc_name: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// Queue payload: re-evaluate a run and schedule whatever is ready
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOrchestratorInput {
    pub run_id: RunId,
}
