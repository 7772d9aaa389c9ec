//! Error types for the workflow engine.

use crate::types::{RunId, RunStatus, SerializedError};

/// Result type for engine operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors raised while resolving, orchestrating or persisting a run.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// A ref path is malformed or does not address `output`/`error`.
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// A ref points at a step that has not completed in this run.
    #[error("Unresolved reference '{path}': step '{step_id}' has not completed")]
    UnresolvedReference { path: String, step_id: String },

    /// A branching node finished without a usable branch key.
    #[error("Node '{node_id}' selected {} and has no default branch", describe_selection(.selected))]
    MissingBranchSelection {
        node_id: String,
        selected: Option<String>,
    },

    /// Another worker held the run lock for the whole wait budget.
    #[error("Timed out acquiring lock for run {run_id} after {attempts} attempts")]
    LockAcquisitionTimeout { run_id: RunId, attempts: u32 },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// A run is pinned to a topology that was never stored.
    #[error("No stored version of workflow '{workflow_name}' for graph hash {graph_hash}")]
    MissingWorkflowVersion {
        workflow_name: String,
        graph_hash: String,
    },

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Node '{node_id}' not found in workflow '{workflow_name}'")]
    NodeNotFound {
        workflow_name: String,
        node_id: String,
    },

    #[error("Run {run_id} is {status:?}, expected it to be {expected}")]
    InvalidRunState {
        run_id: RunId,
        status: RunStatus,
        expected: &'static str,
    },

    #[error("Invalid workflow definition '{workflow_name}': {reason}")]
    InvalidDefinition {
        workflow_name: String,
        reason: String,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

fn describe_selection(selected: &Option<String>) -> String {
    match selected {
        Some(key) => format!("unknown branch '{}'", key),
        None => "no branch".to_string(),
    }
}

impl WorkflowError {
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_definition(workflow_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            workflow_name: workflow_name.into(),
            reason: reason.into(),
        }
    }

    /// Stable code persisted alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPath { .. } => "INVALID_PATH",
            Self::UnresolvedReference { .. } => "UNRESOLVED_REFERENCE",
            Self::MissingBranchSelection { .. } => "MISSING_BRANCH_SELECTION",
            Self::LockAcquisitionTimeout { .. } => "LOCK_ACQUISITION_TIMEOUT",
            Self::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            Self::MissingWorkflowVersion { .. } => "MISSING_WORKFLOW_VERSION",
            Self::RunNotFound(_) => "RUN_NOT_FOUND",
            Self::NodeNotFound { .. } => "NODE_NOT_FOUND",
            Self::InvalidRunState { .. } => "INVALID_RUN_STATE",
            Self::InvalidDefinition { .. } => "INVALID_DEFINITION",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Check if a queue redelivery could make this error go away.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockAcquisitionTimeout { .. } | Self::Storage(_))
    }

    /// Resolution errors point at a definition bug and are never retried.
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath { .. } | Self::UnresolvedReference { .. }
        )
    }
}

impl From<&WorkflowError> for SerializedError {
    fn from(err: &WorkflowError) -> Self {
        SerializedError {
            message: err.to_string(),
            stack: None,
            code: Some(err.code().to_string()),
        }
    }
}

/// Failure reported by a remote procedure, carrying a caller-visible code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RpcFailure {
    pub code: String,
    pub message: String,
}

impl RpcFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
