pub mod lock;
pub mod state_store;

pub use lock::{with_run_lock, LockPolicy};
pub use state_store::RedbStateStore;

use crate::types::{
    RunId, RunStatus, SerializedError, StepHistoryEntry, StepOptions, StepState, WorkflowRun,
    WorkflowVersion,
};
use anyhow::Result;
use serde_json::Value;
use std::time::Duration;

/// Persistence contract for runs, steps, topology versions and run locks.
///
/// Every write must be safe to repeat: jobs are delivered at least once.
/// Step setters validate the transition and append to the step history in
/// the same atomic write; repeating a setter whose target status is already
/// recorded returns the stored step without appending again. The one
/// exception is `set_step_running`, which always starts a new attempt.
#[async_trait::async_trait]
pub trait WorkflowStateStore: Send + Sync {
    /// Persist a new run
    async fn create_run(&self, run: &WorkflowRun) -> Result<()>;

    /// Get a run by ID
    async fn get_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>>;

    /// List runs, most recent first, optionally for one workflow
    async fn list_runs(&self, workflow_name: Option<&str>) -> Result<Vec<WorkflowRun>>;

    /// Set status, output and error of a run; terminal runs cannot change
    async fn update_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        output: Option<Value>,
        error: Option<SerializedError>,
    ) -> Result<WorkflowRun>;

    /// Remove a run with all of its steps and history
    async fn delete_run(&self, run_id: RunId) -> Result<bool>;

    async fn get_step_state(&self, run_id: RunId, step_id: &str) -> Result<Option<StepState>>;

    /// All steps of a run, ordered by step id
    async fn list_step_states(&self, run_id: RunId) -> Result<Vec<StepState>>;

    /// Insert a pending step; returns the existing record if there is one
    async fn insert_step_state(
        &self,
        run_id: RunId,
        step_id: &str,
        options: StepOptions,
    ) -> Result<StepState>;

    async fn set_step_scheduled(&self, run_id: RunId, step_id: &str) -> Result<StepState>;

    /// Start a new attempt
    async fn set_step_running(&self, run_id: RunId, step_id: &str) -> Result<StepState>;

    async fn set_step_succeeded(
        &self,
        run_id: RunId,
        step_id: &str,
        result: Value,
        branch: Option<String>,
    ) -> Result<StepState>;

    async fn set_step_error(
        &self,
        run_id: RunId,
        step_id: &str,
        error: SerializedError,
    ) -> Result<StepState>;

    async fn set_step_suspended(
        &self,
        run_id: RunId,
        step_id: &str,
        reason: SerializedError,
    ) -> Result<StepState>;

    /// Append-only transition log of one step, oldest first
    async fn get_step_history(&self, run_id: RunId, step_id: &str) -> Result<Vec<StepHistoryEntry>>;

    /// Store a topology version unless one already exists for its key
    async fn upsert_workflow_version(&self, version: &WorkflowVersion) -> Result<()>;

    async fn get_workflow_version(
        &self,
        workflow_name: &str,
        graph_hash: &str,
    ) -> Result<Option<WorkflowVersion>>;

    /// Stored versions of a workflow, oldest first
    async fn list_workflow_versions(&self, workflow_name: &str) -> Result<Vec<WorkflowVersion>>;

    /// Take the run lock for `holder` unless another holder has an unexpired lease
    async fn try_acquire_run_lock(&self, run_id: RunId, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release the run lock if `holder` still owns it
    async fn release_run_lock(&self, run_id: RunId, holder: &str) -> Result<()>;
}
