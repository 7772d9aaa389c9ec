use super::WorkflowStateStore;
use crate::types::{
    RunId, RunStatus, SerializedError, StepHistoryEntry, StepOptions, StepState, StepStatus,
    WorkflowRun, WorkflowVersion,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadOnlyTable, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");
const STEPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("steps");
const STEP_HISTORY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("step_history");
const VERSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_versions");
const RUN_LOCKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("run_locks");

/// Lease stored in the run lock table
#[derive(Debug, Serialize, Deserialize)]
struct RunLease {
    holder: String,
    expires_at: DateTime<Utc>,
}

// Step keys are "run/step", history keys "run/step/seq". Node ids never
// contain '/', so a run's records sort together and '0' (the byte after
// '/') closes the range.
fn step_key(run_id: RunId, step_id: &str) -> String {
    format!("{}/{}", run_id, step_id)
}

fn history_key(run_id: RunId, step_id: &str, seq: usize) -> String {
    format!("{}/{}/{:010}", run_id, step_id, seq)
}

fn version_key(workflow_name: &str, graph_hash: &str) -> String {
    format!("{}@{}", workflow_name, graph_hash)
}

fn scan<T: DeserializeOwned>(
    table: &ReadOnlyTable<&'static str, &'static [u8]>,
    start: &str,
    end: &str,
) -> Result<Vec<T>> {
    let mut items = Vec::new();
    for item in table.range(start..end).context("Failed to scan table")? {
        let (_key, value) = item.context("Failed to read item")?;
        items.push(serde_json::from_slice(value.value()).context("Failed to deserialize record")?);
    }
    Ok(items)
}

/// Durable workflow state backed by a single redb file
#[derive(Clone)]
pub struct RedbStateStore {
    db: Arc<Database>,
}

impl RedbStateStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;
            write_txn
                .open_table(STEPS_TABLE)
                .context("Failed to open steps table")?;
            write_txn
                .open_table(STEP_HISTORY_TABLE)
                .context("Failed to open step history table")?;
            write_txn
                .open_table(VERSIONS_TABLE)
                .context("Failed to open workflow versions table")?;
            write_txn
                .open_table(RUN_LOCKS_TABLE)
                .context("Failed to open run locks table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put_run(&self, run: &WorkflowRun) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;

            let key = run.id.to_string();
            let value = serde_json::to_vec(run).context("Failed to serialize run")?;

            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert run")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    pub fn get_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let key = run_id.to_string();
        let value = table.get(key.as_str()).context("Failed to get run")?;

        match value {
            Some(guard) => {
                let run = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize run")?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    pub fn list_runs(&self, workflow_name: Option<&str>) -> Result<Vec<WorkflowRun>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let mut runs = Vec::new();
        for item in table.iter().context("Failed to iterate runs")? {
            let (_key, value) = item.context("Failed to read item")?;
            let run: WorkflowRun =
                serde_json::from_slice(value.value()).context("Failed to deserialize run")?;
            if workflow_name.is_none_or(|name| run.workflow_name == name) {
                runs.push(run);
            }
        }

        // Most recent first
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(runs)
    }

    /// Read, check and write the run in one transaction so a terminal run
    /// is never reopened, with or without the run lock held.
    pub fn update_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        output: Option<Value>,
        error: Option<SerializedError>,
    ) -> Result<WorkflowRun> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let run = {
            let mut table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;
            let key = run_id.to_string();

            let mut run: WorkflowRun = match table.get(key.as_str()).context("Failed to get run")? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).context("Failed to deserialize run")?
                }
                None => anyhow::bail!("Run not found: {}", run_id),
            };

            anyhow::ensure!(
                !run.status.is_terminal() || run.status == status,
                "Run {} is already {:?}",
                run_id,
                run.status
            );

            run.status = status;
            run.output = output;
            run.error = error;
            run.updated_at = Utc::now();

            let value = serde_json::to_vec(&run).context("Failed to serialize run")?;
            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to update run")?;
            run
        };
        write_txn.commit().context("Failed to commit")?;

        Ok(run)
    }

    pub fn delete_run(&self, run_id: RunId) -> Result<bool> {
        let start = format!("{}/", run_id);
        let end = format!("{}0", run_id);

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let existed = {
            let mut runs = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;
            let key = run_id.to_string();
            let existed = runs
                .remove(key.as_str())
                .context("Failed to delete run")?
                .is_some();

            for definition in [STEPS_TABLE, STEP_HISTORY_TABLE] {
                let mut table = write_txn
                    .open_table(definition)
                    .context("Failed to open table")?;
                let mut keys = Vec::new();
                for item in table
                    .range(start.as_str()..end.as_str())
                    .context("Failed to scan table")?
                {
                    let (key, _value) = item.context("Failed to read item")?;
                    keys.push(key.value().to_string());
                }
                for key in keys {
                    table.remove(key.as_str()).context("Failed to delete record")?;
                }
            }

            let mut locks = write_txn
                .open_table(RUN_LOCKS_TABLE)
                .context("Failed to open table")?;
            locks.remove(key.as_str()).context("Failed to delete lock")?;

            existed
        };
        write_txn.commit().context("Failed to commit")?;

        Ok(existed)
    }

    pub fn get_step_state(&self, run_id: RunId, step_id: &str) -> Result<Option<StepState>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(STEPS_TABLE).context("Failed to open table")?;

        let key = step_key(run_id, step_id);
        let value = table.get(key.as_str()).context("Failed to get step")?;

        match value {
            Some(guard) => {
                let step = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize step")?;
                Ok(Some(step))
            }
            None => Ok(None),
        }
    }

    pub fn list_step_states(&self, run_id: RunId) -> Result<Vec<StepState>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(STEPS_TABLE).context("Failed to open table")?;
        scan(&table, &format!("{}/", run_id), &format!("{}0", run_id))
    }

    pub fn insert_step_state(
        &self,
        run_id: RunId,
        step_id: &str,
        options: StepOptions,
    ) -> Result<StepState> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let step = {
            let mut steps = write_txn
                .open_table(STEPS_TABLE)
                .context("Failed to open table")?;
            let key = step_key(run_id, step_id);

            let existing: Option<StepState> = match steps.get(key.as_str()).context("Failed to get step")? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).context("Failed to deserialize step")?,
                ),
                None => None,
            };
            if let Some(existing) = existing {
                return Ok(existing);
            }

            let step = StepState::pending(run_id, step_id, options);
            let value = serde_json::to_vec(&step).context("Failed to serialize step")?;
            steps
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert step")?;

            let mut history = write_txn
                .open_table(STEP_HISTORY_TABLE)
                .context("Failed to open table")?;
            let entry = serde_json::to_vec(&StepHistoryEntry::from(&step))
                .context("Failed to serialize history entry")?;
            history
                .insert(history_key(run_id, step_id, 0).as_str(), entry.as_slice())
                .context("Failed to append history")?;

            step
        };
        write_txn.commit().context("Failed to commit")?;

        Ok(step)
    }

    /// Apply a validated status transition and append it to the step history.
    fn transition<F>(
        &self,
        run_id: RunId,
        step_id: &str,
        target: StepStatus,
        apply: F,
    ) -> Result<StepState>
    where
        F: FnOnce(&mut StepState, DateTime<Utc>),
    {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let (step, changed) = {
            let mut steps = write_txn
                .open_table(STEPS_TABLE)
                .context("Failed to open table")?;
            let key = step_key(run_id, step_id);

            let mut step: StepState = match steps.get(key.as_str()).context("Failed to get step")? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).context("Failed to deserialize step")?
                }
                None => anyhow::bail!("Step not found: {}", key),
            };

            if step.status == target && target != StepStatus::Running {
                (step, false)
            } else {
                anyhow::ensure!(
                    step.status.can_transition_to(target),
                    "Invalid step transition for {}: {:?} -> {:?}",
                    key,
                    step.status,
                    target
                );

                step.status = target;
                apply(&mut step, Utc::now());

                let value = serde_json::to_vec(&step).context("Failed to serialize step")?;
                steps
                    .insert(key.as_str(), value.as_slice())
                    .context("Failed to update step")?;

                let mut history = write_txn
                    .open_table(STEP_HISTORY_TABLE)
                    .context("Failed to open table")?;
                let start = format!("{}/", key);
                let end = format!("{}0", key);
                let seq = history
                    .range(start.as_str()..end.as_str())
                    .context("Failed to scan history")?
                    .count();
                let entry = serde_json::to_vec(&StepHistoryEntry::from(&step))
                    .context("Failed to serialize history entry")?;
                history
                    .insert(history_key(run_id, step_id, seq).as_str(), entry.as_slice())
                    .context("Failed to append history")?;

                (step, true)
            }
        };

        if changed {
            write_txn.commit().context("Failed to commit")?;
        } else {
            write_txn.abort().context("Failed to abort")?;
        }

        Ok(step)
    }

    pub fn set_step_scheduled(&self, run_id: RunId, step_id: &str) -> Result<StepState> {
        self.transition(run_id, step_id, StepStatus::Scheduled, |step, now| {
            step.scheduled_at = Some(now);
        })
    }

    pub fn set_step_running(&self, run_id: RunId, step_id: &str) -> Result<StepState> {
        self.transition(run_id, step_id, StepStatus::Running, |step, now| {
            step.attempt_count += 1;
            step.running_at = Some(now);
            step.result = None;
            step.error = None;
            step.branch = None;
        })
    }

    pub fn set_step_succeeded(
        &self,
        run_id: RunId,
        step_id: &str,
        result: Value,
        branch: Option<String>,
    ) -> Result<StepState> {
        self.transition(run_id, step_id, StepStatus::Succeeded, |step, now| {
            step.succeeded_at = Some(now);
            step.result = Some(result);
            step.error = None;
            step.branch = branch;
        })
    }

    pub fn set_step_error(
        &self,
        run_id: RunId,
        step_id: &str,
        error: SerializedError,
    ) -> Result<StepState> {
        self.transition(run_id, step_id, StepStatus::Failed, |step, now| {
            step.failed_at = Some(now);
            step.error = Some(error);
        })
    }

    pub fn set_step_suspended(
        &self,
        run_id: RunId,
        step_id: &str,
        reason: SerializedError,
    ) -> Result<StepState> {
        self.transition(run_id, step_id, StepStatus::Suspended, |step, now| {
            step.suspended_at = Some(now);
            step.error = Some(reason);
        })
    }

    pub fn get_step_history(&self, run_id: RunId, step_id: &str) -> Result<Vec<StepHistoryEntry>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(STEP_HISTORY_TABLE)
            .context("Failed to open table")?;
        let key = step_key(run_id, step_id);
        scan(&table, &format!("{}/", key), &format!("{}0", key))
    }

    pub fn upsert_workflow_version(&self, version: &WorkflowVersion) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(VERSIONS_TABLE)
                .context("Failed to open table")?;

            let key = version_key(&version.workflow_name, &version.graph_hash);
            let exists = table
                .get(key.as_str())
                .context("Failed to get workflow version")?
                .is_some();
            if !exists {
                let value =
                    serde_json::to_vec(version).context("Failed to serialize workflow version")?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .context("Failed to insert workflow version")?;
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    pub fn get_workflow_version(
        &self,
        workflow_name: &str,
        graph_hash: &str,
    ) -> Result<Option<WorkflowVersion>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(VERSIONS_TABLE)
            .context("Failed to open table")?;

        let key = version_key(workflow_name, graph_hash);
        let value = table
            .get(key.as_str())
            .context("Failed to get workflow version")?;

        match value {
            Some(guard) => {
                let version = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize workflow version")?;
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    pub fn list_workflow_versions(&self, workflow_name: &str) -> Result<Vec<WorkflowVersion>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(VERSIONS_TABLE)
            .context("Failed to open table")?;

        // '@' is followed by 'A'; names containing '@' can still overlap
        let mut versions: Vec<WorkflowVersion> = scan(
            &table,
            &format!("{}@", workflow_name),
            &format!("{}A", workflow_name),
        )?;
        versions.retain(|v| v.workflow_name == workflow_name);
        versions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        Ok(versions)
    }

    pub fn try_acquire_run_lock(&self, run_id: RunId, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).context("Lock TTL out of range")?;

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let acquired = {
            let mut table = write_txn
                .open_table(RUN_LOCKS_TABLE)
                .context("Failed to open table")?;
            let key = run_id.to_string();

            let current: Option<RunLease> = match table.get(key.as_str()).context("Failed to get lock")? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).context("Failed to deserialize lock")?)
                }
                None => None,
            };

            let held_by_other = current
                .is_some_and(|lease| lease.holder != holder && lease.expires_at > now);
            if !held_by_other {
                let lease = RunLease {
                    holder: holder.to_string(),
                    expires_at,
                };
                let value = serde_json::to_vec(&lease).context("Failed to serialize lock")?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .context("Failed to insert lock")?;
            }
            !held_by_other
        };
        write_txn.commit().context("Failed to commit")?;

        Ok(acquired)
    }

    pub fn release_run_lock(&self, run_id: RunId, holder: &str) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(RUN_LOCKS_TABLE)
                .context("Failed to open table")?;
            let key = run_id.to_string();

            let current: Option<RunLease> = match table.get(key.as_str()).context("Failed to get lock")? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).context("Failed to deserialize lock")?)
                }
                None => None,
            };

            if current.is_some_and(|lease| lease.holder == holder) {
                table.remove(key.as_str()).context("Failed to remove lock")?;
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl WorkflowStateStore for RedbStateStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        self.put_run(run)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>> {
        RedbStateStore::get_run(self, run_id)
    }

    async fn list_runs(&self, workflow_name: Option<&str>) -> Result<Vec<WorkflowRun>> {
        RedbStateStore::list_runs(self, workflow_name)
    }

    async fn update_run_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        output: Option<Value>,
        error: Option<SerializedError>,
    ) -> Result<WorkflowRun> {
        RedbStateStore::update_run_status(self, run_id, status, output, error)
    }

    async fn delete_run(&self, run_id: RunId) -> Result<bool> {
        RedbStateStore::delete_run(self, run_id)
    }

    async fn get_step_state(&self, run_id: RunId, step_id: &str) -> Result<Option<StepState>> {
        RedbStateStore::get_step_state(self, run_id, step_id)
    }

    async fn list_step_states(&self, run_id: RunId) -> Result<Vec<StepState>> {
        RedbStateStore::list_step_states(self, run_id)
    }

    async fn insert_step_state(
        &self,
        run_id: RunId,
        step_id: &str,
        options: StepOptions,
    ) -> Result<StepState> {
        RedbStateStore::insert_step_state(self, run_id, step_id, options)
    }

    async fn set_step_scheduled(&self, run_id: RunId, step_id: &str) -> Result<StepState> {
        RedbStateStore::set_step_scheduled(self, run_id, step_id)
    }

    async fn set_step_running(&self, run_id: RunId, step_id: &str) -> Result<StepState> {
        RedbStateStore::set_step_running(self, run_id, step_id)
    }

    async fn set_step_succeeded(
        &self,
        run_id: RunId,
        step_id: &str,
        result: Value,
        branch: Option<String>,
    ) -> Result<StepState> {
        RedbStateStore::set_step_succeeded(self, run_id, step_id, result, branch)
    }

    async fn set_step_error(
        &self,
        run_id: RunId,
        step_id: &str,
        error: SerializedError,
    ) -> Result<StepState> {
        RedbStateStore::set_step_error(self, run_id, step_id, error)
    }

    async fn set_step_suspended(
        &self,
        run_id: RunId,
        step_id: &str,
        reason: SerializedError,
    ) -> Result<StepState> {
        RedbStateStore::set_step_suspended(self, run_id, step_id, reason)
    }

    async fn get_step_history(&self, run_id: RunId, step_id: &str) -> Result<Vec<StepHistoryEntry>> {
        RedbStateStore::get_step_history(self, run_id, step_id)
    }

    async fn upsert_workflow_version(&self, version: &WorkflowVersion) -> Result<()> {
        RedbStateStore::upsert_workflow_version(self, version)
    }

    async fn get_workflow_version(
        &self,
        workflow_name: &str,
        graph_hash: &str,
    ) -> Result<Option<WorkflowVersion>> {
        RedbStateStore::get_workflow_version(self, workflow_name, graph_hash)
    }

    async fn list_workflow_versions(&self, workflow_name: &str) -> Result<Vec<WorkflowVersion>> {
        RedbStateStore::list_workflow_versions(self, workflow_name)
    }

    async fn try_acquire_run_lock(&self, run_id: RunId, holder: &str, ttl: Duration) -> Result<bool> {
        RedbStateStore::try_acquire_run_lock(self, run_id, holder, ttl)
    }

    async fn release_run_lock(&self, run_id: RunId, holder: &str) -> Result<()> {
        RedbStateStore::release_run_lock(self, run_id, holder)
    }
}
