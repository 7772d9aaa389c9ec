use crate::error::WorkflowResult;
use crate::storage::WorkflowStateStore;
use crate::types::{
    RunId, SerializedError, SerializedNode, StepKind, StepState, StepStatus, WorkflowStepInput,
};
use serde_json::Value;
use std::sync::Arc;

/// What a single step execution produced.
///
/// Suspension is an outcome of its own, never an error, so generic failure
/// handling cannot swallow it.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded {
        output: Value,
        branch: Option<String>,
    },
    Failed(SerializedError),
    Suspended {
        reason: String,
    },
}

/// Handle given to a remote procedure to steer the run from inside a step
#[derive(Debug, Clone)]
pub struct StepWire {
    run_id: RunId,
    step_id: String,
    attempt: u32,
    branch: Option<String>,
    suspension: Option<String>,
}

impl StepWire {
    pub fn new(run_id: RunId, step_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            attempt,
            branch: None,
            suspension: None,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Select which `next` branch the run follows after this step
    pub fn branch(&mut self, key: impl Into<String>) {
        self.branch = Some(key.into());
    }

    /// Halt the run after this step until it is resumed
    pub fn suspend(&mut self, reason: impl Into<String>) {
        self.suspension = Some(reason.into());
    }

    pub fn selected_branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn suspension(&self) -> Option<&str> {
        self.suspension.as_deref()
    }
}

/// External collaborator that performs remote procedure calls
#[async_trait::async_trait]
pub trait RpcInvoker: Send + Sync {
    async fn invoke(&self, rpc_name: &str, input: Value, wire: &mut StepWire) -> anyhow::Result<Value>;
}

/// Executes one step and records what it produced
pub struct StepExecutor {
    store: Arc<dyn WorkflowStateStore>,
    invoker: Arc<dyn RpcInvoker>,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn WorkflowStateStore>, invoker: Arc<dyn RpcInvoker>) -> Self {
        Self { store, invoker }
    }

    /// Start a new attempt of the step named by `job`.
    ///
    /// Returns `None` when the job is stale: the step is unknown or has
    /// already settled as succeeded, failed or suspended.
    pub async fn begin(&self, job: &WorkflowStepInput) -> WorkflowResult<Option<StepState>> {
        let Some(step) = self
            .store
            .get_step_state(job.run_id, &job.step_name)
            .await?
        else {
            tracing::warn!(
                "Dropping job for unknown step: run_id={}, step={}",
                job.run_id,
                job.step_name
            );
            return Ok(None);
        };

        match step.status {
            StepStatus::Pending | StepStatus::Scheduled | StepStatus::Running => {
                let step = self
                    .store
                    .set_step_running(job.run_id, &job.step_name)
                    .await?;
                tracing::info!(
                    "Executing step {} (attempt {}) for run {}",
                    step.step_id,
                    step.attempt_count,
                    step.run_id
                );
                Ok(Some(step))
            }
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Suspended => {
                tracing::debug!(
                    "Skipping stale job: run_id={}, step={}, status={:?}",
                    job.run_id,
                    job.step_name,
                    step.status
                );
                Ok(None)
            }
        }
    }

    /// Run the node's effect. Never touches the store.
    pub async fn dispatch(&self, node: &SerializedNode, job: &WorkflowStepInput, attempt: u32) -> StepOutcome {
        match &node.kind {
            StepKind::Rpc { rpc_name } => {
                let mut wire = StepWire::new(job.run_id, &node.node_id, attempt);
                let result = self
                    .invoker
                    .invoke(rpc_name, job.data.clone(), &mut wire)
                    .await;

                if let Some(reason) = wire.suspension {
                    return StepOutcome::Suspended { reason };
                }
                match result {
                    Ok(output) => StepOutcome::Succeeded {
                        output,
                        branch: wire.branch,
                    },
                    Err(e) => {
                        tracing::warn!(
                            "Step {} failed calling {}: {:#}",
                            node.node_id,
                            rpc_name,
                            e
                        );
                        StepOutcome::Failed(SerializedError::from_anyhow(&e))
                    }
                }
            }
            // The delay was applied when the job was enqueued
            StepKind::Sleep { .. } => StepOutcome::Succeeded {
                output: Value::Null,
                branch: None,
            },
            StepKind::Branch { on } => StepOutcome::Succeeded {
                output: job.data.clone(),
                branch: job.data.get(on).and_then(branch_key),
            },
            StepKind::Parallel | StepKind::Return => StepOutcome::Succeeded {
                output: job.data.clone(),
                branch: None,
            },
            StepKind::Suspend { reason } => StepOutcome::Suspended {
                reason: reason.clone(),
            },
        }
    }

    /// Persist the outcome of an attempt
    pub async fn record(
        &self,
        run_id: RunId,
        step_id: &str,
        outcome: &StepOutcome,
    ) -> WorkflowResult<StepState> {
        let step = match outcome {
            StepOutcome::Succeeded { output, branch } => {
                tracing::info!("Step {} succeeded for run {}", step_id, run_id);
                self.store
                    .set_step_succeeded(run_id, step_id, output.clone(), branch.clone())
                    .await?
            }
            StepOutcome::Failed(error) => {
                tracing::info!(
                    "Step {} failed for run {}: {}",
                    step_id,
                    run_id,
                    error.message
                );
                self.store
                    .set_step_error(run_id, step_id, error.clone())
                    .await?
            }
            StepOutcome::Suspended { reason } => {
                tracing::info!("Step {} suspended run {}: {}", step_id, run_id, reason);
                self.store
                    .set_step_suspended(run_id, step_id, SerializedError::suspended(reason.clone()))
                    .await?
            }
        };
        Ok(step)
    }
}

/// Branch keys may be given as strings, numbers or booleans
fn branch_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcFailure;
    use crate::storage::RedbStateStore;
    use crate::types::StepOptions;
    use serde_json::json;
    use tempfile::TempDir;

    struct ScriptedInvoker;

    #[async_trait::async_trait]
    impl RpcInvoker for ScriptedInvoker {
        async fn invoke(&self, rpc_name: &str, input: Value, wire: &mut StepWire) -> anyhow::Result<Value> {
            match rpc_name {
                "echo" => Ok(input),
                "pick" => {
                    wire.branch("gold");
                    Ok(json!({"tier": "gold"}))
                }
                "approve" => {
                    wire.suspend("Needs approval");
                    Ok(Value::Null)
                }
                "decline" => Err(RpcFailure::new("CARD_DECLINED", "card declined").into()),
                other => anyhow::bail!("unknown rpc {}", other),
            }
        }
    }

    fn executor() -> (TempDir, Arc<dyn WorkflowStateStore>, StepExecutor) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn WorkflowStateStore> =
            Arc::new(RedbStateStore::new(dir.path().join("state.redb")).unwrap());
        let executor = StepExecutor::new(store.clone(), Arc::new(ScriptedInvoker));
        (dir, store, executor)
    }

    fn rpc_node(rpc_name: &str) -> SerializedNode {
        SerializedNode::new(
            "step",
            StepKind::Rpc {
                rpc_name: rpc_name.to_string(),
            },
        )
    }

    fn job(data: Value) -> WorkflowStepInput {
        WorkflowStepInput {
            run_id: RunId::new(),
            step_name: "step".to_string(),
            rpc_name: None,
            data,
        }
    }

    #[tokio::test]
    async fn test_rpc_outcomes() {
        let (_dir, _store, executor) = executor();

        let outcome = executor.dispatch(&rpc_node("echo"), &job(json!({"a": 1})), 1).await;
        assert_eq!(
            outcome,
            StepOutcome::Succeeded {
                output: json!({"a": 1}),
                branch: None
            }
        );

        let outcome = executor.dispatch(&rpc_node("pick"), &job(json!({})), 1).await;
        assert!(matches!(outcome, StepOutcome::Succeeded { branch: Some(ref b), .. } if b == "gold"));

        let outcome = executor.dispatch(&rpc_node("approve"), &job(json!({})), 1).await;
        assert_eq!(
            outcome,
            StepOutcome::Suspended {
                reason: "Needs approval".to_string()
            }
        );

        match executor.dispatch(&rpc_node("decline"), &job(json!({})), 1).await {
            StepOutcome::Failed(error) => {
                assert_eq!(error.code.as_deref(), Some("CARD_DECLINED"));
                assert_eq!(error.message, "card declined");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inline_kinds() {
        let (_dir, _store, executor) = executor();

        let branch = SerializedNode::new("route", StepKind::Branch { on: "plan".to_string() });
        let outcome = executor.dispatch(&branch, &job(json!({"plan": "pro"})), 1).await;
        assert!(matches!(outcome, StepOutcome::Succeeded { branch: Some(ref b), .. } if b == "pro"));

        let outcome = executor.dispatch(&branch, &job(json!({"plan": 3})), 1).await;
        assert!(matches!(outcome, StepOutcome::Succeeded { branch: Some(ref b), .. } if b == "3"));

        let outcome = executor.dispatch(&branch, &job(json!({})), 1).await;
        assert!(matches!(outcome, StepOutcome::Succeeded { branch: None, .. }));

        let ret = SerializedNode::new("done", StepKind::Return);
        let outcome = executor.dispatch(&ret, &job(json!({"x": true})), 1).await;
        assert_eq!(
            outcome,
            StepOutcome::Succeeded {
                output: json!({"x": true}),
                branch: None
            }
        );

        let sleep = SerializedNode::new("wait", StepKind::Sleep { duration_ms: 10 });
        let outcome = executor.dispatch(&sleep, &job(json!({})), 1).await;
        assert!(matches!(outcome, StepOutcome::Succeeded { output: Value::Null, .. }));
    }

    #[tokio::test]
    async fn test_begin_skips_settled_steps() {
        let (_dir, store, executor) = executor();
        let job = job(json!({}));

        assert!(executor.begin(&job).await.unwrap().is_none());

        store
            .insert_step_state(job.run_id, "step", StepOptions::default())
            .await
            .unwrap();
        let running = executor.begin(&job).await.unwrap().unwrap();
        assert_eq!(running.status, StepStatus::Running);
        assert_eq!(running.attempt_count, 1);

        executor
            .record(
                job.run_id,
                "step",
                &StepOutcome::Succeeded {
                    output: json!(1),
                    branch: None,
                },
            )
            .await
            .unwrap();
        assert!(executor.begin(&job).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_suspension() {
        let (_dir, store, executor) = executor();
        let job = job(json!({}));
        store
            .insert_step_state(job.run_id, "step", StepOptions::default())
            .await
            .unwrap();
        executor.begin(&job).await.unwrap();

        let step = executor
            .record(
                job.run_id,
                "step",
                &StepOutcome::Suspended {
                    reason: "Needs approval".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(step.status, StepStatus::Suspended);
        let error = step.error.unwrap();
        assert_eq!(error.code.as_deref(), Some(crate::types::WORKFLOW_SUSPENDED));
        assert_eq!(error.message, "Needs approval");
    }
}
