use super::dag::WorkflowDag;
use super::path::{resolve_inputs, ResolutionContext};
use super::registry::WorkflowRegistry;
use super::step_executor::{RpcInvoker, StepExecutor, StepOutcome};
use crate::error::{WorkflowError, WorkflowResult};
use crate::queue::{InMemoryQueue, QueueJob, QueueTransport};
use crate::storage::{with_run_lock, LockPolicy, WorkflowStateStore};
use crate::types::{
    Next, RunId, RunStatus, SerializedError, SerializedNode, SerializedWorkflowGraph, StepKind,
    StepState, StepStatus, WorkflowOrchestratorInput, WorkflowRun, WorkflowStepInput,
    WorkflowVersion, DEFAULT_BRANCH,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Topology a run executes against, with its DAG view
struct Topology {
    graph: SerializedWorkflowGraph,
    dag: WorkflowDag,
}

impl Topology {
    fn new(graph: SerializedWorkflowGraph) -> WorkflowResult<Self> {
        let dag = WorkflowDag::from_graph(&graph)?;
        Ok(Self { graph, dag })
    }

    fn node(&self, node_id: &str) -> WorkflowResult<&SerializedNode> {
        self.graph
            .node(node_id)
            .ok_or_else(|| WorkflowError::NodeNotFound {
                workflow_name: self.graph.name.clone(),
                node_id: node_id.to_string(),
            })
    }
}

/// Errors that leave the run unable to make progress
fn fails_run(err: &WorkflowError) -> bool {
    !err.is_retryable()
        && !matches!(
            err,
            WorkflowError::RunNotFound(_) | WorkflowError::InvalidRunState { .. }
        )
}

/// Queue-driven control loop for workflow runs.
///
/// Every state change of a run happens under its run lock. Step effects run
/// outside the lock and only synchronize to record their outcome.
pub struct WorkflowOrchestrator {
    registry: Arc<WorkflowRegistry>,
    store: Arc<dyn WorkflowStateStore>,
    queue: Arc<dyn QueueTransport>,
    step_executor: StepExecutor,
    lock_policy: LockPolicy,
}

impl WorkflowOrchestrator {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        store: Arc<dyn WorkflowStateStore>,
        queue: Arc<dyn QueueTransport>,
        invoker: Arc<dyn RpcInvoker>,
    ) -> Self {
        let step_executor = StepExecutor::new(store.clone(), invoker);
        Self {
            registry,
            store,
            queue,
            step_executor,
            lock_policy: LockPolicy::default(),
        }
    }

    pub fn with_lock_policy(mut self, lock_policy: LockPolicy) -> Self {
        self.lock_policy = lock_policy;
        self
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStateStore> {
        &self.store
    }

    /// Create a run and hand it to the queue
    pub async fn start_workflow(&self, workflow_name: &str, input: Value) -> WorkflowResult<WorkflowRun> {
        let run = self.create_run(workflow_name, input, false).await?;
        self.queue
            .enqueue_orchestrator(WorkflowOrchestratorInput { run_id: run.id })
            .await?;
        Ok(run)
    }

    /// Create a run and drive it in-process until it comes to rest
    pub async fn run_workflow_inline(&self, workflow_name: &str, input: Value) -> WorkflowResult<WorkflowRun> {
        let run = self.create_run(workflow_name, input, true).await?;
        self.drive_inline(run.id).await?;
        self.get_run(run.id).await
    }

    async fn create_run(&self, workflow_name: &str, input: Value, inline: bool) -> WorkflowResult<WorkflowRun> {
        let meta = self
            .registry
            .get(workflow_name)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_name.to_string()))?;

        // Pin the topology so the run survives later definition changes
        self.store
            .upsert_workflow_version(&WorkflowVersion::from(meta))
            .await?;

        let mut run = WorkflowRun::new(&meta.name, input, &meta.graph_hash);
        run.inline = inline;
        self.store.create_run(&run).await?;

        tracing::info!(
            "Created run: run_id={}, workflow={}, graph_hash={}, inline={}",
            run.id,
            run.workflow_name,
            run.graph_hash,
            inline
        );
        Ok(run)
    }

    async fn drive_inline(&self, run_id: RunId) -> WorkflowResult<()> {
        let queue = InMemoryQueue::new();
        queue
            .enqueue_orchestrator(WorkflowOrchestratorInput { run_id })
            .await?;
        self.drain(&queue).await
    }

    async fn drain(&self, queue: &InMemoryQueue) -> WorkflowResult<()> {
        while let Some(delivery) = queue.pop().await {
            self.process(delivery.job, queue).await?;
        }
        Ok(())
    }

    /// Handle one job delivered by the queue transport
    pub async fn handle_job(&self, job: QueueJob) -> WorkflowResult<()> {
        self.process(job, self.queue.as_ref()).await
    }

    /// Re-evaluate a run and schedule whatever is ready
    pub async fn orchestrate(&self, job: WorkflowOrchestratorInput) -> WorkflowResult<()> {
        self.orchestrate_with(job.run_id, self.queue.as_ref()).await
    }

    /// Run one step and advance its run
    pub async fn execute_step(&self, job: &WorkflowStepInput) -> WorkflowResult<()> {
        self.execute_step_with(job, self.queue.as_ref()).await
    }

    async fn process(&self, job: QueueJob, queue: &dyn QueueTransport) -> WorkflowResult<()> {
        match job {
            QueueJob::Step(job) => self.execute_step_with(&job, queue).await,
            QueueJob::Orchestrate(job) => self.orchestrate_with(job.run_id, queue).await,
        }
    }

    async fn orchestrate_with(&self, run_id: RunId, queue: &dyn QueueTransport) -> WorkflowResult<()> {
        with_run_lock(self.store.as_ref(), run_id, &self.lock_policy, || async {
            let run = self.load_run(run_id).await?;
            self.reconcile_guarded(&run, queue).await
        })
        .await
    }

    async fn execute_step_with(&self, job: &WorkflowStepInput, queue: &dyn QueueTransport) -> WorkflowResult<()> {
        let run = self.load_run(job.run_id).await?;
        if run.status != RunStatus::Running {
            tracing::debug!(
                "Ignoring step {} of {:?} run {}",
                job.step_name,
                run.status,
                run.id
            );
            return Ok(());
        }

        let node = match self
            .load_topology(&run)
            .await
            .and_then(|topology| topology.node(&job.step_name).cloned())
        {
            Ok(node) => node,
            Err(e) => {
                if fails_run(&e) {
                    with_run_lock(self.store.as_ref(), run.id, &self.lock_policy, || {
                        self.fail_run(run.id, SerializedError::from(&e))
                    })
                    .await?;
                }
                return Err(e);
            }
        };

        let Some(step) = self.step_executor.begin(job).await? else {
            return Ok(());
        };

        let outcome = self
            .step_executor
            .dispatch(&node, job, step.attempt_count)
            .await;

        with_run_lock(self.store.as_ref(), run.id, &self.lock_policy, || {
            self.commit(run.id, &job.step_name, outcome, queue)
        })
        .await
    }

    /// Record a step outcome and advance the run. Caller holds the run lock.
    async fn commit(
        &self,
        run_id: RunId,
        step_id: &str,
        outcome: StepOutcome,
        queue: &dyn QueueTransport,
    ) -> WorkflowResult<()> {
        let run = self.load_run(run_id).await?;
        match run.status {
            RunStatus::Running | RunStatus::Suspended => {}
            status => {
                tracing::info!(
                    "Discarding result of step {}: run {} is {:?}",
                    step_id,
                    run_id,
                    status
                );
                return Ok(());
            }
        }

        let current = self.store.get_step_state(run_id, step_id).await?;
        if current.is_none_or(|step| step.status != StepStatus::Running) {
            tracing::debug!(
                "Discarding duplicate result of step {} for run {}",
                step_id,
                run_id
            );
            return Ok(());
        }

        self.step_executor.record(run_id, step_id, &outcome).await?;

        // A suspended run keeps results but schedules nothing until resumed
        if run.status == RunStatus::Suspended {
            return Ok(());
        }

        if let StepOutcome::Suspended { reason } = outcome {
            self.store
                .update_run_status(
                    run_id,
                    RunStatus::Suspended,
                    None,
                    Some(SerializedError::suspended(reason.clone())),
                )
                .await?;
            tracing::info!("Run {} suspended at step {}: {}", run_id, step_id, reason);
            return Ok(());
        }

        self.reconcile_guarded(&run, queue).await
    }

    async fn reconcile_guarded(&self, run: &WorkflowRun, queue: &dyn QueueTransport) -> WorkflowResult<()> {
        match self.reconcile(run, queue).await {
            Err(e) if fails_run(&e) => {
                self.fail_run(run.id, SerializedError::from(&e)).await?;
                Err(e)
            }
            other => other,
        }
    }

    /// Bring a running run up to date with its persisted steps.
    ///
    /// Succeeded steps advance along `next`, failed steps are retried or
    /// routed to `on_error`, and steps inserted but never scheduled are
    /// scheduled again. The run completes once nothing is in flight.
    async fn reconcile(&self, run: &WorkflowRun, queue: &dyn QueueTransport) -> WorkflowResult<()> {
        if run.status != RunStatus::Running {
            tracing::debug!("Run {} is {:?}, nothing to advance", run.id, run.status);
            return Ok(());
        }

        let topology = self.load_topology(run).await?;
        let mut steps: BTreeMap<String, StepState> = self
            .store
            .list_step_states(run.id)
            .await?
            .into_iter()
            .map(|step| (step.step_id.clone(), step))
            .collect();

        let mut candidates: Vec<String> = Vec::new();
        if steps.is_empty() {
            candidates.extend(topology.graph.entry_node_ids.iter().cloned());
        }

        let snapshot: Vec<StepState> = steps.values().cloned().collect();
        for step in &snapshot {
            match step.status {
                StepStatus::Succeeded => {
                    candidates.extend(next_targets(&topology, step)?);
                }
                StepStatus::Failed if step.can_retry() => {
                    let rescheduled = self.retry_step(run, &topology, &steps, step, queue).await?;
                    steps.insert(rescheduled.step_id.clone(), rescheduled);
                }
                StepStatus::Failed => {
                    let node = topology.node(&step.step_id)?;
                    match &node.on_error {
                        Some(on_error) => {
                            candidates.extend(on_error.ids().into_iter().map(str::to_string));
                        }
                        None => {
                            let error = step.error.clone().unwrap_or_else(|| {
                                SerializedError::new(format!("Step {} failed", step.step_id))
                            });
                            tracing::warn!(
                                "Run {} failed at step {}: {}",
                                run.id,
                                step.step_id,
                                error.message
                            );
                            self.store
                                .update_run_status(run.id, RunStatus::Failed, None, Some(error))
                                .await?;
                            return Ok(());
                        }
                    }
                }
                StepStatus::Pending => {
                    let scheduled = self
                        .schedule_node(run, &topology, &steps, &step.step_id, queue)
                        .await?;
                    steps.insert(scheduled.step_id.clone(), scheduled);
                }
                StepStatus::Scheduled | StepStatus::Running | StepStatus::Suspended => {}
            }
        }

        self.schedule_ready(run, &topology, &mut steps, candidates, queue)
            .await?;
        self.complete_if_settled(run, &topology, &steps).await
    }

    /// Schedule candidate nodes whose upstream work has settled.
    ///
    /// A candidate waits while an in-flight step or another candidate can
    /// still reach it, so join points run once, after all of their live
    /// predecessors.
    async fn schedule_ready(
        &self,
        run: &WorkflowRun,
        topology: &Topology,
        steps: &mut BTreeMap<String, StepState>,
        candidates: Vec<String>,
        queue: &dyn QueueTransport,
    ) -> WorkflowResult<()> {
        let mut waiting: Vec<String> = Vec::new();
        for id in candidates {
            if !steps.contains_key(&id) && !waiting.contains(&id) {
                waiting.push(id);
            }
        }

        loop {
            let ready: Vec<String> = waiting
                .iter()
                .filter(|id| {
                    let blocked_by_step = steps.values().any(|step| {
                        step.status.is_in_flight()
                            && step.step_id != **id
                            && topology.dag.can_reach(&step.step_id, id)
                    });
                    let blocked_by_candidate = waiting
                        .iter()
                        .any(|other| other != *id && topology.dag.can_reach(other, id));
                    !blocked_by_step && !blocked_by_candidate
                })
                .cloned()
                .collect();

            if ready.is_empty() {
                break;
            }

            for id in ready {
                let step = self.schedule_node(run, topology, steps, &id, queue).await?;
                steps.insert(id.clone(), step);
                waiting.retain(|w| w != &id);
            }
        }

        for id in &waiting {
            tracing::debug!("Run {}: node {} waits for upstream steps", run.id, id);
        }
        Ok(())
    }

    /// Insert, resolve and enqueue one node
    async fn schedule_node(
        &self,
        run: &WorkflowRun,
        topology: &Topology,
        steps: &BTreeMap<String, StepState>,
        node_id: &str,
        queue: &dyn QueueTransport,
    ) -> WorkflowResult<StepState> {
        let node = topology.node(node_id)?;
        self.store
            .insert_step_state(run.id, node_id, node.options())
            .await?;

        let job = match build_job(run, node, steps) {
            Ok(job) => job,
            Err(e) => {
                if e.is_resolution_error() {
                    self.store
                        .set_step_error(run.id, node_id, SerializedError::from(&e))
                        .await?;
                }
                return Err(e);
            }
        };

        let step = self.store.set_step_scheduled(run.id, node_id).await?;
        let delay = match node.kind {
            StepKind::Sleep { duration_ms } => Some(Duration::from_millis(duration_ms)),
            _ => None,
        };
        queue.enqueue_step(job, delay).await?;

        tracing::info!("Scheduled step {} for run {}", node_id, run.id);
        Ok(step)
    }

    async fn retry_step(
        &self,
        run: &WorkflowRun,
        topology: &Topology,
        steps: &BTreeMap<String, StepState>,
        step: &StepState,
        queue: &dyn QueueTransport,
    ) -> WorkflowResult<StepState> {
        let node = topology.node(&step.step_id)?;
        let job = build_job(run, node, steps)?;
        let delay = step
            .retry_delay
            .as_ref()
            .map(|policy| policy.delay_for(step.attempt_count));

        let rescheduled = self.store.set_step_scheduled(run.id, &step.step_id).await?;
        queue.enqueue_step(job, delay).await?;

        tracing::info!(
            "Retrying step {} for run {} (attempt {} of {}, delay {:?})",
            step.step_id,
            run.id,
            step.attempt_count + 1,
            step.retries.unwrap_or(0),
            delay
        );
        Ok(rescheduled)
    }

    async fn complete_if_settled(
        &self,
        run: &WorkflowRun,
        topology: &Topology,
        steps: &BTreeMap<String, StepState>,
    ) -> WorkflowResult<()> {
        if steps.values().any(|step| step.status.is_in_flight()) {
            return Ok(());
        }

        // The most recent terminal node provides the run output
        let output = steps
            .values()
            .filter(|step| {
                step.status == StepStatus::Succeeded
                    && topology
                        .graph
                        .node(&step.step_id)
                        .is_some_and(SerializedNode::is_terminal)
            })
            .max_by_key(|step| step.succeeded_at)
            .and_then(|step| step.result.clone())
            .unwrap_or(Value::Null);

        self.store
            .update_run_status(run.id, RunStatus::Completed, Some(output), None)
            .await?;
        tracing::info!("Run {} completed", run.id);
        Ok(())
    }

    async fn fail_run(&self, run_id: RunId, error: SerializedError) -> WorkflowResult<()> {
        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        tracing::error!("Run {} failed: {}", run_id, error.message);
        self.store
            .update_run_status(run_id, RunStatus::Failed, None, Some(error))
            .await?;
        Ok(())
    }

    /// Resolve the topology a run is pinned to.
    ///
    /// The live definition is used while its hash matches; otherwise the
    /// stored version for the run's hash takes over.
    async fn load_topology(&self, run: &WorkflowRun) -> WorkflowResult<Topology> {
        if let Some(meta) = self.registry.get(&run.workflow_name) {
            if meta.graph_hash == run.graph_hash {
                return Topology::new(meta.graph.clone());
            }
        }

        match self
            .store
            .get_workflow_version(&run.workflow_name, &run.graph_hash)
            .await?
        {
            Some(version) => {
                tracing::info!(
                    "Definition of {} changed since run {} started, using stored version {}",
                    run.workflow_name,
                    run.id,
                    run.graph_hash
                );
                Topology::new(version.graph)
            }
            None => Err(WorkflowError::MissingWorkflowVersion {
                workflow_name: run.workflow_name.clone(),
                graph_hash: run.graph_hash.clone(),
            }),
        }
    }

    async fn load_run(&self, run_id: RunId) -> WorkflowResult<WorkflowRun> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or(WorkflowError::RunNotFound(run_id))
    }

    pub async fn get_run(&self, run_id: RunId) -> WorkflowResult<WorkflowRun> {
        self.load_run(run_id).await
    }

    /// Continue a suspended run.
    ///
    /// Suspended steps succeed with `payload` (null when absent) and the run
    /// advances from its completed steps.
    pub async fn resume_workflow(&self, run_id: RunId, payload: Option<Value>) -> WorkflowResult<WorkflowRun> {
        let (run, stalled) = with_run_lock(self.store.as_ref(), run_id, &self.lock_policy, || async {
            let run = self.load_run(run_id).await?;
            if run.status != RunStatus::Suspended {
                return Err(WorkflowError::InvalidRunState {
                    run_id,
                    status: run.status,
                    expected: "suspended",
                });
            }

            let payload = payload.unwrap_or(Value::Null);
            let mut steps: BTreeMap<String, StepState> = BTreeMap::new();
            for step in self.store.list_step_states(run_id).await? {
                let step = if step.status == StepStatus::Suspended {
                    self.store
                        .set_step_succeeded(run_id, &step.step_id, payload.clone(), None)
                        .await?
                } else {
                    step
                };
                steps.insert(step.step_id.clone(), step);
            }

            // Jobs delivered while the run was suspended were dropped. Ones
            // still waiting in the queue turn into duplicates that `begin`
            // ignores, so only the time left on their delay is kept.
            let topology = self.load_topology(&run).await?;
            let now = Utc::now();
            let mut stalled = Vec::new();
            for step in steps.values().filter(|s| s.status == StepStatus::Scheduled) {
                let node = topology.node(&step.step_id)?;
                let job = build_job(&run, node, &steps)?;
                stalled.push((job, remaining_delay(node, step, now)));
            }

            let run = self
                .store
                .update_run_status(run_id, RunStatus::Running, None, None)
                .await?;
            tracing::info!("Resumed run {}", run_id);
            Ok((run, stalled))
        })
        .await?;

        if run.inline {
            let queue = InMemoryQueue::new();
            for (job, delay) in stalled {
                queue.enqueue_step(job, delay).await?;
            }
            queue
                .enqueue_orchestrator(WorkflowOrchestratorInput { run_id })
                .await?;
            self.drain(&queue).await?;
            return self.get_run(run_id).await;
        }

        for (job, delay) in stalled {
            self.queue.enqueue_step(job, delay).await?;
        }
        self.queue
            .enqueue_orchestrator(WorkflowOrchestratorInput { run_id })
            .await?;
        Ok(run)
    }

    /// Cancel a run. Returns false when it had already finished.
    pub async fn cancel_workflow(&self, run_id: RunId, reason: Option<String>) -> WorkflowResult<bool> {
        with_run_lock(self.store.as_ref(), run_id, &self.lock_policy, || async {
            let run = self.load_run(run_id).await?;
            if run.status.is_terminal() {
                tracing::debug!("Run {} already {:?}, not cancelling", run_id, run.status);
                return Ok(false);
            }

            let reason = reason.unwrap_or_else(|| "Workflow cancelled".to_string());
            self.store
                .update_run_status(
                    run_id,
                    RunStatus::Cancelled,
                    None,
                    Some(SerializedError::cancelled(reason)),
                )
                .await?;
            tracing::info!("Cancelled run {}", run_id);
            Ok(true)
        })
        .await
    }

    /// Remove a run with its steps and history
    pub async fn delete_run(&self, run_id: RunId) -> WorkflowResult<bool> {
        let deleted = self.store.delete_run(run_id).await?;
        if deleted {
            tracing::info!("Deleted run {}", run_id);
        }
        Ok(deleted)
    }
}

/// Node ids to follow after a succeeded step
fn next_targets(topology: &Topology, step: &StepState) -> WorkflowResult<Vec<String>> {
    let node = topology.node(&step.step_id)?;
    let target = match &node.next {
        None => return Ok(Vec::new()),
        Some(Next::Target(target)) => target,
        Some(Next::Branches(branches)) => step
            .branch
            .as_deref()
            .and_then(|key| branches.get(key))
            .or_else(|| branches.get(DEFAULT_BRANCH))
            .ok_or_else(|| WorkflowError::MissingBranchSelection {
                node_id: node.node_id.clone(),
                selected: step.branch.clone(),
            })?,
    };
    Ok(target.ids().into_iter().map(str::to_string).collect())
}

/// Time left before a scheduled step's job falls due.
///
/// Sleeps count from when they were scheduled, retries from the failure
/// that triggered them. `None` when the job is already due.
fn remaining_delay(node: &SerializedNode, step: &StepState, now: DateTime<Utc>) -> Option<Duration> {
    let due = match node.kind {
        StepKind::Sleep { duration_ms } => {
            let sleep = Duration::from_millis(duration_ms);
            step.scheduled_at? + chrono::Duration::from_std(sleep).ok()?
        }
        _ if step.attempt_count > 0 => {
            let delay = step.retry_delay.as_ref()?.delay_for(step.attempt_count);
            step.failed_at? + chrono::Duration::from_std(delay).ok()?
        }
        _ => return None,
    };
    (due - now).to_std().ok().filter(|left| !left.is_zero())
}

fn build_job(
    run: &WorkflowRun,
    node: &SerializedNode,
    steps: &BTreeMap<String, StepState>,
) -> WorkflowResult<WorkflowStepInput> {
    let context = ResolutionContext::from_steps(steps.values(), run.input.clone());
    let data = resolve_inputs(&node.input, &context)?;
    Ok(WorkflowStepInput {
        run_id: run.id,
        step_name: node.node_id.clone(),
        rpc_name: node.kind.rpc_name().map(str::to_string),
        data: Value::Object(data),
    })
}
