//! Queue transport seam and a non-durable in-process implementation.

use crate::types::{WorkflowOrchestratorInput, WorkflowStepInput};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// A unit of work delivered to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum QueueJob {
    /// Run one step of a run
    Step(WorkflowStepInput),
    /// Re-evaluate a run and schedule whatever is ready
    Orchestrate(WorkflowOrchestratorInput),
}

impl QueueJob {
    pub fn run_id(&self) -> crate::types::RunId {
        match self {
            QueueJob::Step(job) => job.run_id,
            QueueJob::Orchestrate(job) => job.run_id,
        }
    }
}

/// Delivers step and orchestration jobs to workers.
///
/// Implementations are expected to redeliver jobs whose handler failed;
/// the engine tolerates duplicates.
#[async_trait::async_trait]
pub trait QueueTransport: Send + Sync {
    /// Enqueue a step job, optionally delivered no earlier than `delay` from now
    async fn enqueue_step(&self, job: WorkflowStepInput, delay: Option<Duration>) -> Result<()>;

    async fn enqueue_orchestrator(&self, job: WorkflowOrchestratorInput) -> Result<()>;
}

/// A job together with how many times it has been handed out
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: QueueJob,
    pub attempt: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    delayed: Vec<(Instant, Delivery)>,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        let mut due: Vec<(Instant, Delivery)> = Vec::new();
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].0 <= now {
                due.push(self.delayed.swap_remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|(at, _)| *at);
        self.ready.extend(due.into_iter().map(|(_, delivery)| delivery));
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

/// In-memory queue with delayed delivery. Jobs are lost when the process exits.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, job: QueueJob, delay: Option<Duration>) {
        self.push_delivery(Delivery { job, attempt: 1 }, delay).await;
    }

    /// Hand a failed delivery back for another attempt
    pub async fn redeliver(&self, delivery: Delivery, delay: Option<Duration>) {
        let delivery = Delivery {
            attempt: delivery.attempt + 1,
            ..delivery
        };
        self.push_delivery(delivery, delay).await;
    }

    async fn push_delivery(&self, delivery: Delivery, delay: Option<Duration>) {
        let mut state = self.state.lock().await;
        match delay.filter(|d| !d.is_zero()) {
            Some(delay) => state.delayed.push((Instant::now() + delay, delivery)),
            None => state.ready.push_back(delivery),
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Take the next job that is due, without waiting
    pub async fn try_pop(&self) -> Option<Delivery> {
        let mut state = self.state.lock().await;
        state.promote_due(Instant::now());
        state.ready.pop_front()
    }

    /// Take the next job, sleeping until a delayed job is due.
    /// Returns `None` once nothing is queued at all.
    pub async fn pop(&self) -> Option<Delivery> {
        loop {
            let next_due = {
                let mut state = self.state.lock().await;
                state.promote_due(Instant::now());
                if let Some(delivery) = state.ready.pop_front() {
                    return Some(delivery);
                }
                state.next_due()?
            };
            tokio::time::sleep_until(next_due).await;
        }
    }

    /// Wait for the next job, however long that takes
    pub async fn recv(&self) -> Delivery {
        loop {
            let next_due = {
                let mut state = self.state.lock().await;
                state.promote_due(Instant::now());
                if let Some(delivery) = state.ready.pop_front() {
                    return delivery;
                }
                state.next_due()
            };

            match next_due {
                Some(at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Number of queued jobs, due or not
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.delayed.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl QueueTransport for InMemoryQueue {
    async fn enqueue_step(&self, job: WorkflowStepInput, delay: Option<Duration>) -> Result<()> {
        tracing::debug!(
            "Enqueue step job: run_id={}, step={}, delay={:?}",
            job.run_id,
            job.step_name,
            delay
        );
        self.push(QueueJob::Step(job), delay).await;
        Ok(())
    }

    async fn enqueue_orchestrator(&self, job: WorkflowOrchestratorInput) -> Result<()> {
        tracing::debug!("Enqueue orchestrator job: run_id={}", job.run_id);
        self.push(QueueJob::Orchestrate(job), None).await;
        Ok(())
    }
}
