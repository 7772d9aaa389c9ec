//! Worker pool that drains an [`InMemoryQueue`] through the orchestrator.

use crate::error::WorkflowResult;
use crate::queue::{Delivery, InMemoryQueue};
use crate::workflow::WorkflowOrchestrator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Jobs handled at the same time
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Deliveries of one job before it is dropped
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_redelivery_delay_ms() -> u64 {
    1000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_deliveries: default_max_deliveries(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
        }
    }
}

/// Processes queued jobs with bounded concurrency
pub struct Worker {
    orchestrator: Arc<WorkflowOrchestrator>,
    queue: Arc<InMemoryQueue>,
    config: WorkerConfig,
}

type Handled = (Delivery, WorkflowResult<()>);

impl Worker {
    pub fn new(orchestrator: Arc<WorkflowOrchestrator>, queue: Arc<InMemoryQueue>, config: WorkerConfig) -> Self {
        Self {
            orchestrator,
            queue,
            config,
        }
    }

    fn spawn(&self, tasks: &mut JoinSet<Handled>, delivery: Delivery) {
        let orchestrator = self.orchestrator.clone();
        tasks.spawn(async move {
            let result = orchestrator.handle_job(delivery.job.clone()).await;
            (delivery, result)
        });
    }

    /// Hand failed deliveries back to the queue while the error is
    /// transient and the delivery budget lasts.
    async fn settle(&self, joined: Result<Handled, tokio::task::JoinError>) {
        let (delivery, result) = match joined {
            Ok(handled) => handled,
            Err(e) => {
                tracing::error!("Job handler panicked: {}", e);
                return;
            }
        };

        let Err(err) = result else {
            return;
        };

        let run_id = delivery.job.run_id();
        if err.is_retryable() && delivery.attempt < self.config.max_deliveries {
            tracing::warn!(
                "Job for run {} failed (delivery {}/{}), redelivering: {}",
                run_id,
                delivery.attempt,
                self.config.max_deliveries,
                err
            );
            let delay = Duration::from_millis(self.config.redelivery_delay_ms);
            self.queue.redeliver(delivery, Some(delay)).await;
        } else {
            tracing::error!(
                "Dropping job for run {} after {} deliveries: [{}] {}",
                run_id,
                delivery.attempt,
                err.code(),
                err
            );
        }
    }

    /// Process jobs until the queue is empty and nothing is running.
    /// Returns the number of jobs handled.
    pub async fn run_until_idle(&self) -> usize {
        let concurrency = self.config.concurrency.max(1);
        let mut tasks = JoinSet::new();
        let mut handled = 0;

        loop {
            while tasks.len() < concurrency {
                match self.queue.try_pop().await {
                    Some(delivery) => self.spawn(&mut tasks, delivery),
                    None => break,
                }
            }

            if tasks.is_empty() {
                // Nothing running, so only delayed jobs can be left
                match self.queue.pop().await {
                    Some(delivery) => {
                        self.spawn(&mut tasks, delivery);
                        continue;
                    }
                    None => break,
                }
            }

            if let Some(joined) = tasks.join_next().await {
                handled += 1;
                self.settle(joined).await;
            }
        }

        handled
    }

    /// Process jobs until `shutdown` fires, then wait for running jobs.
    pub async fn run(&self, shutdown: CancellationToken) {
        let concurrency = self.config.concurrency.max(1);
        let mut tasks = JoinSet::new();

        tracing::info!("Worker started with concurrency {}", concurrency);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = self.queue.recv(), if tasks.len() < concurrency => {
                    self.spawn(&mut tasks, delivery);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.settle(joined).await;
                }
            }
        }

        tracing::info!("Worker shutting down, waiting for {} running jobs", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            self.settle(joined).await;
        }
    }
}
