// Core engine for Keel durable workflows

pub mod error;
pub mod queue;
pub mod storage;
pub mod types;
pub mod worker;
pub mod workflow;

pub use error::{RpcFailure, WorkflowError, WorkflowResult};
pub use queue::{InMemoryQueue, QueueJob, QueueTransport};
pub use storage::{with_run_lock, LockPolicy, RedbStateStore, WorkflowStateStore};
pub use types::*;
pub use worker::{Worker, WorkerConfig};
