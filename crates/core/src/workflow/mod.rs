pub mod dag;
pub mod hash;
pub mod orchestrator;
pub mod path;
pub mod registry;
pub mod retry;
pub mod step_executor;

pub use dag::WorkflowDag;
pub use hash::graph_hash;
pub use orchestrator::WorkflowOrchestrator;
pub use path::{parse_path, resolve_input_value, resolve_inputs, validate_path, ResolutionContext};
pub use registry::{BuildMetadata, WorkflowDefinition, WorkflowRegistry};
pub use retry::RetryDelay;
pub use step_executor::{RpcInvoker, StepExecutor, StepOutcome, StepWire};
