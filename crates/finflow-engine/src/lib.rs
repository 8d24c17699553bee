//! Workflow orchestration: compiles a step graph into waves and runs each
//! wave concurrently, with per-step retries, timeouts and cooperative
//! cancellation.

pub mod aggregator;
pub mod context;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod run_log;

pub use aggregator::{finalize, RunSummary, WorkflowResult};
pub use context::{ExecutionContext, RunMetadata};
pub use engine::{RunLookup, WorkflowEngine};
pub use executor::StepExecutor;
pub use graph::{compile, ExecutionPlan};
pub use orchestrator::Orchestrator;
pub use registry::{AgentRegistry, PreparedWorkflow, ResolvedStep};
pub use run_log::RunLogger;
