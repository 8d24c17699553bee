use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::AgentError;
use crate::types::{AgentContext, StepInput};

/// An opaque unit of work scheduled by the engine.
///
/// Retries re-invoke `execute` with identical input, so implementations
/// must tolerate repeated calls. Long-running work should poll
/// `ctx.is_cancelled()` and return early.
pub trait Agent: Send + Sync + 'static {
    fn execute(
        &self,
        input: StepInput,
        ctx: AgentContext,
    ) -> BoxFuture<'_, std::result::Result<Value, AgentError>>;
}

/// Builds an agent from a step's `config` block.
pub type AgentFactory =
    Arc<dyn Fn(&Value) -> std::result::Result<Arc<dyn Agent>, AgentError> + Send + Sync>;
