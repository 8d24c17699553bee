use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;

use finflow_core::types::{AgentContext, ExecutionId, StepInput};

/// Run-wide metadata shared with every step task of one run.
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl RunMetadata {
    pub fn new(execution_id: ExecutionId, workflow_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            execution_id,
            workflow_id: workflow_id.into(),
            started_at: Utc::now(),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Context for one agent attempt. The agent gets a child token, so it can
    /// observe run cancellation but cannot cancel the run itself.
    pub fn agent_context(&self, step_name: &str, attempt: u32) -> AgentContext {
        AgentContext::new(
            self.execution_id.clone(),
            self.workflow_id.clone(),
            step_name,
            attempt,
            self.started_at,
            self.cancel.child_token(),
        )
    }
}

/// Per-run shared state: the caller's input plus accumulated step outputs.
///
/// Owned by the orchestrator. Step tasks never touch it directly: they get
/// a [`StepInput`] snapshot holding only their dependencies' outputs, and
/// hand their own output back in the returned result. Outputs are written
/// after each wave joins, so a key is never read and written concurrently.
#[derive(Debug)]
pub struct ExecutionContext {
    metadata: RunMetadata,
    global_input: Value,
    step_outputs: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new(metadata: RunMetadata, global_input: Value) -> Self {
        Self {
            metadata,
            global_input,
            step_outputs: HashMap::new(),
        }
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.metadata.execution_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.metadata.workflow_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.metadata.started_at
    }

    pub fn global_input(&self) -> &Value {
        &self.global_input
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.metadata.is_cancelled()
    }

    pub fn request_cancel(&self) {
        self.metadata.cancel.cancel();
    }

    pub fn output(&self, step: &str) -> Option<&Value> {
        self.step_outputs.get(step)
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.step_outputs
    }

    /// Input view for a step: global input plus the outputs of `dependencies`.
    ///
    /// Outputs of any other step are not visible.
    pub fn input_for(&self, dependencies: &[String]) -> StepInput {
        let mut input = StepInput::new(self.global_input.clone());
        for dep in dependencies {
            if let Some(output) = self.step_outputs.get(dep) {
                input.upstream.insert(dep.clone(), output.clone());
            }
        }
        input
    }

    /// Record a completed step's output. Outputs are write-once: a second
    /// write for the same step is ignored and returns `false`.
    pub fn commit_output(&mut self, step: &str, output: Value) -> bool {
        if self.step_outputs.contains_key(step) {
            warn!(
                execution_id = %self.metadata.execution_id,
                step,
                "Ignoring second output write for step"
            );
            return false;
        }
        self.step_outputs.insert(step.to_string(), output);
        true
    }
}
