use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::error::StepError;

/// Unique identifier of one workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    /// Not attempted because an upstream step did not complete.
    Skipped,
    Cancelled,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Overall outcome of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        RunState::from(*self).fmt(f)
    }
}

/// Lifecycle state of a run, as tracked by the orchestrator.
///
/// `Initialized -> Running -> {Completed, PartiallyFailed, Failed, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initialized,
    Running,
    Completed,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Initialized | Self::Running)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        match self {
            Self::Initialized => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl From<RunStatus> for RunState {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => Self::Completed,
            RunStatus::PartiallyFailed => Self::PartiallyFailed,
            RunStatus::Failed => Self::Failed,
            RunStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one step within a run.
///
/// `output` is present iff the status is `Completed`; `error` is present
/// for every other status. Use the constructors to keep that pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub step_name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AgentResult {
    pub fn completed(
        step_name: impl Into<String>,
        output: Value,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
            attempts,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(
        step_name: impl Into<String>,
        error: StepError,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            attempts,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn cancelled(step_name: impl Into<String>, attempts: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Cancelled,
            output: None,
            error: Some(StepError::Cancelled),
            attempts,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Synthetic result for a step whose upstream did not complete.
    pub fn skipped(step_name: impl Into<String>, unmet: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            step_name: step_name.into(),
            status: StepStatus::Skipped,
            output: None,
            error: Some(StepError::SkippedDependency { unmet }),
            attempts: 0,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// Wall-clock time spent on the step.
    pub fn elapsed_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Data handed to an agent for one attempt.
///
/// `global` is the caller-supplied run input. `upstream` holds the outputs
/// of the step's declared dependencies only, keyed by step name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub global: Value,
    #[serde(default)]
    pub upstream: BTreeMap<String, Value>,
}

impl StepInput {
    pub fn new(global: Value) -> Self {
        Self {
            global,
            upstream: BTreeMap::new(),
        }
    }

    pub fn with_upstream(mut self, step: impl Into<String>, output: Value) -> Self {
        self.upstream.insert(step.into(), output);
        self
    }

    /// Output of a dependency, if it was provided.
    pub fn upstream(&self, step: &str) -> Option<&Value> {
        self.upstream.get(step)
    }

    /// Flatten into a single map.
    ///
    /// Object-valued global input contributes its fields; any other non-null
    /// global input lands under `"input"`. Upstream outputs are then written
    /// under their step names and win on conflict.
    pub fn merged(&self) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        match &self.global {
            Value::Object(fields) => {
                for (k, v) in fields {
                    map.insert(k.clone(), v.clone());
                }
            }
            Value::Null => {}
            other => {
                map.insert("input".to_string(), other.clone());
            }
        }
        for (step, output) in &self.upstream {
            map.insert(step.clone(), output.clone());
        }
        map
    }
}

/// Run metadata handed to an agent alongside its input.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub step_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub run_started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl AgentContext {
    pub fn new(
        execution_id: ExecutionId,
        workflow_id: impl Into<String>,
        step_name: impl Into<String>,
        attempt: u32,
        run_started_at: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            execution_id,
            workflow_id: workflow_id.into(),
            step_name: step_name.into(),
            attempt,
            run_started_at,
            cancel,
        }
    }

    /// Long-running agents should poll this and stop early when set.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested for the run.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}
