use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural problems found while compiling a workflow definition.
///
/// These are raised before any step runs and are never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Workflow '{0}' has no steps")]
    Empty(String),

    #[error("Duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    DanglingDependency { step: String, dependency: String },

    #[error("Dependency cycle: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("Invalid settings for step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },
}

impl GraphError {
    /// Names of the steps the error points at.
    pub fn steps(&self) -> Vec<&str> {
        match self {
            Self::Empty(_) => vec![],
            Self::DuplicateStep(step) => vec![step.as_str()],
            Self::DanglingDependency { step, .. } => vec![step.as_str()],
            Self::Cycle { cycle } => {
                // The path repeats its first node at the end.
                let mut names: Vec<&str> = cycle.iter().map(String::as_str).collect();
                if names.len() > 1 && names.first() == names.last() {
                    names.pop();
                }
                names
            }
            Self::InvalidStep { step, .. } => vec![step.as_str()],
        }
    }
}

/// Failure reported by an agent for a single attempt.
///
/// `retryable` is a hint consulted by the step's retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct AgentError {
    pub message: String,
    pub retryable: bool,
}

impl AgentError {
    /// A transient failure worth re-attempting.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure; retrying cannot help.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Terminal error recorded on a step result.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    #[error("Agent error: {message}")]
    Agent { message: String, retryable: bool },

    #[error("Attempt timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Skipped: unmet dependency on {}", .unmet.join(", "))]
    SkippedDependency { unmet: Vec<String> },

    #[error("Cancelled before completion")]
    Cancelled,

    #[error("Agent panicked: {message}")]
    Panicked { message: String },
}

impl StepError {
    /// The retry hint carried by the error itself.
    ///
    /// Timeouts are always transient. Skips, cancellations and panics never are.
    pub fn retryable_hint(&self) -> bool {
        match self {
            Self::Agent { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            Self::SkippedDependency { .. } | Self::Cancelled | Self::Panicked { .. } => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<AgentError> for StepError {
    fn from(e: AgentError) -> Self {
        Self::Agent {
            message: e.message,
            retryable: e.retryable,
        }
    }
}

#[derive(Debug, Error)]
pub enum FinflowError {
    #[error("Invalid workflow graph: {0}")]
    Graph(#[from] GraphError),

    #[error("Unknown agent type '{agent_type}' for step '{step}'")]
    UnknownAgentType { step: String, agent_type: String },

    #[error("Failed to construct agent '{agent_type}' for step '{step}': {message}")]
    AgentConstruction {
        step: String,
        agent_type: String,
        message: String,
    },

    #[error("Workflow definition error: {0}")]
    Definition(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Run {0} ended without producing a result")]
    RunAborted(String),

    #[error("Invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, FinflowError>;
