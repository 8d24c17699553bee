pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use definition::{RetryOn, RetryPolicy, StepSpec, WorkflowDefinition};
pub use error::{AgentError, FinflowError, GraphError, Result, StepError};
pub use event::{EventBus, WorkflowEvent};
pub use traits::{Agent, AgentFactory};
pub use types::*;
