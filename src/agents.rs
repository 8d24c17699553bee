//! Built-in agents for trying workflows from the command line.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use finflow_core::error::AgentError;
use finflow_core::traits::Agent;
use finflow_core::types::{AgentContext, StepInput};
use finflow_engine::AgentRegistry;

/// Registry with `passthrough`, `constant`, `delay` and `fail`.
pub fn builtin_registry() -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry.register_instance("passthrough", Arc::new(PassthroughAgent));
    registry.register("constant", |config| {
        let cfg: ConstantConfig = parse_config("constant", config)?;
        Ok(Arc::new(ConstantAgent { value: cfg.value }) as Arc<dyn Agent>)
    });
    registry.register("delay", |config| {
        let cfg: DelayConfig = parse_config("delay", config)?;
        Ok(Arc::new(DelayAgent {
            delay: Duration::from_millis(cfg.ms),
        }) as Arc<dyn Agent>)
    });
    registry.register("fail", |config| {
        let cfg: FailConfig = parse_config("fail", config)?;
        Ok(Arc::new(FailAgent {
            cfg,
            calls: AtomicU32::new(0),
        }) as Arc<dyn Agent>)
    });
    registry
}

fn parse_config<T: for<'de> Deserialize<'de>>(agent: &str, config: &Value) -> Result<T, AgentError> {
    serde_json::from_value(config.clone())
        .map_err(|e| AgentError::fatal(format!("invalid {} config: {}", agent, e)))
}

/// Returns the merged input unchanged.
pub struct PassthroughAgent;

impl Agent for PassthroughAgent {
    fn execute(&self, input: StepInput, _ctx: AgentContext) -> BoxFuture<'_, Result<Value, AgentError>> {
        Box::pin(async move { Ok(Value::Object(input.merged())) })
    }
}

#[derive(Deserialize)]
struct ConstantConfig {
    value: Value,
}

/// Returns `config.value`.
pub struct ConstantAgent {
    value: Value,
}

impl Agent for ConstantAgent {
    fn execute(&self, _input: StepInput, _ctx: AgentContext) -> BoxFuture<'_, Result<Value, AgentError>> {
        Box::pin(async move { Ok(self.value.clone()) })
    }
}

#[derive(Deserialize)]
struct DelayConfig {
    #[serde(default = "default_delay_ms")]
    ms: u64,
}

fn default_delay_ms() -> u64 { 1000 }

/// Sleeps for `config.ms`, then passes its input through. Stops early on
/// cancellation.
pub struct DelayAgent {
    delay: Duration,
}

impl Agent for DelayAgent {
    fn execute(&self, input: StepInput, ctx: AgentContext) -> BoxFuture<'_, Result<Value, AgentError>> {
        Box::pin(async move {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!(step = %ctx.step_name, "Delay interrupted by cancellation");
                    Err(AgentError::fatal("cancelled"))
                }
                _ = tokio::time::sleep(self.delay) => Ok(Value::Object(input.merged())),
            }
        })
    }
}

#[derive(Deserialize)]
struct FailConfig {
    #[serde(default = "default_fail_message")]
    message: String,
    #[serde(default)]
    retryable: bool,
    /// Fail only the first N calls, then succeed. Absent = always fail.
    #[serde(default)]
    times: Option<u32>,
}

fn default_fail_message() -> String { "configured failure".to_string() }

/// Fails with `config.message`.
pub struct FailAgent {
    cfg: FailConfig,
    calls: AtomicU32,
}

impl Agent for FailAgent {
    fn execute(&self, _input: StepInput, ctx: AgentContext) -> BoxFuture<'_, Result<Value, AgentError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.cfg.times {
                Some(times) if call > times => Ok(json!({ "recovered_after": times })),
                _ => Err(AgentError {
                    message: format!("{} (attempt {})", self.cfg.message, ctx.attempt),
                    retryable: self.cfg.retryable,
                }),
            }
        })
    }
}
