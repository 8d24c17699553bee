//! Mock agents and invocation recording for finflow tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::Notify;

use finflow_core::error::AgentError;
use finflow_core::traits::Agent;
use finflow_core::types::{AgentContext, StepInput};

/// One recorded agent invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub step: String,
    pub attempt: u32,
    pub started: Instant,
    pub finished: Instant,
    pub input: StepInput,
}

/// Shared, append-only record of invocations across agents.
#[derive(Debug, Default)]
pub struct InvocationLog {
    records: Mutex<Vec<Invocation>>,
}

impl InvocationLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, invocation: Invocation) {
        self.records.lock().unwrap().push(invocation);
    }

    pub fn records(&self) -> Vec<Invocation> {
        self.records.lock().unwrap().clone()
    }

    pub fn for_step(&self, step: &str) -> Vec<Invocation> {
        self.records()
            .into_iter()
            .filter(|r| r.step == step)
            .collect()
    }

    pub fn count(&self, step: &str) -> usize {
        self.for_step(step).len()
    }

    pub fn first_start(&self, step: &str) -> Option<Instant> {
        self.for_step(step).iter().map(|r| r.started).min()
    }

    pub fn last_finish(&self, step: &str) -> Option<Instant> {
        self.for_step(step).iter().map(|r| r.finished).max()
    }
}

/// Two-way handshake used to hold an agent mid-flight.
///
/// The agent signals `entered` when it starts and waits for `release`.
#[derive(Debug, Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Echo,
    Value(Value),
    Error(AgentError),
}

/// Configurable agent for tests.
///
/// Counts calls, optionally sleeps, fails the first N attempts, waits on a
/// [`Gate`], and records every invocation in an [`InvocationLog`].
#[derive(Debug)]
pub struct MockAgent {
    outcome: Outcome,
    fail_first: Option<(u32, AgentError)>,
    delay: Duration,
    cancel_aware: bool,
    gate: Option<Arc<Gate>>,
    log: Option<Arc<InvocationLog>>,
    calls: AtomicU32,
}

impl MockAgent {
    fn with_outcome(outcome: Outcome) -> Self {
        Self {
            outcome,
            fail_first: None,
            delay: Duration::ZERO,
            cancel_aware: false,
            gate: None,
            log: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Returns `{"step": <name>, "input": <merged input>}`.
    pub fn echo() -> Self {
        Self::with_outcome(Outcome::Echo)
    }

    pub fn returning(value: Value) -> Self {
        Self::with_outcome(Outcome::Value(value))
    }

    pub fn failing(error: AgentError) -> Self {
        Self::with_outcome(Outcome::Error(error))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `n` calls with `error`, then use the normal outcome.
    pub fn fail_first(mut self, n: u32, error: AgentError) -> Self {
        self.fail_first = Some((n, error));
        self
    }

    /// Cut the delay short when the run is cancelled.
    pub fn cancel_aware(mut self) -> Self {
        self.cancel_aware = true;
        self
    }

    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_log(mut self, log: Arc<InvocationLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Agent for MockAgent {
    fn execute(
        &self,
        input: StepInput,
        ctx: AgentContext,
    ) -> BoxFuture<'_, Result<Value, AgentError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let started = Instant::now();

            if let Some(gate) = &self.gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }

            if !self.delay.is_zero() {
                if self.cancel_aware {
                    tokio::select! {
                        _ = ctx.cancelled() => {}
                        _ = tokio::time::sleep(self.delay) => {}
                    }
                } else {
                    tokio::time::sleep(self.delay).await;
                }
            }

            let result = match (&self.fail_first, &self.outcome) {
                (Some((n, error)), _) if call <= *n => Err(error.clone()),
                (_, Outcome::Echo) => Ok(json!({
                    "step": ctx.step_name,
                    "input": Value::Object(input.merged()),
                })),
                (_, Outcome::Value(value)) => Ok(value.clone()),
                (_, Outcome::Error(error)) => Err(error.clone()),
            };

            if let Some(log) = &self.log {
                log.push(Invocation {
                    step: ctx.step_name.clone(),
                    attempt: ctx.attempt,
                    started,
                    finished: Instant::now(),
                    input,
                });
            }

            result
        })
    }
}

/// Agent that panics on every call.
#[derive(Debug, Default)]
pub struct PanickingAgent;

impl Agent for PanickingAgent {
    fn execute(
        &self,
        _input: StepInput,
        _ctx: AgentContext,
    ) -> BoxFuture<'_, Result<Value, AgentError>> {
        Box::pin(async move { explode() })
    }
}

fn explode() -> Result<Value, AgentError> {
    panic!("mock agent exploded")
}
