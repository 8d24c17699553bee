use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use finflow_core::definition::{RetryPolicy, StepSpec};
use finflow_core::error::StepError;
use finflow_core::event::{EventBus, WorkflowEvent};
use finflow_core::traits::Agent;
use finflow_core::types::{AgentResult, StepInput};

use crate::context::RunMetadata;
use crate::retry::calculate_backoff;

/// Runs a single step: timeout per attempt, retry with backoff, and
/// cancellation checkpoints between attempts.
///
/// Never returns an error and never panics on behalf of the agent: every
/// outcome is folded into an [`AgentResult`].
pub struct StepExecutor {
    default_retry: RetryPolicy,
    default_timeout: Duration,
    event_bus: Option<Arc<EventBus>>,
}

impl StepExecutor {
    pub fn new(default_retry: RetryPolicy, default_timeout: Duration) -> Self {
        Self {
            default_retry,
            default_timeout,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// The step's own policy, or the engine default.
    pub fn policy_for<'a>(&'a self, step: &'a StepSpec) -> &'a RetryPolicy {
        step.retry.as_ref().unwrap_or(&self.default_retry)
    }

    pub fn timeout_for(&self, step: &StepSpec) -> Duration {
        step.timeout().unwrap_or(self.default_timeout)
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    pub async fn run_step(
        &self,
        step: &StepSpec,
        agent: Arc<dyn Agent>,
        input: StepInput,
        run: &RunMetadata,
    ) -> AgentResult {
        let policy = self.policy_for(step);
        let timeout = self.timeout_for(step);
        let started_at = Utc::now();
        let mut attempts = 0u32;

        loop {
            if run.is_cancelled() {
                debug!(step = %step.name, attempts, "Cancellation observed before attempt");
                return AgentResult::cancelled(&step.name, attempts, started_at);
            }

            attempts += 1;
            self.publish(WorkflowEvent::StepStarted {
                execution_id: run.execution_id.clone(),
                step: step.name.clone(),
                attempt: attempts,
            });

            let error = match self
                .attempt(step, agent.as_ref(), input.clone(), run, attempts, timeout)
                .await
            {
                Ok(output) => {
                    info!(step = %step.name, attempts, "Step completed");
                    return AgentResult::completed(&step.name, output, attempts, started_at);
                }
                Err(e) => e,
            };

            if attempts >= policy.max_attempts || !policy.should_retry(&error) {
                warn!(
                    step = %step.name,
                    attempts,
                    error = %error,
                    "Step failed"
                );
                return AgentResult::failed(&step.name, error, attempts, started_at);
            }

            if run.is_cancelled() {
                debug!(step = %step.name, attempts, "Cancellation observed before backoff");
                return AgentResult::cancelled(&step.name, attempts, started_at);
            }

            let backoff = calculate_backoff(policy, attempts);
            warn!(
                step = %step.name,
                attempt = attempts,
                max_attempts = policy.max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Retrying step"
            );
            self.publish(WorkflowEvent::StepRetrying {
                execution_id: run.execution_id.clone(),
                step: step.name.clone(),
                attempt: attempts,
                backoff_ms: backoff.as_millis() as u64,
                error: error.to_string(),
            });

            tokio::select! {
                _ = run.cancelled() => {
                    debug!(step = %step.name, attempts, "Cancellation observed during backoff");
                    return AgentResult::cancelled(&step.name, attempts, started_at);
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// One invocation under the timeout, with panics caught.
    async fn attempt(
        &self,
        step: &StepSpec,
        agent: &dyn Agent,
        input: StepInput,
        run: &RunMetadata,
        attempt: u32,
        timeout: Duration,
    ) -> Result<Value, StepError> {
        let ctx = run.agent_context(&step.name, attempt);
        let invocation = AssertUnwindSafe(async move { agent.execute(input, ctx).await }).catch_unwind();

        match tokio::time::timeout(timeout, invocation).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(payload)) => Err(StepError::Panicked {
                message: panic_message(payload),
            }),
            Err(_) => Err(StepError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finflow_core::definition::RetryOn;
    use finflow_core::error::AgentError;
    use finflow_core::types::{ExecutionId, StepStatus};
    use finflow_test_utils::{InvocationLog, MockAgent, PanickingAgent};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn run() -> RunMetadata {
        RunMetadata::new(ExecutionId::new(), "wf", CancellationToken::new())
    }

    fn executor() -> StepExecutor {
        StepExecutor::new(RetryPolicy::no_retry(), Duration::from_secs(5))
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_backoff(Duration::from_millis(20), 2.0)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let agent = MockAgent::returning(json!({"rows": 3})).shared();
        let step = StepSpec::new("load", "mock");
        let result = executor()
            .run_step(&step, agent.clone(), StepInput::default(), &run())
            .await;

        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.output, Some(json!({"rows": 3})));
        assert_eq!(result.attempts, 1);
        assert_eq!(agent.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let agent = MockAgent::failing(AgentError::fatal("bad ticker")).shared();
        let step = StepSpec::new("load", "mock").with_retry(fast_retry(5));
        let result = executor()
            .run_step(&step, agent.clone(), StepInput::default(), &run())
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(agent.calls(), 1);
        assert!(matches!(result.error, Some(StepError::Agent { retryable: false, .. })));
    }

    #[tokio::test]
    async fn test_retryable_error_uses_every_attempt_with_growing_gaps() {
        let log = InvocationLog::new();
        let agent = MockAgent::failing(AgentError::transient("503"))
            .with_log(log.clone())
            .shared();
        let step = StepSpec::new("fetch", "mock").with_retry(fast_retry(3));
        let result = executor()
            .run_step(&step, agent.clone(), StepInput::default(), &run())
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 3);
        assert_eq!(agent.calls(), 3);

        let records = log.for_step("fetch");
        let gap1 = records[1].started - records[0].finished;
        let gap2 = records[2].started - records[1].finished;
        assert!(gap1 >= Duration::from_millis(20));
        assert!(gap2 >= Duration::from_millis(40));
        assert!(gap2 > gap1);
    }

    #[tokio::test]
    async fn test_retry_on_never_ignores_hint() {
        let agent = MockAgent::failing(AgentError::transient("503")).shared();
        let step = StepSpec::new("fetch", "mock")
            .with_retry(fast_retry(4).with_retry_on(RetryOn::Never));
        let result = executor()
            .run_step(&step, agent.clone(), StepInput::default(), &run())
            .await;
        assert_eq!(result.attempts, 1);
        assert_eq!(agent.calls(), 1);
    }

    #[tokio::test]
    async fn test_flaky_agent_recovers() {
        let agent = MockAgent::returning(json!("ok"))
            .fail_first(2, AgentError::transient("connection reset"))
            .shared();
        let step = StepSpec::new("fetch", "mock").with_retry(fast_retry(3));
        let result = executor()
            .run_step(&step, agent.clone(), StepInput::default(), &run())
            .await;

        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.output, Some(json!("ok")));
    }

    #[tokio::test]
    async fn test_timeout_is_retried_then_fails() {
        let agent = MockAgent::returning(json!(1))
            .with_delay(Duration::from_millis(500))
            .shared();
        let step = StepSpec::new("slow", "mock")
            .with_timeout(Duration::from_millis(30))
            .with_retry(fast_retry(2).with_retry_on(RetryOn::Never));
        let result = executor()
            .run_step(&step, agent.clone(), StepInput::default(), &run())
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.error, Some(StepError::Timeout { timeout_ms: 30 }));
    }

    #[tokio::test]
    async fn test_default_timeout_applies() {
        let executor = StepExecutor::new(RetryPolicy::no_retry(), Duration::from_millis(20));
        let agent = MockAgent::returning(json!(1))
            .with_delay(Duration::from_millis(500))
            .shared();
        let step = StepSpec::new("slow", "mock");
        let result = executor
            .run_step(&step, agent, StepInput::default(), &run())
            .await;
        assert!(result.error.as_ref().is_some_and(StepError::is_timeout));
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let step = StepSpec::new("boom", "mock").with_retry(fast_retry(3));
        let result = executor()
            .run_step(&step, Arc::new(PanickingAgent), StepInput::default(), &run())
            .await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 1);
        match result.error {
            Some(StepError::Panicked { message }) => assert!(message.contains("exploded")),
            other => panic!("expected panic error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_returns_cancelled() {
        let run = run();
        let agent = MockAgent::failing(AgentError::transient("503")).shared();
        let step = StepSpec::new("fetch", "mock").with_retry(
            RetryPolicy::new(5).with_backoff(Duration::from_secs(30), 1.0),
        );

        let token = run.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let result = executor()
            .run_step(&step, agent.clone(), StepInput::default(), &run)
            .await;

        assert_eq!(result.status, StepStatus::Cancelled);
        assert_eq!(result.error, Some(StepError::Cancelled));
        assert_eq!(result.attempts, 1);
        assert_eq!(agent.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let run = run();
        run.cancel_token().cancel();
        let agent = MockAgent::echo().shared();
        let result = executor()
            .run_step(&StepSpec::new("a", "mock"), agent.clone(), StepInput::default(), &run)
            .await;
        assert_eq!(result.status, StepStatus::Cancelled);
        assert_eq!(result.attempts, 0);
        assert_eq!(agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_publishes_retry_events() {
        let bus = Arc::new(EventBus::new(32));
        let mut rx = bus.subscribe();
        let executor = executor().with_event_bus(bus);
        let agent = MockAgent::returning(json!(1))
            .fail_first(1, AgentError::transient("flaky"))
            .shared();
        let step = StepSpec::new("fetch", "mock").with_retry(fast_retry(2));
        executor
            .run_step(&step, agent, StepInput::default(), &run())
            .await;

        let mut kinds = vec![];
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                WorkflowEvent::StepStarted { attempt, .. } => format!("started:{attempt}"),
                WorkflowEvent::StepRetrying { attempt, .. } => format!("retrying:{attempt}"),
                other => format!("{other:?}"),
            });
        }
        assert_eq!(kinds, vec!["started:1", "retrying:1", "started:2"]);
    }
}
