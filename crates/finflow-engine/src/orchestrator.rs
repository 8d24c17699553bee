use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use finflow_core::error::{FinflowError, Result, StepError};
use finflow_core::event::{EventBus, WorkflowEvent};
use finflow_core::types::{AgentResult, RunState, StepStatus};

use crate::aggregator::{finalize, WorkflowResult};
use crate::context::ExecutionContext;
use crate::executor::StepExecutor;
use crate::registry::PreparedWorkflow;

/// Drives one run of a prepared workflow.
///
/// Waves run in order. All steps of a wave are spawned together and the
/// wave is joined before the next one starts. A step whose dependency did
/// not complete is recorded as skipped without invoking its agent.
/// Cancellation is checked before each wave; steps of waves that never
/// start are absent from the result.
pub struct Orchestrator {
    workflow: Arc<PreparedWorkflow>,
    executor: Arc<StepExecutor>,
    event_bus: Arc<EventBus>,
    limiter: Option<Arc<Semaphore>>,
    context: ExecutionContext,
    state: RunState,
    seed: HashMap<String, Value>,
}

impl Orchestrator {
    pub fn new(
        workflow: Arc<PreparedWorkflow>,
        executor: Arc<StepExecutor>,
        event_bus: Arc<EventBus>,
        context: ExecutionContext,
    ) -> Self {
        Self {
            workflow,
            executor,
            event_bus,
            limiter: None,
            context,
            state: RunState::Initialized,
            seed: HashMap::new(),
        }
    }

    /// Cap the number of agents running at once (0 = unbounded).
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.limiter = (max > 0).then(|| Arc::new(Semaphore::new(max)));
        self
    }

    /// Outputs of steps completed by an earlier run. Seeded steps are
    /// recorded as completed with zero attempts and are not re-invoked.
    pub fn with_seed(mut self, seed: HashMap<String, Value>) -> Self {
        self.seed = seed;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(FinflowError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(
            execution_id = %self.context.execution_id(),
            from = %self.state,
            to = %next,
            "Run state transition"
        );
        self.state = next;
        Ok(())
    }

    /// Execute every wave and seal the result.
    pub async fn run(mut self) -> WorkflowResult {
        let plan = self.workflow.plan.clone();
        let execution_id = self.context.execution_id().clone();
        let total_steps = plan.len();
        let mut results: BTreeMap<String, AgentResult> = BTreeMap::new();
        let mut cancelled = false;

        if let Err(e) = self.transition(RunState::Running) {
            error!(error = %e, "Run could not start");
        }
        info!(
            execution_id = %execution_id,
            workflow = %plan.workflow_id(),
            steps = total_steps,
            waves = plan.num_waves(),
            "Run started"
        );
        self.event_bus.publish(WorkflowEvent::RunStarted {
            execution_id: execution_id.clone(),
            workflow_id: plan.workflow_id().to_string(),
            total_steps,
            total_waves: plan.num_waves(),
        });

        for (wave_index, wave) in plan.waves().iter().enumerate() {
            if self.context.is_cancel_requested() {
                info!(execution_id = %execution_id, wave = wave_index, "Run cancelled before wave");
                cancelled = true;
                break;
            }

            self.event_bus.publish(WorkflowEvent::WaveStarted {
                execution_id: execution_id.clone(),
                wave: wave_index,
                steps: wave.clone(),
            });

            let mut handles: Vec<(String, JoinHandle<AgentResult>)> = Vec::with_capacity(wave.len());
            for name in wave {
                if let Some(output) = self.seed.remove(name) {
                    debug!(step = %name, "Reusing output from previous run");
                    self.record(&mut results, AgentResult::completed(name, output, 0, Utc::now()));
                    continue;
                }

                let unmet: Vec<String> = plan
                    .dependencies(name)
                    .iter()
                    .filter(|dep| !results.get(*dep).is_some_and(AgentResult::is_completed))
                    .cloned()
                    .collect();
                if !unmet.is_empty() {
                    warn!(step = %name, unmet = ?unmet, "Skipping step with unmet dependencies");
                    self.record(&mut results, AgentResult::skipped(name, unmet));
                    continue;
                }

                let Some(resolved) = self.workflow.step(name).cloned() else {
                    // Prepared workflows resolve every planned step.
                    error!(step = %name, "No resolved agent for planned step");
                    continue;
                };
                let input = self.context.input_for(plan.dependencies(name));
                let executor = self.executor.clone();
                let limiter = self.limiter.clone();
                let run = self.context.metadata().clone();

                let handle = tokio::spawn(async move {
                    let _permit = match limiter {
                        Some(sem) => sem.acquire_owned().await.ok(),
                        None => None,
                    };
                    executor
                        .run_step(&resolved.spec, resolved.agent, input, &run)
                        .await
                });
                handles.push((name.clone(), handle));
            }

            for (name, handle) in handles {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        // The executor catches agent panics, so this is an abort.
                        error!(step = %name, error = %e, "Step task failed");
                        AgentResult::failed(
                            &name,
                            StepError::Panicked {
                                message: e.to_string(),
                            },
                            0,
                            self.context.started_at(),
                        )
                    }
                };
                if result.status == StepStatus::Cancelled {
                    cancelled = true;
                }
                self.record(&mut results, result);
            }
        }

        if self.context.is_cancel_requested() && results.len() < total_steps {
            cancelled = true;
        }

        let result = finalize(&self.context, results, total_steps, cancelled);
        if let Err(e) = self.transition(result.overall_status().into()) {
            error!(error = %e, "Run could not be sealed");
        }
        info!(
            execution_id = %execution_id,
            status = %result.overall_status(),
            elapsed_ms = result.elapsed_ms(),
            "Run finished"
        );
        self.event_bus.publish(WorkflowEvent::RunFinished {
            execution_id,
            status: result.overall_status(),
            elapsed_ms: result.elapsed_ms(),
        });
        result
    }

    fn record(&mut self, results: &mut BTreeMap<String, AgentResult>, result: AgentResult) {
        if let Some(output) = &result.output {
            self.context.commit_output(&result.step_name, output.clone());
        }
        self.event_bus.publish(WorkflowEvent::StepFinished {
            execution_id: self.context.execution_id().clone(),
            step: result.step_name.clone(),
            status: result.status,
            attempts: result.attempts,
        });
        results.insert(result.step_name.clone(), result);
    }
}
