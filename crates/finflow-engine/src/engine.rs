use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use finflow_core::config::{AppConfig, EngineConfig, LogConfig};
use finflow_core::definition::WorkflowDefinition;
use finflow_core::error::{FinflowError, Result};
use finflow_core::event::{EventBus, WorkflowEvent};
use finflow_core::types::ExecutionId;

use crate::aggregator::WorkflowResult;
use crate::context::{ExecutionContext, RunMetadata};
use crate::executor::StepExecutor;
use crate::orchestrator::Orchestrator;
use crate::registry::{AgentRegistry, PreparedWorkflow};
use crate::run_log::RunLogger;

/// Answer to [`WorkflowEngine::get_result`].
#[derive(Debug, Clone)]
pub enum RunLookup {
    NotFound,
    StillRunning,
    Finished(Arc<WorkflowResult>),
    /// The run task ended without producing a result.
    Aborted,
}

impl RunLookup {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }

    pub fn finished(self) -> Option<Arc<WorkflowResult>> {
        match self {
            Self::Finished(result) => Some(result),
            _ => None,
        }
    }
}

struct RunEntry {
    cancel: CancellationToken,
    done: watch::Receiver<Option<Arc<WorkflowResult>>>,
}

impl RunEntry {
    fn result(&self) -> Option<Arc<WorkflowResult>> {
        self.done.borrow().clone()
    }

    /// The sender is gone without a result, so the run task died.
    fn is_aborted(&self) -> bool {
        self.result().is_none() && self.done.has_changed().is_err()
    }

    fn is_active(&self) -> bool {
        self.result().is_none() && !self.is_aborted()
    }
}

/// Entry point: accepts workflow definitions, runs them in the background,
/// and answers status, result and cancellation queries by execution id.
///
/// Runs are independent: each gets its own context and cancellation token.
/// The registry, executor and event bus are shared.
pub struct WorkflowEngine {
    registry: Arc<AgentRegistry>,
    config: EngineConfig,
    executor: Arc<StepExecutor>,
    event_bus: Arc<EventBus>,
    runs: Arc<RwLock<HashMap<ExecutionId, RunEntry>>>,
    run_log: Option<LogConfig>,
}

impl WorkflowEngine {
    pub fn new(registry: AgentRegistry, config: EngineConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_capacity.max(1)));
        let executor = StepExecutor::new(config.retry.clone(), config.default_timeout())
            .with_event_bus(event_bus.clone());
        Self {
            registry: Arc::new(registry),
            config,
            executor: Arc::new(executor),
            event_bus,
            runs: Arc::new(RwLock::new(HashMap::new())),
            run_log: None,
        }
    }

    /// Engine settings and run logging from a loaded `finflow.toml`.
    pub fn from_config(registry: AgentRegistry, config: &AppConfig) -> Self {
        let engine = Self::new(registry, config.engine.clone());
        match config.active_log() {
            Some(log) => engine.with_run_log(log.clone()),
            None => engine,
        }
    }

    /// Write a JSONL log for every run.
    pub fn with_run_log(mut self, log: LogConfig) -> Self {
        self.run_log = log.enabled.then_some(log);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Lifecycle events of every run on this engine.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_bus.subscribe()
    }

    /// Validate a definition and resolve its agents without running it.
    pub fn prepare(&self, definition: impl Into<Arc<WorkflowDefinition>>) -> Result<PreparedWorkflow> {
        self.registry.prepare(definition.into())
    }

    /// Start a run in the background.
    ///
    /// Graph and agent-resolution errors are returned here, before any step
    /// runs. Everything that goes wrong later lands in the run's result.
    pub async fn submit_workflow(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        input: Value,
    ) -> Result<ExecutionId> {
        self.launch(definition.into(), input, HashMap::new()).await
    }

    /// Start a new run that reuses the completed outputs of `previous`.
    ///
    /// Steps that completed before are not invoked again; failed, skipped,
    /// cancelled and never-started steps run as usual.
    pub async fn resume_workflow(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        input: Value,
        previous: &WorkflowResult,
    ) -> Result<ExecutionId> {
        let definition = definition.into();
        if previous.workflow_id() != definition.id {
            return Err(FinflowError::Definition(format!(
                "cannot resume workflow '{}' from a run of '{}'",
                definition.id,
                previous.workflow_id()
            )));
        }
        let seed: HashMap<String, Value> = previous
            .outputs()
            .into_iter()
            .filter(|(step, _)| definition.step(step).is_some())
            .collect();
        info!(
            workflow = %definition.id,
            previous = %previous.execution_id(),
            reused = seed.len(),
            "Resuming workflow"
        );
        self.launch(definition, input, seed).await
    }

    async fn launch(
        &self,
        definition: Arc<WorkflowDefinition>,
        input: Value,
        seed: HashMap<String, Value>,
    ) -> Result<ExecutionId> {
        let prepared = Arc::new(self.registry.prepare(definition)?);
        let execution_id = ExecutionId::new();
        let cancel = CancellationToken::new();
        let orchestrator = self
            .orchestrator(prepared.clone(), execution_id.clone(), cancel.clone(), input)
            .with_seed(seed);

        let (tx, rx) = watch::channel(None);
        self.runs.write().await.insert(
            execution_id.clone(),
            RunEntry {
                cancel,
                done: rx,
            },
        );
        self.spawn_run_log(prepared.workflow_id(), &execution_id);

        info!(execution_id = %execution_id, workflow = %prepared.workflow_id(), "Workflow submitted");
        tokio::spawn(async move {
            let result = orchestrator.run().await;
            // Nobody waiting is fine; the entry keeps a receiver.
            let _ = tx.send(Some(Arc::new(result)));
        });
        Ok(execution_id)
    }

    /// Run a workflow to completion in the calling task.
    ///
    /// The run is not registered, so it cannot be queried or cancelled by id.
    pub async fn run_workflow(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        input: Value,
    ) -> Result<WorkflowResult> {
        let prepared = Arc::new(self.registry.prepare(definition.into())?);
        let execution_id = ExecutionId::new();
        self.spawn_run_log(prepared.workflow_id(), &execution_id);
        let orchestrator = self.orchestrator(prepared, execution_id, CancellationToken::new(), input);
        Ok(orchestrator.run().await)
    }

    fn orchestrator(
        &self,
        prepared: Arc<PreparedWorkflow>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
        input: Value,
    ) -> Orchestrator {
        let metadata = RunMetadata::new(execution_id, prepared.workflow_id(), cancel);
        Orchestrator::new(
            prepared,
            self.executor.clone(),
            self.event_bus.clone(),
            ExecutionContext::new(metadata, input),
        )
        .with_max_concurrency(self.config.max_concurrent_steps)
    }

    fn spawn_run_log(&self, workflow_id: &str, execution_id: &ExecutionId) {
        if let Some(log) = &self.run_log {
            // Stops on the run's RunFinished event.
            RunLogger::new(log.dir(), log.level).spawn(
                &self.event_bus,
                workflow_id.to_string(),
                execution_id.clone(),
                CancellationToken::new(),
            );
        }
    }

    /// Current state of a submitted run.
    pub async fn get_result(&self, execution_id: &ExecutionId) -> RunLookup {
        let runs = self.runs.read().await;
        match runs.get(execution_id) {
            None => RunLookup::NotFound,
            Some(entry) => match entry.result() {
                Some(result) => RunLookup::Finished(result),
                None if entry.is_aborted() => RunLookup::Aborted,
                None => RunLookup::StillRunning,
            },
        }
    }

    /// Request cooperative cancellation.
    ///
    /// Returns `true` if the run exists and had not finished yet. Steps
    /// already in flight finish their current attempt; no new wave starts.
    pub async fn cancel_workflow(&self, execution_id: &ExecutionId) -> bool {
        let runs = self.runs.read().await;
        let Some(entry) = runs.get(execution_id) else {
            warn!(execution_id = %execution_id, "Cancel requested for unknown run");
            return false;
        };
        if !entry.is_active() {
            debug!(execution_id = %execution_id, "Cancel requested for finished run");
            return false;
        }
        if !entry.cancel.is_cancelled() {
            info!(execution_id = %execution_id, "Cancelling workflow run");
            entry.cancel.cancel();
            self.event_bus.publish(WorkflowEvent::CancelRequested {
                execution_id: execution_id.clone(),
            });
        }
        true
    }

    /// Wait for a submitted run to finish.
    pub async fn wait(&self, execution_id: &ExecutionId) -> Result<Arc<WorkflowResult>> {
        let mut done = {
            let runs = self.runs.read().await;
            runs.get(execution_id)
                .map(|entry| entry.done.clone())
                .ok_or_else(|| FinflowError::ExecutionNotFound(execution_id.to_string()))?
        };
        let result = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| FinflowError::RunAborted(execution_id.to_string()))?
            .clone();
        result.ok_or_else(|| FinflowError::RunAborted(execution_id.to_string()))
    }

    /// Drop a finished or aborted run from the engine. Running runs are kept.
    pub async fn forget(&self, execution_id: &ExecutionId) -> bool {
        let mut runs = self.runs.write().await;
        match runs.get(execution_id) {
            Some(entry) if !entry.is_active() => {
                runs.remove(execution_id);
                true
            }
            _ => false,
        }
    }

    /// Ids of runs that have not finished yet.
    pub async fn active_runs(&self) -> Vec<ExecutionId> {
        self.runs
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.is_active())
            .map(|(id, _)| id.clone())
            .collect()
    }
}
