use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use finflow_core::types::{AgentResult, ExecutionId, RunStatus, StepStatus};

use crate::context::ExecutionContext;

/// Final, sealed outcome of one workflow run.
///
/// Fields are private: once built by [`finalize`] the result is read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    execution_id: ExecutionId,
    workflow_id: String,
    overall_status: RunStatus,
    step_results: BTreeMap<String, AgentResult>,
    total_steps: usize,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

/// Per-status step counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_steps: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Steps that never started because the run stopped first.
    pub not_started: usize,
}

impl WorkflowResult {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn overall_status(&self) -> RunStatus {
        self.overall_status
    }

    pub fn step_results(&self) -> &BTreeMap<String, AgentResult> {
        &self.step_results
    }

    pub fn step(&self, name: &str) -> Option<&AgentResult> {
        self.step_results.get(name)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn elapsed_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn is_success(&self) -> bool {
        self.overall_status == RunStatus::Completed
    }

    /// Outputs of every completed step, usable as a resume seed.
    pub fn outputs(&self) -> HashMap<String, Value> {
        self.step_results
            .iter()
            .filter_map(|(name, r)| r.output.clone().map(|o| (name.clone(), o)))
            .collect()
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps_with(StepStatus::Failed)
    }

    pub fn skipped_steps(&self) -> Vec<&str> {
        self.steps_with(StepStatus::Skipped)
    }

    fn steps_with(&self, status: StepStatus) -> Vec<&str> {
        self.step_results
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.step_name.as_str())
            .collect()
    }

    /// Number of steps in the workflow, including ones that never started.
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Count steps per status. Steps a cancelled run never reached show up
    /// as `not_started`.
    pub fn summary(&self) -> RunSummary {
        let total_steps = self.total_steps;
        let mut summary = RunSummary {
            total_steps,
            ..RunSummary::default()
        };
        for result in self.step_results.values() {
            match result.status {
                StepStatus::Completed => summary.completed += 1,
                StepStatus::Failed => summary.failed += 1,
                StepStatus::Skipped => summary.skipped += 1,
                StepStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary.not_started = total_steps.saturating_sub(self.step_results.len());
        summary
    }
}

/// Overall status from the recorded step results.
///
/// `Cancelled` wins if cancellation was honored. Otherwise every step of the
/// workflow must be present and completed for `Completed`; no completed step
/// at all means `Failed`; anything in between is `PartiallyFailed`.
pub fn derive_status(
    step_results: &BTreeMap<String, AgentResult>,
    total_steps: usize,
    cancelled: bool,
) -> RunStatus {
    if cancelled {
        return RunStatus::Cancelled;
    }
    let completed = step_results.values().filter(|r| r.is_completed()).count();
    if completed == total_steps && step_results.len() == total_steps {
        RunStatus::Completed
    } else if completed == 0 {
        RunStatus::Failed
    } else {
        RunStatus::PartiallyFailed
    }
}

/// Seal a run: compute the status, stamp the finish time.
pub fn finalize(
    context: &ExecutionContext,
    step_results: BTreeMap<String, AgentResult>,
    total_steps: usize,
    cancelled: bool,
) -> WorkflowResult {
    let overall_status = derive_status(&step_results, total_steps, cancelled);
    WorkflowResult {
        execution_id: context.execution_id().clone(),
        workflow_id: context.workflow_id().to_string(),
        overall_status,
        step_results,
        total_steps,
        started_at: context.started_at(),
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunMetadata;
    use finflow_core::error::StepError;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn context() -> ExecutionContext {
        let meta = RunMetadata::new(ExecutionId::from_string("run-9"), "report", CancellationToken::new());
        ExecutionContext::new(meta, json!({}))
    }

    fn results(entries: Vec<AgentResult>) -> BTreeMap<String, AgentResult> {
        entries
            .into_iter()
            .map(|r| (r.step_name.clone(), r))
            .collect()
    }

    fn ok(name: &str) -> AgentResult {
        AgentResult::completed(name, json!({"step": name}), 1, Utc::now())
    }

    fn failed(name: &str) -> AgentResult {
        AgentResult::failed(name, StepError::Timeout { timeout_ms: 10 }, 3, Utc::now())
    }

    #[test]
    fn test_all_completed() {
        let r = results(vec![ok("a"), ok("b")]);
        assert_eq!(derive_status(&r, 2, false), RunStatus::Completed);
    }

    #[test]
    fn test_none_completed() {
        let r = results(vec![failed("a"), AgentResult::skipped("b", vec!["a".into()])]);
        assert_eq!(derive_status(&r, 2, false), RunStatus::Failed);
    }

    #[test]
    fn test_mixed_is_partial() {
        let r = results(vec![ok("a"), failed("b")]);
        assert_eq!(derive_status(&r, 2, false), RunStatus::PartiallyFailed);
    }

    #[test]
    fn test_cancel_wins() {
        let r = results(vec![ok("a"), ok("b")]);
        assert_eq!(derive_status(&r, 2, true), RunStatus::Cancelled);
    }

    #[test]
    fn test_missing_steps_block_completed() {
        let r = results(vec![ok("a")]);
        assert_eq!(derive_status(&r, 3, false), RunStatus::PartiallyFailed);
    }

    #[test]
    fn test_finalize_and_accessors() {
        let ctx = context();
        let result = finalize(
            &ctx,
            results(vec![
                ok("load"),
                failed("charts"),
                AgentResult::skipped("publish", vec!["charts".into()]),
            ]),
            4,
            false,
        );

        assert_eq!(result.execution_id().0, "run-9");
        assert_eq!(result.workflow_id(), "report");
        assert_eq!(result.overall_status(), RunStatus::PartiallyFailed);
        assert!(!result.is_success());
        assert_eq!(result.failed_steps(), vec!["charts"]);
        assert_eq!(result.skipped_steps(), vec!["publish"]);
        assert!(result.finished_at() >= result.started_at());

        let outputs = result.outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs["load"], json!({"step": "load"}));

        let summary = result.summary();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.not_started, 1);
    }

    #[test]
    fn test_result_serializes() {
        let result = finalize(&context(), results(vec![ok("a")]), 1, false);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["overall_status"], "completed");
        assert_eq!(json["step_results"]["a"]["status"], "completed");

        let back: WorkflowResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
