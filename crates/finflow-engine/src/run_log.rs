use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use finflow_core::event::{EventBus, WorkflowEvent};
use finflow_core::types::ExecutionId;

/// JSONL run logger.
///
/// Follows one run on the EventBus and appends one JSON object per line to
/// `{log_dir}/{workflow_id}/{execution_id}.jsonl`. Lines are flushed as they
/// are written, so a crash mid-run leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single line of the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = run summary, 2 = per-wave and step
    /// outcomes, 3 = every attempt and retry.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn log_path(&self, workflow_id: &str, execution_id: &ExecutionId) -> PathBuf {
        self.log_dir
            .join(workflow_id)
            .join(format!("{}.jsonl", execution_id))
    }

    /// Write entries for `execution_id` until its `RunFinished` event, the
    /// bus closes, or `cancel` fires.
    ///
    /// Takes a receiver rather than the bus so the caller can subscribe
    /// before the run starts publishing.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<WorkflowEvent>,
        workflow_id: String,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) {
        let log_path = self.log_path(&workflow_id, &execution_id);
        if let Some(parent) = log_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(error = %e, "Failed to create log directory");
                return;
            }
        }

        let file = match open_append(&log_path).await {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.execution_id() != &execution_id {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if matches!(event, WorkflowEvent::RunFinished { .. }) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Subscribe to `event_bus` and log one run in a background task.
    pub fn spawn(
        self,
        event_bus: &Arc<EventBus>,
        workflow_id: String,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, workflow_id, execution_id, cancel))
    }

    /// Convert an event to a log entry (None if filtered out by level).
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, step: Option<&str>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            execution_id: event.execution_id().to_string(),
            event_type: event_type.to_string(),
            step: step.map(str::to_string),
            detail,
        };

        match event {
            // L1: run summary
            WorkflowEvent::RunStarted {
                workflow_id,
                total_steps,
                total_waves,
                ..
            } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({
                    "workflow_id": workflow_id,
                    "total_steps": total_steps,
                    "total_waves": total_waves,
                })),
            )),
            WorkflowEvent::RunFinished {
                status, elapsed_ms, ..
            } => Some(entry(
                "run_finished",
                None,
                Some(serde_json::json!({ "status": status, "elapsed_ms": elapsed_ms })),
            )),
            WorkflowEvent::CancelRequested { .. } => Some(entry("cancel_requested", None, None)),

            // L2: waves and step outcomes
            WorkflowEvent::WaveStarted { wave, steps, .. } if self.level >= 2 => Some(entry(
                "wave_started",
                None,
                Some(serde_json::json!({ "wave": wave, "steps": steps })),
            )),
            WorkflowEvent::StepFinished {
                step,
                status,
                attempts,
                ..
            } if self.level >= 2 => Some(entry(
                "step_finished",
                Some(step.as_str()),
                Some(serde_json::json!({ "status": status, "attempts": attempts })),
            )),

            // L3: individual attempts
            WorkflowEvent::StepStarted { step, attempt, .. } if self.level >= 3 => Some(entry(
                "step_started",
                Some(step.as_str()),
                Some(serde_json::json!({ "attempt": attempt })),
            )),
            WorkflowEvent::StepRetrying {
                step,
                attempt,
                backoff_ms,
                error,
                ..
            } if self.level >= 3 => Some(entry(
                "step_retrying",
                Some(step.as_str()),
                Some(serde_json::json!({
                    "attempt": attempt,
                    "backoff_ms": backoff_ms,
                    "error": truncate_str(error, 200),
                })),
            )),

            _ => None,
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Truncate a string for logging, respecting char boundaries.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use finflow_core::types::{RunStatus, StepStatus};

    fn id() -> ExecutionId {
        ExecutionId::from_string("run-1")
    }

    #[test]
    fn test_jsonl_entry_format() {
        let entry = LogEntry {
            timestamp: "2026-02-24T12:00:00Z".to_string(),
            execution_id: "run-1".to_string(),
            event_type: "run_started".to_string(),
            step: None,
            detail: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("run_started"));
        assert!(json.contains("run-1"));
        assert!(!json.contains("step"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_event_level_filtering() {
        let started = WorkflowEvent::StepStarted {
            execution_id: id(),
            step: "a".into(),
            attempt: 1,
        };
        let wave = WorkflowEvent::WaveStarted {
            execution_id: id(),
            wave: 0,
            steps: vec!["a".into()],
        };
        let finished = WorkflowEvent::RunFinished {
            execution_id: id(),
            status: RunStatus::Completed,
            elapsed_ms: 5,
        };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&finished).is_some());
        assert!(l1.event_to_entry(&wave).is_none());
        assert!(l1.event_to_entry(&started).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry(&wave).is_some());
        assert!(l2.event_to_entry(&started).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        let entry = l3.event_to_entry(&started).unwrap();
        assert_eq!(entry.step.as_deref(), Some("a"));
    }

    #[test]
    fn test_truncate_str_on_char_boundary() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("héllo", 2), "h");
    }

    #[tokio::test]
    async fn test_writes_only_its_own_run() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(32));
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let path = logger.log_path("wf", &id());
        let handle = logger.spawn(&bus, "wf".into(), id(), CancellationToken::new());

        bus.publish(WorkflowEvent::StepFinished {
            execution_id: ExecutionId::from_string("other-run"),
            step: "x".into(),
            status: StepStatus::Failed,
            attempts: 1,
        });
        bus.publish(WorkflowEvent::StepFinished {
            execution_id: id(),
            step: "a".into(),
            status: StepStatus::Completed,
            attempts: 1,
        });
        bus.publish(WorkflowEvent::RunFinished {
            execution_id: id(),
            status: RunStatus::Completed,
            elapsed_ms: 3,
        });
        handle.await.unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "step_finished");
        assert_eq!(lines[0]["step"], "a");
        assert_eq!(lines[1]["event_type"], "run_finished");
        assert_eq!(lines[1]["detail"]["status"], "completed");
    }
}
