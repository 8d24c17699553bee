use serde::Serialize;

use crate::types::{ExecutionId, RunStatus, StepStatus};

/// Lifecycle event of a workflow run, broadcast to all subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        execution_id: ExecutionId,
        workflow_id: String,
        total_steps: usize,
        total_waves: usize,
    },
    WaveStarted {
        execution_id: ExecutionId,
        wave: usize,
        steps: Vec<String>,
    },
    StepStarted {
        execution_id: ExecutionId,
        step: String,
        attempt: u32,
    },
    StepRetrying {
        execution_id: ExecutionId,
        step: String,
        attempt: u32,
        backoff_ms: u64,
        error: String,
    },
    StepFinished {
        execution_id: ExecutionId,
        step: String,
        status: StepStatus,
        attempts: u32,
    },
    CancelRequested {
        execution_id: ExecutionId,
    },
    RunFinished {
        execution_id: ExecutionId,
        status: RunStatus,
        elapsed_ms: u64,
    },
}

impl WorkflowEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Self::RunStarted { execution_id, .. }
            | Self::WaveStarted { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepRetrying { execution_id, .. }
            | Self::StepFinished { execution_id, .. }
            | Self::CancelRequested { execution_id }
            | Self::RunFinished { execution_id, .. } => execution_id,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let id = ExecutionId::from_string("run-1");
        bus.publish(WorkflowEvent::CancelRequested {
            execution_id: id.clone(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id(), &id);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(WorkflowEvent::CancelRequested {
            execution_id: ExecutionId::new(),
        });
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = WorkflowEvent::StepFinished {
            execution_id: ExecutionId::from_string("x"),
            step: "clean".into(),
            status: StepStatus::Completed,
            attempts: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_finished");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["execution_id"], "x");
    }
}
