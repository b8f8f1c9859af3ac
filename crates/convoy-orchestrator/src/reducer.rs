use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{AttemptId, AutopilotMode, AutopilotState, AutopilotStatus, TaskId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutopilotEvent {
    Started {
        #[serde(default)]
        mode: Option<AutopilotMode>,
    },
    ModeChanged {
        mode: AutopilotMode,
    },
    TaskStarted {
        attempt_id: AttemptId,
    },
    TaskCompleted,
    TaskFailed {
        error: String,
    },
    Paused {
        reason: String,
    },
    AttemptReleased {
        reason: String,
    },
    BatchCompleted,
    BatchApproved,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutopilotCommand {
    StartTask {
        task_id: TaskId,
    },
    RequestApproval {
        batch_id: String,
    },
    EmitNotice {
        event_type: String,
        properties: Value,
    },
}

pub struct AutopilotReducer;

impl AutopilotReducer {
    pub fn reduce(
        state: &AutopilotState,
        event: AutopilotEvent,
    ) -> (AutopilotState, Vec<AutopilotCommand>) {
        let next = match event {
            AutopilotEvent::Started { mode } => state.start(mode),
            AutopilotEvent::ModeChanged { mode } => state.set_mode(mode),
            AutopilotEvent::TaskStarted { attempt_id } => state.start_task(attempt_id),
            AutopilotEvent::TaskCompleted => state.complete_task(),
            AutopilotEvent::TaskFailed { error } => state.fail(error),
            AutopilotEvent::Paused { reason } => state.pause(reason),
            AutopilotEvent::AttemptReleased { reason } => state.release_attempt(reason),
            AutopilotEvent::BatchCompleted => state.complete_batch(),
            AutopilotEvent::BatchApproved => state.approve_current_batch(),
            AutopilotEvent::Canceled => state.cancel(),
        };

        let mut commands = Vec::new();
        if next.status != state.status {
            commands.push(AutopilotCommand::EmitNotice {
                event_type: "autopilot.status.changed".to_string(),
                properties: json!({
                    "from": state.status,
                    "to": next.status,
                    "taskProgress": next.status_info().task_progress,
                }),
            });
        }
        if next.status == AutopilotStatus::WaitingApproval
            && state.status != AutopilotStatus::WaitingApproval
        {
            if let Some(batch) = next.current_batch() {
                commands.push(AutopilotCommand::RequestApproval {
                    batch_id: batch.id.clone(),
                });
            }
        }
        if next != *state {
            if let Some(task_id) = next_runnable_task(&next) {
                commands.push(AutopilotCommand::StartTask { task_id });
            }
        }
        (next, commands)
    }
}

/// The task the driver should launch, if any.
pub fn next_runnable_task(state: &AutopilotState) -> Option<TaskId> {
    if state.status != AutopilotStatus::Running || state.current_attempt_id.is_some() {
        return None;
    }
    state.current_task_id().cloned()
}
