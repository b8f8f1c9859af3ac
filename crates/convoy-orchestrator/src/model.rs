use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type TaskId = String;
pub type AttemptId = String;
pub type ScopeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BatchRisk {
    #[default]
    Low,
    Med,
    High,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("batch `{0}` has no tasks")]
    EmptyBatch(String),
}

/// A labeled, ordered group of tasks executed as a unit before approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: String,
    pub title: String,
    pub task_ids: Vec<TaskId>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub risk: BatchRisk,
}

impl Batch {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        task_ids: Vec<TaskId>,
        rationale: impl Into<String>,
        risk: BatchRisk,
    ) -> Result<Self, ModelError> {
        let batch = Self {
            id: id.into(),
            title: title.into(),
            task_ids,
            rationale: rationale.into(),
            risk,
        };
        batch.validate()?;
        Ok(batch)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.task_ids.is_empty() {
            return Err(ModelError::EmptyBatch(self.id.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutopilotStatus {
    Idle,
    Running,
    Paused,
    WaitingApproval,
    Done,
    Failed,
}

impl AutopilotStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AutopilotStatus::Done | AutopilotStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AutopilotStatus::Idle => "IDLE",
            AutopilotStatus::Running => "RUNNING",
            AutopilotStatus::Paused => "PAUSED",
            AutopilotStatus::WaitingApproval => "WAITING_APPROVAL",
            AutopilotStatus::Done => "DONE",
            AutopilotStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AutopilotMode {
    #[default]
    Off,
    Step,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotState {
    pub status: AutopilotStatus,
    pub mode: AutopilotMode,
    #[serde(default)]
    pub batches: Vec<Batch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<usize>,
    #[serde(default)]
    pub task_queue: Vec<TaskId>,
    #[serde(default)]
    pub current_task_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_attempt_id: Option<AttemptId>,
    #[serde(default)]
    pub completed_tasks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Polling projection of an [`AutopilotState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotStatusInfo {
    pub status: AutopilotStatus,
    pub mode: AutopilotMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_batch: Option<Batch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<usize>,
    pub total_batches: usize,
    pub progress: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<TaskId>,
    pub current_task_index: usize,
    pub total_tasks: usize,
    pub task_progress: String,
    pub completed_tasks: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One autopilot run as the driver layer stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotSession {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "projectID", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub state: AutopilotState,
    pub revision: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl AutopilotSession {
    pub fn new(
        session_id: Option<String>,
        project_id: Option<String>,
        state: AutopilotState,
        now_ms: u64,
    ) -> Self {
        Self {
            session_id: session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            project_id,
            state,
            revision: 1,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    /// Replaces the state, bumping the revision only when something changed.
    pub fn apply(&mut self, next: AutopilotState, now_ms: u64) -> bool {
        if next == self.state {
            return false;
        }
        self.state = next;
        self.revision = self.revision.saturating_add(1);
        self.updated_at_ms = now_ms;
        true
    }
}
