use crate::{
    AttemptId, AutopilotMode, AutopilotState, AutopilotStatus, AutopilotStatusInfo, Batch, TaskId,
};

pub const STEP_COMPLETED_REASON: &str = "step completed";
pub const ATTEMPT_STOPPED_REASON: &str = "attempt stopped";

/// Transitions never mutate `self`; an invalid transition returns an unchanged clone.
impl AutopilotState {
    /// Builds an idle state. The task queue defaults to every batch's tasks in batch order.
    pub fn new(batches: Vec<Batch>, task_ids: Option<Vec<TaskId>>) -> Self {
        let task_queue = task_ids.unwrap_or_else(|| {
            batches
                .iter()
                .flat_map(|batch| batch.task_ids.iter().cloned())
                .collect()
        });
        Self {
            status: AutopilotStatus::Idle,
            mode: AutopilotMode::Off,
            batches,
            batch_index: None,
            task_queue,
            current_task_index: 0,
            current_attempt_id: None,
            completed_tasks: Vec::new(),
            pause_reason: None,
            error: None,
        }
    }

    pub fn set_mode(&self, mode: AutopilotMode) -> Self {
        if self.status == AutopilotStatus::Running || self.status.is_terminal() {
            return self.clone();
        }
        let mut next = self.clone();
        next.mode = mode;
        next
    }

    /// Task progress is never reset; the batch cursor always restarts at 0.
    pub fn start(&self, mode: Option<AutopilotMode>) -> Self {
        if matches!(
            self.status,
            AutopilotStatus::Running | AutopilotStatus::Done | AutopilotStatus::Failed
        ) {
            return self.clone();
        }
        let resolved = mode.unwrap_or(match self.mode {
            AutopilotMode::Off => AutopilotMode::Auto,
            current => current,
        });
        if resolved == AutopilotMode::Off {
            return self.clone();
        }

        let mut next = self.clone();
        next.mode = resolved;
        next.pause_reason = None;
        next.error = None;

        if next.current_task_index >= next.task_queue.len() {
            next.status = AutopilotStatus::Done;
            next.batch_index = None;
            next.current_attempt_id = None;
            return next;
        }

        next.batch_index = (!next.batches.is_empty()).then_some(0);
        next.status = AutopilotStatus::Running;
        next
    }

    pub fn start_task(&self, attempt_id: impl Into<AttemptId>) -> Self {
        if self.status != AutopilotStatus::Running {
            return self.clone();
        }
        let mut next = self.clone();
        next.current_attempt_id = Some(attempt_id.into());
        next
    }

    pub fn complete_task(&self) -> Self {
        if self.status != AutopilotStatus::Running {
            return self.clone();
        }
        let mut next = self.clone();
        next.current_attempt_id = None;

        let Some(task_id) = next.task_queue.get(next.current_task_index).cloned() else {
            next.status = AutopilotStatus::Done;
            next.batch_index = None;
            return next;
        };
        next.completed_tasks.push(task_id);
        next.current_task_index += 1;

        if next.current_task_index >= next.task_queue.len() {
            next.status = AutopilotStatus::Done;
            next.batch_index = None;
        } else if next.mode == AutopilotMode::Step {
            next.status = AutopilotStatus::Paused;
            next.pause_reason = Some(STEP_COMPLETED_REASON.to_string());
        }
        next
    }

    pub fn pause(&self, reason: impl Into<String>) -> Self {
        if self.status != AutopilotStatus::Running {
            return self.clone();
        }
        let mut next = self.clone();
        next.status = AutopilotStatus::Paused;
        next.pause_reason = Some(reason.into());
        next
    }

    pub fn complete_batch(&self) -> Self {
        if self.status != AutopilotStatus::Running {
            return self.clone();
        }
        let mut next = self.clone();
        next.status = AutopilotStatus::WaitingApproval;
        next
    }

    /// Advances exactly one batch per distinct prior state.
    pub fn approve_current_batch(&self) -> Self {
        if self.status != AutopilotStatus::WaitingApproval {
            return self.clone();
        }
        let mut next = self.clone();
        let advanced = self.batch_index.map(|index| index + 1).unwrap_or(0);
        if advanced >= next.batches.len() {
            next.status = AutopilotStatus::Done;
            next.batch_index = None;
            next.current_attempt_id = None;
        } else {
            next.status = AutopilotStatus::Running;
            next.batch_index = Some(advanced);
        }
        next
    }

    /// Returns to `IDLE`; completed tasks are kept.
    pub fn cancel(&self) -> Self {
        if matches!(
            self.status,
            AutopilotStatus::Idle | AutopilotStatus::Done | AutopilotStatus::Failed
        ) {
            return self.clone();
        }
        let mut next = self.clone();
        next.status = AutopilotStatus::Idle;
        next.batch_index = None;
        next.current_attempt_id = None;
        next
    }

    pub fn fail(&self, error: impl Into<String>) -> Self {
        if self.status == AutopilotStatus::Done {
            return self.clone();
        }
        let mut next = self.clone();
        next.status = AutopilotStatus::Failed;
        next.error = Some(error.into());
        next
    }

    /// Drops the in-flight attempt without counting its task, which runs again
    /// on resume. A `RUNNING` state pauses with `reason`; other states keep
    /// their status.
    pub fn release_attempt(&self, reason: impl Into<String>) -> Self {
        if self.status.is_terminal() || self.current_attempt_id.is_none() {
            return self.clone();
        }
        let mut next = self.clone();
        next.current_attempt_id = None;
        if next.status == AutopilotStatus::Running {
            next.status = AutopilotStatus::Paused;
            next.pause_reason = Some(reason.into());
        }
        next
    }

    pub fn current_task_id(&self) -> Option<&TaskId> {
        self.task_queue.get(self.current_task_index)
    }

    pub fn current_batch(&self) -> Option<&Batch> {
        self.batch_index.and_then(|index| self.batches.get(index))
    }

    pub fn status_info(&self) -> AutopilotStatusInfo {
        let total_batches = self.batches.len();
        let progress = match (self.status, self.batch_index) {
            (AutopilotStatus::Done, _) => format!("{total_batches}/{total_batches}"),
            (_, Some(index)) => format!("{}/{}", index + 1, total_batches),
            _ => format!("0/{total_batches}"),
        };
        AutopilotStatusInfo {
            status: self.status,
            mode: self.mode,
            current_batch: self.current_batch().cloned(),
            batch_index: self.batch_index,
            total_batches,
            progress,
            current_task_id: self.current_task_id().cloned(),
            current_task_index: self.current_task_index,
            total_tasks: self.task_queue.len(),
            task_progress: format!("{}/{}", self.completed_tasks.len(), self.task_queue.len()),
            completed_tasks: self.completed_tasks.len(),
            pause_reason: self.pause_reason.clone(),
            error: self.error.clone(),
        }
    }
}
