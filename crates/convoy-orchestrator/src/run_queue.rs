use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AttemptId, ScopeId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Queued,
    Running,
    Completed,
    Failed,
    Stopped,
    Cancelled,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AttemptState::Queued | AttemptState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptState::Queued => "queued",
            AttemptState::Running => "running",
            AttemptState::Completed => "completed",
            AttemptState::Failed => "failed",
            AttemptState::Stopped => "stopped",
            AttemptState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueueEntry {
    #[serde(rename = "attemptID")]
    pub attempt_id: AttemptId,
    #[serde(rename = "taskID")]
    pub task_id: TaskId,
    #[serde(rename = "scopeID")]
    pub scope_id: ScopeId,
    pub state: AttemptState,
    pub enqueued_at_ms: u64,
    /// Insertion order; breaks `enqueued_at_ms` ties.
    pub seq: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("attempt `{0}` not found")]
    UnknownAttempt(AttemptId),
    #[error("attempt `{0}` already exists")]
    DuplicateAttempt(AttemptId),
    #[error("attempt `{attempt_id}` is {}, expected queued", .state.as_str())]
    NotQueued {
        attempt_id: AttemptId,
        state: AttemptState,
    },
    #[error("attempt `{attempt_id}` is {}, expected running", .state.as_str())]
    NotRunning {
        attempt_id: AttemptId,
        state: AttemptState,
    },
    #[error("scope `{scope_id}` already has running attempt `{running}`")]
    ScopeCapacityViolation { scope_id: ScopeId, running: AttemptId },
    #[error("`{}` is not a finishing state", .0.as_str())]
    InvalidOutcome(AttemptState),
}

#[derive(Debug, Clone, Default)]
struct ScopeSlots {
    running: Option<AttemptId>,
    queued: VecDeque<AttemptId>,
}

/// Per-scope run queue holding at most one running attempt per scope.
///
/// Not synchronised; the owner serialises access (the server wraps it in a lock).
#[derive(Debug, Clone, Default)]
pub struct RunQueue {
    entries: HashMap<AttemptId, RunQueueEntry>,
    scopes: HashMap<ScopeId, ScopeSlots>,
    next_seq: u64,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a queue from persisted entries, rejecting a second running entry in a scope.
    pub fn restore(mut entries: Vec<RunQueueEntry>) -> Result<Self, SchedulerError> {
        entries.sort_by_key(|entry| entry.seq);
        let mut queue = Self::new();
        for entry in entries {
            queue.insert(entry)?;
        }
        Ok(queue)
    }

    /// Direct insertion of an entry in any state.
    pub fn insert(&mut self, entry: RunQueueEntry) -> Result<(), SchedulerError> {
        if self.entries.contains_key(&entry.attempt_id) {
            return Err(SchedulerError::DuplicateAttempt(entry.attempt_id));
        }
        if entry.state == AttemptState::Running {
            if let Some(running) = self.running_for(&entry.scope_id) {
                return Err(SchedulerError::ScopeCapacityViolation {
                    scope_id: entry.scope_id.clone(),
                    running: running.attempt_id.clone(),
                });
            }
        }
        self.place(entry);
        Ok(())
    }

    fn place(&mut self, entry: RunQueueEntry) {
        let slots = self.scopes.entry(entry.scope_id.clone()).or_default();
        match entry.state {
            AttemptState::Running => {
                slots.running = Some(entry.attempt_id.clone());
            }
            AttemptState::Queued => {
                let position = slots
                    .queued
                    .iter()
                    .position(|id| {
                        self.entries
                            .get(id)
                            .is_some_and(|queued| queued.enqueued_at_ms > entry.enqueued_at_ms)
                    })
                    .unwrap_or(slots.queued.len());
                slots.queued.insert(position, entry.attempt_id.clone());
            }
            _ => {}
        }
        self.next_seq = self.next_seq.max(entry.seq.saturating_add(1));
        self.entries.insert(entry.attempt_id.clone(), entry);
    }

    /// Runs immediately when the scope is idle, otherwise joins the back of its FIFO.
    pub fn enqueue(
        &mut self,
        scope_id: impl Into<ScopeId>,
        task_id: impl Into<TaskId>,
        now_ms: u64,
    ) -> RunQueueEntry {
        let mut attempt_id = uuid::Uuid::new_v4().to_string();
        while self.entries.contains_key(&attempt_id) {
            attempt_id = uuid::Uuid::new_v4().to_string();
        }
        self.admit(attempt_id, scope_id.into(), task_id.into(), now_ms)
    }

    fn admit(
        &mut self,
        attempt_id: AttemptId,
        scope_id: ScopeId,
        task_id: TaskId,
        now_ms: u64,
    ) -> RunQueueEntry {
        let state = if self.running_for(&scope_id).is_some() {
            AttemptState::Queued
        } else {
            AttemptState::Running
        };
        let entry = RunQueueEntry {
            attempt_id,
            task_id,
            scope_id,
            state,
            enqueued_at_ms: now_ms,
            seq: self.next_seq,
        };
        self.place(entry.clone());
        entry
    }

    /// Moves the oldest queued entry of `scope_id` to running.
    pub fn promote_next(&mut self, scope_id: &str) -> Result<Option<RunQueueEntry>, SchedulerError> {
        let Some(slots) = self.scopes.get_mut(scope_id) else {
            return Ok(None);
        };
        if let Some(running) = &slots.running {
            return Err(SchedulerError::ScopeCapacityViolation {
                scope_id: scope_id.to_string(),
                running: running.clone(),
            });
        }
        let Some(next_id) = slots.queued.pop_front() else {
            return Ok(None);
        };
        slots.running = Some(next_id.clone());
        let entry = self
            .entries
            .get_mut(&next_id)
            .ok_or_else(|| SchedulerError::UnknownAttempt(next_id.clone()))?;
        entry.state = AttemptState::Running;
        Ok(Some(entry.clone()))
    }

    /// Records a running attempt's outcome and promotes the next queued one.
    pub fn finish(
        &mut self,
        attempt_id: &str,
        outcome: AttemptState,
    ) -> Result<Option<RunQueueEntry>, SchedulerError> {
        if !matches!(outcome, AttemptState::Completed | AttemptState::Failed) {
            return Err(SchedulerError::InvalidOutcome(outcome));
        }
        let entry = self
            .entries
            .get_mut(attempt_id)
            .ok_or_else(|| SchedulerError::UnknownAttempt(attempt_id.to_string()))?;
        if entry.state != AttemptState::Running {
            return Err(SchedulerError::NotRunning {
                attempt_id: attempt_id.to_string(),
                state: entry.state,
            });
        }
        entry.state = outcome;
        let scope_id = entry.scope_id.clone();
        self.release_slot(&scope_id, attempt_id);
        self.promote_next(&scope_id)
    }

    /// Forces the attempt to stopped from any state; promotes if the scope became idle.
    pub fn stop(&mut self, attempt_id: &str) -> Result<Option<RunQueueEntry>, SchedulerError> {
        let entry = self
            .entries
            .get_mut(attempt_id)
            .ok_or_else(|| SchedulerError::UnknownAttempt(attempt_id.to_string()))?;
        let previous = entry.state;
        entry.state = AttemptState::Stopped;
        let scope_id = entry.scope_id.clone();
        match previous {
            AttemptState::Running => self.release_slot(&scope_id, attempt_id),
            AttemptState::Queued => self.remove_queued(&scope_id, attempt_id),
            _ => {}
        }
        if self.running_for(&scope_id).is_some() {
            return Ok(None);
        }
        self.promote_next(&scope_id)
    }

    pub fn cancel_queued(&mut self, attempt_id: &str) -> Result<RunQueueEntry, SchedulerError> {
        let entry = self
            .entries
            .get_mut(attempt_id)
            .ok_or_else(|| SchedulerError::UnknownAttempt(attempt_id.to_string()))?;
        if entry.state != AttemptState::Queued {
            return Err(SchedulerError::NotQueued {
                attempt_id: attempt_id.to_string(),
                state: entry.state,
            });
        }
        entry.state = AttemptState::Cancelled;
        let cancelled = entry.clone();
        self.remove_queued(&cancelled.scope_id, attempt_id);
        Ok(cancelled)
    }

    pub fn get(&self, attempt_id: &str) -> Option<&RunQueueEntry> {
        self.entries.get(attempt_id)
    }

    pub fn running_for(&self, scope_id: &str) -> Option<&RunQueueEntry> {
        self.scopes
            .get(scope_id)
            .and_then(|slots| slots.running.as_ref())
            .and_then(|id| self.entries.get(id))
    }

    pub fn queued_for(&self, scope_id: &str) -> Vec<&RunQueueEntry> {
        self.scopes
            .get(scope_id)
            .map(|slots| {
                slots
                    .queued
                    .iter()
                    .filter_map(|id| self.entries.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> Vec<RunQueueEntry> {
        let mut rows = self.entries.values().cloned().collect::<Vec<_>>();
        rows.sort_by_key(|entry| entry.seq);
        rows
    }

    fn release_slot(&mut self, scope_id: &str, attempt_id: &str) {
        if let Some(slots) = self.scopes.get_mut(scope_id) {
            if slots.running.as_deref() == Some(attempt_id) {
                slots.running = None;
            }
        }
    }

    fn remove_queued(&mut self, scope_id: &str, attempt_id: &str) {
        if let Some(slots) = self.scopes.get_mut(scope_id) {
            slots.queued.retain(|id| id != attempt_id);
        }
    }
}
