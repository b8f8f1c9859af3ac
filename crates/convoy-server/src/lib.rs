use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use convoy_core::{
    ConfigStore, EventBus, ScopeBy, Storage, PROCESSED_WEBHOOKS_FILE, PULL_REQUESTS_FILE,
    RUN_QUEUE_FILE, SESSIONS_FILE,
};
use convoy_observability::{emit_event, ObservabilityEvent, ProcessKind};
use convoy_orchestrator::{
    next_runnable_task, status_for_action, AttemptId, AttemptState, AutopilotCommand,
    AutopilotEvent, AutopilotMode, AutopilotReducer, AutopilotSession, AutopilotState,
    AutopilotStatus, BacklogChunker, Batch, FixedSizeChunker, ProcessedWebhookRecord,
    PullRequestRecord, PullRequestRegistry, RunQueue, RunQueueEntry, SchedulerError, ScopeId,
    TaskId, WebhookGuard, WebhookOutcome, ATTEMPT_STOPPED_REASON,
};
use convoy_types::{now_ms, EngineEvent};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::Level;

pub mod http;
pub mod runner;

pub use http::serve;
pub use runner::*;

const DEFAULT_PAUSE_REASON: &str = "paused by user";
const ATTEMPT_CANCELLED_REASON: &str = "attempt cancelled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    SessionNotFound { session_id: String },
    SessionExists { session_id: String },
    AttemptNotFound { attempt_id: String },
    InvalidInput { detail: String },
    Scheduler(SchedulerError),
    PersistFailed { message: String },
}

impl From<SchedulerError> for DriverError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::UnknownAttempt(attempt_id) => DriverError::AttemptNotFound { attempt_id },
            other => DriverError::Scheduler(other),
        }
    }
}

fn persist_failed(err: anyhow::Error) -> DriverError {
    DriverError::PersistFailed {
        message: format!("{err:#}"),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionInput {
    #[serde(default, alias = "sessionID", alias = "session_id")]
    pub session_id: Option<String>,
    #[serde(default, alias = "projectID", alias = "project_id")]
    pub project_id: Option<String>,
    /// Pre-chunked batches. When absent, `task_ids` is chunked with the
    /// configured fixed-size chunker.
    #[serde(default)]
    pub batches: Option<Vec<Batch>>,
    #[serde(default, alias = "taskIDs", alias = "task_ids")]
    pub task_ids: Option<Vec<TaskId>>,
    #[serde(default)]
    pub mode: Option<AutopilotMode>,
}

#[derive(Debug, Clone)]
pub struct PullRequestDelivery {
    pub delivery_id: String,
    pub action: String,
    pub pr_number: u64,
    pub merged: Option<bool>,
}

/// Processed deliveries and the pull requests they mutate share one lock so
/// the duplicate check and the record insert are atomic.
#[derive(Debug, Default)]
pub struct WebhookLedger {
    pub guard: WebhookGuard,
    pub pull_requests: PullRequestRegistry,
}

#[derive(Clone)]
pub struct AppState {
    pub config: ConfigStore,
    pub storage: Storage,
    pub event_bus: EventBus,
    pub runner: Arc<dyn AttemptRunner>,
    pub sessions: Arc<RwLock<HashMap<String, AutopilotSession>>>,
    pub run_queue: Arc<RwLock<RunQueue>>,
    pub webhooks: Arc<RwLock<WebhookLedger>>,
    attempt_tokens: Arc<RwLock<HashMap<AttemptId, CancellationToken>>>,
}

impl AppState {
    /// Restores persisted sessions, queue and webhook ledger from `storage`.
    pub async fn new(
        config: ConfigStore,
        storage: Storage,
        runner: Arc<dyn AttemptRunner>,
    ) -> anyhow::Result<Self> {
        let sessions: HashMap<String, AutopilotSession> = storage.load(SESSIONS_FILE).await?;
        let entries: Vec<RunQueueEntry> = storage.load(RUN_QUEUE_FILE).await?;
        let run_queue = RunQueue::restore(entries).context("restoring run queue")?;
        let processed: Vec<ProcessedWebhookRecord> =
            storage.load(PROCESSED_WEBHOOKS_FILE).await?;
        let pull_requests: Vec<PullRequestRecord> = storage.load(PULL_REQUESTS_FILE).await?;

        let running = run_queue
            .entries()
            .iter()
            .filter(|entry| entry.state == AttemptState::Running)
            .count();
        if running > 0 {
            tracing::warn!(
                running,
                "restored running attempts wait for an explicit finish or stop"
            );
        }
        tracing::info!(
            sessions = sessions.len(),
            processed_webhooks = processed.len(),
            "engine state restored from {}",
            storage.base().display()
        );

        Ok(Self {
            config,
            storage,
            event_bus: EventBus::new(),
            runner,
            sessions: Arc::new(RwLock::new(sessions)),
            run_queue: Arc::new(RwLock::new(run_queue)),
            webhooks: Arc::new(RwLock::new(WebhookLedger {
                guard: WebhookGuard::restore(processed),
                pull_requests: PullRequestRegistry::restore(pull_requests),
            })),
            attempt_tokens: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn from_config(config: ConfigStore, storage: Storage) -> anyhow::Result<Self> {
        let runner = runner_from_config(&config.get().await.runner);
        Self::new(config, storage, runner).await
    }

    pub async fn create_session(
        &self,
        input: CreateSessionInput,
    ) -> Result<AutopilotSession, DriverError> {
        if let Some(id) = input.session_id.as_deref() {
            if id.trim().is_empty() {
                return Err(DriverError::InvalidInput {
                    detail: "sessionId must not be empty".to_string(),
                });
            }
        }
        let (batches, task_ids) = match input.batches {
            Some(batches) => {
                for batch in &batches {
                    batch.validate().map_err(|err| DriverError::InvalidInput {
                        detail: err.to_string(),
                    })?;
                }
                (batches, input.task_ids)
            }
            None => {
                let chunking = self.config.get().await.chunker;
                let chunker =
                    FixedSizeChunker::new(chunking.batch_size).with_risk(chunking.risk);
                (
                    chunker.chunk(input.task_ids.as_deref().unwrap_or_default()),
                    None,
                )
            }
        };

        let mut state = AutopilotState::new(batches, task_ids);
        if let Some(mode) = input.mode {
            state = state.set_mode(mode);
        }
        let session = AutopilotSession::new(input.session_id, input.project_id, state, now_ms());

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_id) {
            return Err(DriverError::SessionExists {
                session_id: session.session_id,
            });
        }
        sessions.insert(session.session_id.clone(), session.clone());
        self.persist_sessions(&sessions).await?;
        drop(sessions);

        tracing::info!(
            session_id = %session.session_id,
            batches = session.state.batches.len(),
            tasks = session.state.task_queue.len(),
            "autopilot session created"
        );
        self.publish_session(&session);
        Ok(session)
    }

    pub async fn session_status(&self, session_id: &str) -> Result<AutopilotSession, DriverError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| DriverError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    pub async fn start_autopilot(
        &self,
        session_id: &str,
        mode: Option<AutopilotMode>,
    ) -> Result<AutopilotSession, DriverError> {
        let current = self.session_status(session_id).await?;
        let mode = match mode {
            Some(mode) => Some(mode),
            None if current.state.mode == AutopilotMode::Off => {
                Some(self.config.get().await.autopilot.default_mode)
            }
            None => None,
        };
        self.drive(session_id, AutopilotEvent::Started { mode }).await
    }

    /// Launches the current task when the session is running with nothing in
    /// flight. Otherwise returns the unchanged session.
    pub async fn execute_next_task(
        &self,
        session_id: &str,
    ) -> Result<AutopilotSession, DriverError> {
        self.launch_session_task(session_id).await?;
        self.session_status(session_id).await
    }

    pub async fn approve_batch(&self, session_id: &str) -> Result<AutopilotSession, DriverError> {
        self.drive(session_id, AutopilotEvent::BatchApproved).await
    }

    pub async fn complete_batch(&self, session_id: &str) -> Result<AutopilotSession, DriverError> {
        self.drive(session_id, AutopilotEvent::BatchCompleted).await
    }

    pub async fn pause_autopilot(
        &self,
        session_id: &str,
        reason: Option<String>,
    ) -> Result<AutopilotSession, DriverError> {
        let reason = reason
            .filter(|reason| !reason.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PAUSE_REASON.to_string());
        self.drive(session_id, AutopilotEvent::Paused { reason }).await
    }

    pub async fn set_mode(
        &self,
        session_id: &str,
        mode: AutopilotMode,
    ) -> Result<AutopilotSession, DriverError> {
        self.drive(session_id, AutopilotEvent::ModeChanged { mode })
            .await
    }

    /// Returns the session to `IDLE` and stops whatever attempt it had in flight.
    pub async fn cancel_autopilot(
        &self,
        session_id: &str,
    ) -> Result<AutopilotSession, DriverError> {
        let (previous, session, commands) =
            self.transition(session_id, AutopilotEvent::Canceled).await?;
        if session.state.status == AutopilotStatus::Idle {
            if let Some(attempt_id) = previous.current_attempt_id {
                if let Err(err) = self.stop_in_queue(&attempt_id).await {
                    tracing::warn!(%attempt_id, "cancel could not stop attempt: {:?}", err);
                }
            }
        }
        self.follow_commands(session_id, commands).await?;
        Ok(session)
    }

    /// Enqueues a standalone attempt. `scope_id` defaults to the task id.
    pub async fn request_run(
        &self,
        task_id: &str,
        scope_id: Option<ScopeId>,
    ) -> Result<RunQueueEntry, DriverError> {
        if task_id.trim().is_empty() {
            return Err(DriverError::InvalidInput {
                detail: "taskId must not be empty".to_string(),
            });
        }
        let scope_id = scope_id
            .filter(|scope| !scope.trim().is_empty())
            .unwrap_or_else(|| task_id.to_string());
        let entry = self.enqueue(scope_id, task_id.to_string()).await?;
        self.after_enqueue(&entry, None);
        Ok(entry)
    }

    pub async fn get_attempt(&self, attempt_id: &str) -> Result<RunQueueEntry, DriverError> {
        self.run_queue
            .read()
            .await
            .get(attempt_id)
            .cloned()
            .ok_or_else(|| DriverError::AttemptNotFound {
                attempt_id: attempt_id.to_string(),
            })
    }

    /// Stops a queued or running attempt and pauses the session waiting on it.
    pub async fn stop_attempt(&self, attempt_id: &str) -> Result<RunQueueEntry, DriverError> {
        let stopped = self.stop_in_queue(attempt_id).await?;
        self.release_session_attempt(attempt_id, ATTEMPT_STOPPED_REASON)
            .await?;
        Ok(stopped)
    }

    pub async fn cancel_queued_attempt(
        &self,
        attempt_id: &str,
    ) -> Result<RunQueueEntry, DriverError> {
        let cancelled = {
            let mut queue = self.run_queue.write().await;
            let cancelled = queue.cancel_queued(attempt_id)?;
            self.persist_queue(&queue).await?;
            cancelled
        };
        self.publish_attempt("attempt.cancelled", &cancelled, None);
        self.release_session_attempt(attempt_id, ATTEMPT_CANCELLED_REASON)
            .await?;
        Ok(cancelled)
    }

    /// Records a running attempt's outcome, launches the attempt promoted in
    /// its scope and advances the session that was waiting on it.
    pub async fn finish_attempt(
        &self,
        attempt_id: &str,
        outcome: AttemptState,
        error: Option<String>,
    ) -> Result<RunQueueEntry, DriverError> {
        let (finished, promoted) = {
            let mut queue = self.run_queue.write().await;
            let promoted = queue.finish(attempt_id, outcome)?;
            let finished = queue
                .get(attempt_id)
                .cloned()
                .ok_or_else(|| DriverError::AttemptNotFound {
                    attempt_id: attempt_id.to_string(),
                })?;
            self.persist_queue(&queue).await?;
            (finished, promoted)
        };
        self.attempt_tokens.write().await.remove(attempt_id);
        self.publish_attempt("attempt.finished", &finished, error.as_deref());
        if let Some(next) = promoted {
            self.launch(next);
        }

        let event = match outcome {
            AttemptState::Completed => AutopilotEvent::TaskCompleted,
            _ => AutopilotEvent::TaskFailed {
                error: error.unwrap_or_else(|| format!("attempt {attempt_id} failed")),
            },
        };
        if let Some((session_id, commands)) = self.settle_session(attempt_id, event).await? {
            self.follow_commands(&session_id, commands).await?;
        }
        Ok(finished)
    }

    pub async fn register_pull_request(
        &self,
        attempt_id: &str,
        pr_number: u64,
    ) -> Result<PullRequestRecord, DriverError> {
        self.get_attempt(attempt_id).await?;
        let mut ledger = self.webhooks.write().await;
        let record = ledger
            .pull_requests
            .register(pr_number, attempt_id, now_ms());
        self.storage
            .save(PULL_REQUESTS_FILE, &ledger.pull_requests.records())
            .await
            .map_err(persist_failed)?;
        drop(ledger);
        tracing::info!(%attempt_id, pr_number, "pull request registered");
        Ok(record)
    }

    /// Applies each delivery at most once. Actions that set no status and
    /// unknown pull requests report success without recording the delivery.
    pub async fn apply_pull_request_webhook(
        &self,
        delivery: PullRequestDelivery,
    ) -> Result<WebhookOutcome, DriverError> {
        let delivery_id = delivery.delivery_id.trim();
        if delivery_id.is_empty() {
            return Err(DriverError::InvalidInput {
                detail: "deliveryId is required".to_string(),
            });
        }
        let subject_id = delivery.pr_number.to_string();

        let mut ledger = self.webhooks.write().await;
        let Some(status) = status_for_action(&delivery.action, delivery.merged) else {
            return Ok(WebhookOutcome {
                applied: false,
                duplicate: ledger.guard.get(delivery_id).is_some(),
            });
        };
        let WebhookLedger {
            guard,
            pull_requests,
        } = &mut *ledger;
        let outcome = guard.apply(pull_requests, delivery_id, &subject_id, status, now_ms());
        if outcome.applied {
            self.storage
                .save(PULL_REQUESTS_FILE, &pull_requests.records())
                .await
                .map_err(persist_failed)?;
            self.storage
                .save(PROCESSED_WEBHOOKS_FILE, &guard.records())
                .await
                .map_err(persist_failed)?;
        }
        drop(ledger);

        let event_type = if outcome.duplicate {
            "webhook.duplicate"
        } else {
            "webhook.applied"
        };
        if outcome.applied || outcome.duplicate {
            self.event_bus.publish(EngineEvent::new(
                event_type,
                json!({
                    "deliveryID": delivery_id,
                    "prNumber": delivery.pr_number,
                    "status": status,
                    "applied": outcome.applied,
                }),
            ));
        }
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: event_type,
                component: "webhook",
                delivery_id: Some(delivery_id),
                status: Some(status.as_str()),
                detail: (!outcome.applied && !outcome.duplicate).then_some("unknown pull request"),
                ..Default::default()
            },
        );
        Ok(outcome)
    }

    async fn drive(
        &self,
        session_id: &str,
        event: AutopilotEvent,
    ) -> Result<AutopilotSession, DriverError> {
        let (_, _, commands) = self.transition(session_id, event).await?;
        self.follow_commands(session_id, commands).await?;
        self.session_status(session_id).await
    }

    /// Reduces one event under the sessions lock. Returns the prior state,
    /// the updated session and the reducer's commands.
    async fn transition(
        &self,
        session_id: &str,
        event: AutopilotEvent,
    ) -> Result<(AutopilotState, AutopilotSession, Vec<AutopilotCommand>), DriverError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| DriverError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let previous = session.state.clone();
        let (next, commands) = AutopilotReducer::reduce(&previous, event);
        let changed = session.apply(next, now_ms());
        let snapshot = session.clone();
        if changed {
            self.persist_sessions(&sessions).await?;
            drop(sessions);
            self.publish_session(&snapshot);
        }
        Ok((previous, snapshot, commands))
    }

    /// Applies `event` to the session whose in-flight attempt is `attempt_id`.
    /// A completion that arrives while the session is not running releases
    /// the attempt instead, so the task is retried on resume.
    async fn settle_session(
        &self,
        attempt_id: &str,
        event: AutopilotEvent,
    ) -> Result<Option<(String, Vec<AutopilotCommand>)>, DriverError> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions
            .values_mut()
            .find(|session| session.state.current_attempt_id.as_deref() == Some(attempt_id))
        else {
            return Ok(None);
        };
        let event = match event {
            AutopilotEvent::TaskCompleted if session.state.status != AutopilotStatus::Running => {
                tracing::warn!(
                    session_id = %session.session_id,
                    %attempt_id,
                    status = session.state.status.as_str(),
                    "attempt finished while session was not running; task will run again"
                );
                AutopilotEvent::AttemptReleased {
                    reason: "attempt finished while not running".to_string(),
                }
            }
            event => event,
        };
        let (next, commands) = AutopilotReducer::reduce(&session.state, event);
        let changed = session.apply(next, now_ms());
        let snapshot = session.clone();
        if changed {
            self.persist_sessions(&sessions).await?;
            drop(sessions);
            self.publish_session(&snapshot);
        }
        Ok(Some((snapshot.session_id, commands)))
    }

    async fn release_session_attempt(
        &self,
        attempt_id: &str,
        reason: &str,
    ) -> Result<(), DriverError> {
        let event = AutopilotEvent::AttemptReleased {
            reason: reason.to_string(),
        };
        if let Some((session_id, commands)) = self.settle_session(attempt_id, event).await? {
            self.follow_commands(&session_id, commands).await?;
        }
        Ok(())
    }

    async fn follow_commands(
        &self,
        session_id: &str,
        commands: Vec<AutopilotCommand>,
    ) -> Result<(), DriverError> {
        for command in commands {
            match command {
                AutopilotCommand::StartTask { task_id } => {
                    if self.config.get().await.autopilot.auto_launch {
                        self.launch_session_task(session_id).await?;
                    } else {
                        tracing::debug!(%session_id, %task_id, "auto launch disabled");
                    }
                }
                AutopilotCommand::RequestApproval { batch_id } => {
                    self.event_bus.publish(EngineEvent::new(
                        "autopilot.approval.requested",
                        json!({ "sessionID": session_id, "batchID": batch_id }),
                    ));
                }
                AutopilotCommand::EmitNotice {
                    event_type,
                    mut properties,
                } => {
                    if let Some(map) = properties.as_object_mut() {
                        map.insert("sessionID".to_string(), json!(session_id));
                    }
                    self.event_bus
                        .publish(EngineEvent::new(event_type, properties));
                }
            }
        }
        Ok(())
    }

    /// Holds the sessions lock across the enqueue so two callers cannot both
    /// launch the same task.
    async fn launch_session_task(
        &self,
        session_id: &str,
    ) -> Result<Option<RunQueueEntry>, DriverError> {
        let scope_by = self.config.get().await.scheduler.scope_by;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| DriverError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let Some(task_id) = next_runnable_task(&session.state) else {
            return Ok(None);
        };
        let scope_id = scope_for(scope_by, session.project_id.as_deref(), &task_id);
        let entry = self.enqueue(scope_id, task_id).await?;

        let (next, _) = AutopilotReducer::reduce(
            &session.state,
            AutopilotEvent::TaskStarted {
                attempt_id: entry.attempt_id.clone(),
            },
        );
        session.apply(next, now_ms());
        let snapshot = session.clone();
        self.persist_sessions(&sessions).await?;
        drop(sessions);

        self.publish_session(&snapshot);
        self.after_enqueue(&entry, Some(session_id));
        Ok(Some(entry))
    }

    async fn enqueue(&self, scope_id: ScopeId, task_id: TaskId) -> Result<RunQueueEntry, DriverError> {
        let mut queue = self.run_queue.write().await;
        let entry = queue.enqueue(scope_id, task_id, now_ms());
        self.persist_queue(&queue).await?;
        Ok(entry)
    }

    fn after_enqueue(&self, entry: &RunQueueEntry, session_id: Option<&str>) {
        self.event_bus.publish(EngineEvent::new(
            "attempt.queued",
            json!({
                "attemptID": entry.attempt_id,
                "taskID": entry.task_id,
                "scopeID": entry.scope_id,
                "sessionID": session_id,
                "state": entry.state,
            }),
        ));
        if entry.state == AttemptState::Running {
            self.launch(entry.clone());
        }
    }

    async fn stop_in_queue(&self, attempt_id: &str) -> Result<RunQueueEntry, DriverError> {
        let (stopped, promoted) = {
            let mut queue = self.run_queue.write().await;
            let promoted = queue.stop(attempt_id)?;
            let stopped = queue
                .get(attempt_id)
                .cloned()
                .ok_or_else(|| DriverError::AttemptNotFound {
                    attempt_id: attempt_id.to_string(),
                })?;
            self.persist_queue(&queue).await?;
            (stopped, promoted)
        };
        if let Some(token) = self.attempt_tokens.write().await.remove(attempt_id) {
            token.cancel();
        }
        self.publish_attempt("attempt.stopped", &stopped, None);
        if let Some(next) = promoted {
            self.launch(next);
        }
        Ok(stopped)
    }

    /// Hands a running entry to the runner on a background task.
    fn launch(&self, entry: RunQueueEntry) {
        let state = self.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            state
                .attempt_tokens
                .write()
                .await
                .insert(entry.attempt_id.clone(), cancel.clone());
            let still_running = state
                .run_queue
                .read()
                .await
                .get(&entry.attempt_id)
                .is_some_and(|current| current.state == AttemptState::Running);
            if !still_running {
                state.attempt_tokens.write().await.remove(&entry.attempt_id);
                return;
            }

            state.publish_attempt("attempt.started", &entry, None);
            let report = match state.runner.execute(&entry, cancel.clone()).await {
                Ok(AttemptOutcome::Detached) => return,
                Ok(AttemptOutcome::Completed) => (AttemptState::Completed, None),
                Ok(AttemptOutcome::Failed(reason)) => (AttemptState::Failed, Some(reason)),
                Err(err) => (AttemptState::Failed, Some(format!("{err:#}"))),
            };
            if cancel.is_cancelled() {
                return;
            }
            let (outcome, error) = report;
            if let Err(err) = state
                .finish_attempt(&entry.attempt_id, outcome, error)
                .await
            {
                tracing::warn!(
                    attempt_id = %entry.attempt_id,
                    "runner report ignored: {:?}",
                    err
                );
            }
        });
    }

    fn publish_session(&self, session: &AutopilotSession) {
        self.event_bus.publish(EngineEvent::new(
            "autopilot.updated",
            json!({
                "sessionID": session.session_id,
                "revision": session.revision,
                "status": session.state.status_info(),
            }),
        ));
    }

    fn publish_attempt(&self, event_type: &str, entry: &RunQueueEntry, error: Option<&str>) {
        self.event_bus.publish(EngineEvent::new(
            event_type,
            json!({
                "attemptID": entry.attempt_id,
                "taskID": entry.task_id,
                "scopeID": entry.scope_id,
                "state": entry.state,
                "error": error,
            }),
        ));
        let level = match entry.state {
            AttemptState::Failed => Level::WARN,
            _ => Level::INFO,
        };
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: event_type,
                component: "scheduler",
                attempt_id: Some(&entry.attempt_id),
                scope_id: Some(&entry.scope_id),
                status: Some(entry.state.as_str()),
                detail: error,
                ..Default::default()
            },
        );
    }

    async fn persist_sessions(
        &self,
        sessions: &HashMap<String, AutopilotSession>,
    ) -> Result<(), DriverError> {
        self.storage
            .save(SESSIONS_FILE, sessions)
            .await
            .map_err(persist_failed)
    }

    async fn persist_queue(&self, queue: &RunQueue) -> Result<(), DriverError> {
        self.storage
            .save(RUN_QUEUE_FILE, &queue.entries())
            .await
            .map_err(persist_failed)
    }
}

fn scope_for(scope_by: ScopeBy, project_id: Option<&str>, task_id: &str) -> ScopeId {
    match (scope_by, project_id) {
        (ScopeBy::Project, Some(project)) if !project.trim().is_empty() => project.to_string(),
        _ => task_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct InstantRunner;

    #[async_trait]
    impl AttemptRunner for InstantRunner {
        async fn execute(
            &self,
            _attempt: &RunQueueEntry,
            _cancel: CancellationToken,
        ) -> anyhow::Result<AttemptOutcome> {
            Ok(AttemptOutcome::Completed)
        }
    }

    async fn test_state_with(runner: Arc<dyn AttemptRunner>) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ConfigStore::new(dir.path().join("config.json"), None)
            .await
            .expect("config");
        let storage = Storage::new(dir.path().join("state")).await.expect("storage");
        let state = AppState::new(config, storage, runner).await.expect("state");
        (state, dir)
    }

    async fn open_state(root: &std::path::Path) -> AppState {
        let config = ConfigStore::new(root.join("config.json"), None)
            .await
            .expect("config");
        let storage = Storage::new(root.join("state")).await.expect("storage");
        AppState::new(config, storage, Arc::new(DetachedRunner))
            .await
            .expect("state")
    }

    fn tasks(ids: &[&str]) -> Option<Vec<TaskId>> {
        Some(ids.iter().map(|id| id.to_string()).collect())
    }

    #[tokio::test]
    async fn create_session_chunks_bare_task_list() {
        let (state, _dir) = test_state_with(Arc::new(DetachedRunner)).await;
        let session = state
            .create_session(CreateSessionInput {
                session_id: Some("s-1".to_string()),
                task_ids: tasks(&["T1", "T2", "T3", "T4"]),
                ..Default::default()
            })
            .await
            .expect("session");
        assert_eq!(session.state.batches.len(), 2);
        assert_eq!(session.state.batches[1].id, "batch-002");
        assert_eq!(session.state.task_queue.len(), 4);

        let again = state
            .create_session(CreateSessionInput {
                session_id: Some("s-1".to_string()),
                ..Default::default()
            })
            .await
            .expect_err("duplicate");
        assert!(matches!(again, DriverError::SessionExists { .. }));
    }

    #[tokio::test]
    async fn start_launches_first_task_and_finish_advances() {
        let (state, _dir) = test_state_with(Arc::new(DetachedRunner)).await;
        state
            .create_session(CreateSessionInput {
                session_id: Some("s-1".to_string()),
                project_id: Some("p-1".to_string()),
                task_ids: tasks(&["T1", "T2"]),
                ..Default::default()
            })
            .await
            .expect("session");

        let started = state.start_autopilot("s-1", None).await.expect("start");
        assert_eq!(started.state.status, AutopilotStatus::Running);
        assert_eq!(started.state.mode, AutopilotMode::Auto);
        let first = started.state.current_attempt_id.clone().expect("attempt");
        let entry = state.get_attempt(&first).await.expect("entry");
        assert_eq!(entry.task_id, "T1");
        assert_eq!(entry.scope_id, "p-1");
        assert_eq!(entry.state, AttemptState::Running);

        // Running with an attempt in flight: nothing new is launched.
        let same = state.execute_next_task("s-1").await.expect("next");
        assert_eq!(same.state.current_attempt_id.as_deref(), Some(first.as_str()));

        state
            .finish_attempt(&first, AttemptState::Completed, None)
            .await
            .expect("finish");
        let after = state.session_status("s-1").await.expect("status");
        assert_eq!(after.state.completed_tasks, vec!["T1"]);
        let second = after.state.current_attempt_id.clone().expect("next attempt");
        assert_ne!(second, first);
        assert_eq!(state.get_attempt(&second).await.expect("entry").task_id, "T2");

        state
            .finish_attempt(&second, AttemptState::Completed, None)
            .await
            .expect("finish");
        let done = state.session_status("s-1").await.expect("status");
        assert_eq!(done.state.status, AutopilotStatus::Done);
        assert_eq!(done.state.current_attempt_id, None);
    }

    #[tokio::test]
    async fn failed_attempt_fails_session() {
        let (state, _dir) = test_state_with(Arc::new(DetachedRunner)).await;
        state
            .create_session(CreateSessionInput {
                session_id: Some("s-1".to_string()),
                task_ids: tasks(&["T1"]),
                ..Default::default()
            })
            .await
            .expect("session");
        let started = state.start_autopilot("s-1", None).await.expect("start");
        let attempt = started.state.current_attempt_id.expect("attempt");
        state
            .finish_attempt(&attempt, AttemptState::Failed, Some("exit 1".to_string()))
            .await
            .expect("finish");
        let failed = state.session_status("s-1").await.expect("status");
        assert_eq!(failed.state.status, AutopilotStatus::Failed);
        assert_eq!(failed.state.error.as_deref(), Some("exit 1"));
    }

    #[tokio::test]
    async fn stop_pauses_session_and_resume_retries_task() {
        let (state, _dir) = test_state_with(Arc::new(DetachedRunner)).await;
        state
            .create_session(CreateSessionInput {
                session_id: Some("s-1".to_string()),
                task_ids: tasks(&["T1", "T2"]),
                ..Default::default()
            })
            .await
            .expect("session");
        let started = state.start_autopilot("s-1", None).await.expect("start");
        let attempt = started.state.current_attempt_id.expect("attempt");

        let stopped = state.stop_attempt(&attempt).await.expect("stop");
        assert_eq!(stopped.state, AttemptState::Stopped);
        let paused = state.session_status("s-1").await.expect("status");
        assert_eq!(paused.state.status, AutopilotStatus::Paused);
        assert_eq!(paused.state.pause_reason.as_deref(), Some("attempt stopped"));
        assert_eq!(paused.state.current_attempt_id, None);

        // A late report for the stopped attempt is rejected by the queue.
        let late = state
            .finish_attempt(&attempt, AttemptState::Completed, None)
            .await
            .expect_err("not running");
        assert!(matches!(
            late,
            DriverError::Scheduler(SchedulerError::NotRunning { .. })
        ));

        let resumed = state.start_autopilot("s-1", None).await.expect("resume");
        let retry = resumed.state.current_attempt_id.expect("retry attempt");
        assert_eq!(state.get_attempt(&retry).await.expect("entry").task_id, "T1");
    }

    #[tokio::test]
    async fn cancel_stops_in_flight_attempt() {
        let (state, _dir) = test_state_with(Arc::new(DetachedRunner)).await;
        state
            .create_session(CreateSessionInput {
                session_id: Some("s-1".to_string()),
                task_ids: tasks(&["T1"]),
                ..Default::default()
            })
            .await
            .expect("session");
        let started = state.start_autopilot("s-1", None).await.expect("start");
        let attempt = started.state.current_attempt_id.expect("attempt");

        let cancelled = state.cancel_autopilot("s-1").await.expect("cancel");
        assert_eq!(cancelled.state.status, AutopilotStatus::Idle);
        assert_eq!(
            state.get_attempt(&attempt).await.expect("entry").state,
            AttemptState::Stopped
        );
    }

    #[tokio::test]
    async fn same_scope_attempts_queue_and_promote_in_order() {
        let (state, _dir) = test_state_with(Arc::new(DetachedRunner)).await;
        let first = state
            .request_run("T1", Some("repo".to_string()))
            .await
            .expect("first");
        let second = state
            .request_run("T2", Some("repo".to_string()))
            .await
            .expect("second");
        let third = state
            .request_run("T3", Some("repo".to_string()))
            .await
            .expect("third");
        assert_eq!(first.state, AttemptState::Running);
        assert_eq!(second.state, AttemptState::Queued);
        assert_eq!(third.state, AttemptState::Queued);

        state
            .finish_attempt(&first.attempt_id, AttemptState::Completed, None)
            .await
            .expect("finish");
        assert_eq!(
            state.get_attempt(&second.attempt_id).await.expect("entry").state,
            AttemptState::Running
        );
        assert_eq!(
            state.get_attempt(&third.attempt_id).await.expect("entry").state,
            AttemptState::Queued
        );

        let cancelled = state
            .cancel_queued_attempt(&third.attempt_id)
            .await
            .expect("cancel queued");
        assert_eq!(cancelled.state, AttemptState::Cancelled);
    }

    #[tokio::test]
    async fn instant_runner_drives_auto_session_to_done() {
        let (state, _dir) = test_state_with(Arc::new(InstantRunner)).await;
        state
            .create_session(CreateSessionInput {
                session_id: Some("s-1".to_string()),
                task_ids: tasks(&["T1", "T2", "T3"]),
                ..Default::default()
            })
            .await
            .expect("session");
        state.start_autopilot("s-1", None).await.expect("start");

        let mut status = AutopilotStatus::Running;
        for _ in 0..100 {
            status = state.session_status("s-1").await.expect("status").state.status;
            if status == AutopilotStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, AutopilotStatus::Done);
        let session = state.session_status("s-1").await.expect("status");
        assert_eq!(session.state.completed_tasks, vec!["T1", "T2", "T3"]);
    }

    #[tokio::test]
    async fn webhook_deliveries_apply_once() {
        let (state, _dir) = test_state_with(Arc::new(DetachedRunner)).await;
        let attempt = state.request_run("T1", None).await.expect("run");
        state
            .register_pull_request(&attempt.attempt_id, 42)
            .await
            .expect("register");

        let merged = PullRequestDelivery {
            delivery_id: "D1".to_string(),
            action: "closed".to_string(),
            pr_number: 42,
            merged: Some(true),
        };
        let first = state
            .apply_pull_request_webhook(merged.clone())
            .await
            .expect("apply");
        assert!(first.applied);

        let replay = state
            .apply_pull_request_webhook(PullRequestDelivery {
                merged: Some(false),
                ..merged
            })
            .await
            .expect("replay");
        assert!(replay.duplicate);
        let ledger = state.webhooks.read().await;
        assert_eq!(
            ledger.pull_requests.get(42).map(|pr| pr.status),
            Some(convoy_orchestrator::PullRequestStatus::Merged)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_replays_of_one_delivery_apply_once() {
        let (state, _dir) = test_state_with(Arc::new(DetachedRunner)).await;
        let attempt = state.request_run("T1", None).await.expect("run");
        state
            .register_pull_request(&attempt.attempt_id, 42)
            .await
            .expect("register");

        let delivery = PullRequestDelivery {
            delivery_id: "D-race".to_string(),
            action: "closed".to_string(),
            pr_number: 42,
            merged: Some(true),
        };
        let (first, second) = tokio::join!(
            state.apply_pull_request_webhook(delivery.clone()),
            state.apply_pull_request_webhook(delivery)
        );
        let outcomes = [first.expect("first"), second.expect("second")];
        assert_eq!(outcomes.iter().filter(|o| o.applied).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| o.duplicate).count(), 1);
        assert_eq!(state.webhooks.read().await.guard.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_run_requests_keep_one_running_per_scope() {
        let (state, _dir) = test_state_with(Arc::new(DetachedRunner)).await;
        let handles = (0..16)
            .map(|i| {
                let state = state.clone();
                tokio::spawn(async move {
                    state
                        .request_run(&format!("T{i}"), Some("repo".to_string()))
                        .await
                })
            })
            .collect::<Vec<_>>();

        let mut returned = Vec::new();
        for handle in handles {
            returned.push(handle.await.expect("join").expect("request_run"));
        }
        assert_eq!(
            returned
                .iter()
                .filter(|entry| entry.state == AttemptState::Running)
                .count(),
            1
        );

        let entries = state.run_queue.read().await.entries();
        let running = entries
            .iter()
            .filter(|entry| entry.scope_id == "repo" && entry.state == AttemptState::Running)
            .count();
        let queued = entries
            .iter()
            .filter(|entry| entry.scope_id == "repo" && entry.state == AttemptState::Queued)
            .count();
        assert_eq!(running, 1);
        assert_eq!(queued, 15);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().expect("tempdir");

        let state = open_state(dir.path()).await;
        state
            .create_session(CreateSessionInput {
                session_id: Some("s-1".to_string()),
                task_ids: tasks(&["T1"]),
                ..Default::default()
            })
            .await
            .expect("session");
        let started = state.start_autopilot("s-1", None).await.expect("start");
        let attempt = started.state.current_attempt_id.expect("attempt");
        state.register_pull_request(&attempt, 7).await.expect("pr");
        state
            .apply_pull_request_webhook(PullRequestDelivery {
                delivery_id: "D1".to_string(),
                action: "closed".to_string(),
                pr_number: 7,
                merged: None,
            })
            .await
            .expect("webhook");
        drop(state);

        let restored = open_state(dir.path()).await;
        let session = restored.session_status("s-1").await.expect("session");
        assert_eq!(session.state.status, AutopilotStatus::Running);
        assert_eq!(
            restored.get_attempt(&attempt).await.expect("entry").state,
            AttemptState::Running
        );
        let replay = restored
            .apply_pull_request_webhook(PullRequestDelivery {
                delivery_id: "D1".to_string(),
                action: "reopened".to_string(),
                pr_number: 7,
                merged: None,
            })
            .await
            .expect("replay");
        assert!(replay.duplicate);
    }

    #[test]
    fn scope_follows_configured_grouping() {
        assert_eq!(scope_for(ScopeBy::Project, Some("p-1"), "T1"), "p-1");
        assert_eq!(scope_for(ScopeBy::Project, None, "T1"), "T1");
        assert_eq!(scope_for(ScopeBy::Task, Some("p-1"), "T1"), "T1");
    }
}
