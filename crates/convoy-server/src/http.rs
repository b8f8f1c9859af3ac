use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use convoy_orchestrator::{
    AttemptState, AutopilotMode, AutopilotSession, AutopilotStatusInfo, SchedulerError,
};
use convoy_types::EngineEvent;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use crate::{AppState, CreateSessionInput, DriverError, PullRequestDelivery};

type ApiError = (StatusCode, Json<Value>);

/// `AutopilotStatusInfo` plus the session identity it belongs to.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatusView {
    #[serde(rename = "sessionID")]
    session_id: String,
    revision: u64,
    #[serde(flatten)]
    info: AutopilotStatusInfo,
}

impl From<&AutopilotSession> for SessionStatusView {
    fn from(session: &AutopilotSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            revision: session.revision,
            info: session.state.status_info(),
        }
    }
}

fn status_view(session: &AutopilotSession) -> Json<Value> {
    Json(serde_json::to_value(SessionStatusView::from(session)).unwrap_or_default())
}

#[derive(Debug, Deserialize, Default)]
struct StartInput {
    mode: Option<AutopilotMode>,
}

#[derive(Debug, Deserialize)]
struct ModeInput {
    mode: AutopilotMode,
}

#[derive(Debug, Deserialize, Default)]
struct PauseInput {
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RunTaskInput {
    #[serde(default, alias = "scopeID", alias = "scope_id")]
    scope_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FinishOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Deserialize)]
struct FinishInput {
    outcome: FinishOutcome,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterPullRequestInput {
    #[serde(alias = "prNumber", alias = "pr_number", alias = "number")]
    pr_number: u64,
}

#[derive(Debug, Deserialize, Default)]
struct GithubPullRequest {
    number: Option<u64>,
    merged: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PullRequestWebhookInput {
    #[serde(default, alias = "deliveryID", alias = "delivery_id")]
    delivery_id: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default, alias = "pr_number", alias = "number")]
    pr_number: Option<u64>,
    #[serde(default)]
    merged: Option<bool>,
    /// GitHub's native payload nests the PR here.
    #[serde(default)]
    pull_request: Option<GithubPullRequest>,
}

#[derive(Debug, Deserialize, Default)]
struct EventFilterQuery {
    #[serde(default, alias = "sessionID", alias = "sessionId")]
    session_id: Option<String>,
    #[serde(default, alias = "attemptID", alias = "attemptId")]
    attempt_id: Option<String>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("convoy engine listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/global/health", get(global_health))
        .route("/event", get(events))
        .route("/config", get(get_config).patch(patch_config))
        .route("/config/runtime", patch(patch_runtime_config))
        .route("/autopilot", post(autopilot_create))
        .route("/autopilot/{id}", get(autopilot_status))
        .route("/autopilot/{id}/start", post(autopilot_start))
        .route("/autopilot/{id}/next", post(autopilot_next))
        .route("/autopilot/{id}/approve", post(autopilot_approve))
        .route("/autopilot/{id}/batch-complete", post(autopilot_batch_complete))
        .route("/autopilot/{id}/pause", post(autopilot_pause))
        .route("/autopilot/{id}/mode", post(autopilot_mode))
        .route("/autopilot/{id}/cancel", post(autopilot_cancel))
        .route("/task/{id}/run", post(task_run))
        .route("/attempt/{id}", get(attempt_get))
        .route("/attempt/{id}/stop", post(attempt_stop))
        .route("/attempt/{id}/cancel", post(attempt_cancel))
        .route("/attempt/{id}/finish", post(attempt_finish))
        .route("/attempt/{id}/pull-request", post(attempt_pull_request))
        .route("/webhook/pull-request", post(webhook_pull_request))
        .layer(cors)
        .with_state(state)
}

fn driver_error_response(error: DriverError) -> ApiError {
    match error {
        DriverError::SessionNotFound { session_id } => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Autopilot session not found",
                "code": "SESSION_NOT_FOUND",
                "sessionID": session_id,
            })),
        ),
        DriverError::SessionExists { session_id } => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "Autopilot session already exists",
                "code": "SESSION_EXISTS",
                "sessionID": session_id,
            })),
        ),
        DriverError::AttemptNotFound { attempt_id } => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Attempt not found",
                "code": "ATTEMPT_NOT_FOUND",
                "attemptID": attempt_id,
            })),
        ),
        DriverError::InvalidInput { detail } => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Invalid request",
                "code": "INVALID_INPUT",
                "detail": detail,
            })),
        ),
        DriverError::Scheduler(err) => {
            let code = match &err {
                SchedulerError::NotQueued { .. } => "ATTEMPT_NOT_QUEUED",
                SchedulerError::NotRunning { .. } => "ATTEMPT_NOT_RUNNING",
                SchedulerError::ScopeCapacityViolation { .. } => "SCOPE_CAPACITY_VIOLATION",
                _ => "SCHEDULER_CONFLICT",
            };
            (
                StatusCode::CONFLICT,
                Json(json!({
                    "error": err.to_string(),
                    "code": code,
                })),
            )
        }
        DriverError::PersistFailed { message } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "State persistence failed",
                "code": "PERSIST_FAILED",
                "detail": message,
            })),
        ),
    }
}

fn bad_request(code: &str, error: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": error,
            "code": code,
        })),
    )
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.sessions.read().await.len();
    let (running, queued) = {
        let queue = state.run_queue.read().await;
        let entries = queue.entries();
        (
            entries
                .iter()
                .filter(|entry| entry.state == AttemptState::Running)
                .count(),
            entries
                .iter()
                .filter(|entry| entry.state == AttemptState::Queued)
                .count(),
        )
    };
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "attempts": { "running": running, "queued": queued },
    }))
}

async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "effective": state.config.get_effective_value().await,
        "layers": state.config.get_layers_value().await,
    }))
}

fn config_patch_body(input: Value) -> Result<Value, ApiError> {
    if input.is_object() {
        Ok(input)
    } else {
        Err(bad_request("INVALID_CONFIG_PATCH", "config patch must be a JSON object"))
    }
}

/// Persists into the file layer. `runner` changes apply on the next start.
async fn patch_config(
    State(state): State<AppState>,
    Json(input): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let patch = config_patch_body(input)?;
    let effective = state.config.patch_file(patch).await.map_err(|err| {
        driver_error_response(DriverError::PersistFailed {
            message: format!("{err:#}"),
        })
    })?;
    Ok(Json(json!({ "effective": effective })))
}

async fn patch_runtime_config(
    State(state): State<AppState>,
    Json(input): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let patch = config_patch_body(input)?;
    let effective = state.config.patch_runtime(patch).await.map_err(|err| {
        driver_error_response(DriverError::PersistFailed {
            message: format!("{err:#}"),
        })
    })?;
    Ok(Json(json!({ "effective": effective })))
}

fn event_matches_filter(event: &EngineEvent, filter: &EventFilterQuery) -> bool {
    if let Some(session_id) = filter.session_id.as_deref() {
        if event.property_str("sessionID") != Some(session_id) {
            return false;
        }
    }
    if let Some(attempt_id) = filter.attempt_id.as_deref() {
        if event.property_str("attemptID") != Some(attempt_id) {
            return false;
        }
    }
    true
}

fn sse_stream(
    state: AppState,
    filter: EventFilterQuery,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let rx = state.event_bus.subscribe();
    let initial = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&EngineEvent::new("server.connected", json!({}))).unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) => {
            if !event_matches_filter(&event, &filter) {
                return None;
            }
            let payload = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().data(payload)))
        }
        Err(_) => None,
    });
    initial.chain(live)
}

async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilterQuery>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    Sse::new(sse_stream(state, filter))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

async fn autopilot_create(
    State(state): State<AppState>,
    Json(input): Json<CreateSessionInput>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .create_session(input)
        .await
        .map_err(driver_error_response)?;
    Ok(Json(json!({
        "session": session,
        "status": SessionStatusView::from(&session),
    })))
}

async fn autopilot_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .session_status(&id)
        .await
        .map_err(driver_error_response)?;
    Ok(status_view(&session))
}

async fn autopilot_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    input: Option<Json<StartInput>>,
) -> Result<Json<Value>, ApiError> {
    let mode = input.and_then(|Json(input)| input.mode);
    let session = state
        .start_autopilot(&id, mode)
        .await
        .map_err(driver_error_response)?;
    Ok(status_view(&session))
}

async fn autopilot_next(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .execute_next_task(&id)
        .await
        .map_err(driver_error_response)?;
    Ok(status_view(&session))
}

async fn autopilot_approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .approve_batch(&id)
        .await
        .map_err(driver_error_response)?;
    Ok(status_view(&session))
}

async fn autopilot_batch_complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .complete_batch(&id)
        .await
        .map_err(driver_error_response)?;
    Ok(status_view(&session))
}

async fn autopilot_pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
    input: Option<Json<PauseInput>>,
) -> Result<Json<Value>, ApiError> {
    let reason = input.and_then(|Json(input)| input.reason);
    let session = state
        .pause_autopilot(&id, reason)
        .await
        .map_err(driver_error_response)?;
    Ok(status_view(&session))
}

async fn autopilot_mode(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ModeInput>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .set_mode(&id, input.mode)
        .await
        .map_err(driver_error_response)?;
    Ok(status_view(&session))
}

async fn autopilot_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .cancel_autopilot(&id)
        .await
        .map_err(driver_error_response)?;
    Ok(status_view(&session))
}

async fn task_run(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    input: Option<Json<RunTaskInput>>,
) -> Result<Json<Value>, ApiError> {
    let scope_id = input.and_then(|Json(input)| input.scope_id);
    let entry = state
        .request_run(&task_id, scope_id)
        .await
        .map_err(driver_error_response)?;
    Ok(Json(json!(entry)))
}

async fn attempt_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = state
        .get_attempt(&id)
        .await
        .map_err(driver_error_response)?;
    Ok(Json(json!(entry)))
}

async fn attempt_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = state
        .stop_attempt(&id)
        .await
        .map_err(driver_error_response)?;
    Ok(Json(json!({ "ok": true, "attempt": entry })))
}

async fn attempt_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = state
        .cancel_queued_attempt(&id)
        .await
        .map_err(driver_error_response)?;
    Ok(Json(json!({ "ok": true, "attempt": entry })))
}

async fn attempt_finish(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<FinishInput>,
) -> Result<Json<Value>, ApiError> {
    let outcome = match input.outcome {
        FinishOutcome::Completed => AttemptState::Completed,
        FinishOutcome::Failed => AttemptState::Failed,
    };
    let entry = state
        .finish_attempt(&id, outcome, input.error)
        .await
        .map_err(driver_error_response)?;
    Ok(Json(json!({ "ok": true, "attempt": entry })))
}

async fn attempt_pull_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<RegisterPullRequestInput>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .register_pull_request(&id, input.pr_number)
        .await
        .map_err(driver_error_response)?;
    Ok(Json(json!({ "pullRequest": record })))
}

/// Falls back to GitHub's `X-GitHub-Delivery` header and nested
/// `pull_request` object when the flat fields are absent.
async fn webhook_pull_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<PullRequestWebhookInput>,
) -> Result<Json<Value>, ApiError> {
    let delivery_id = input
        .delivery_id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| {
            headers
                .get("x-github-delivery")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| bad_request("MISSING_DELIVERY_ID", "deliveryId is required"))?;
    let nested = input.pull_request.unwrap_or_default();
    let pr_number = input
        .pr_number
        .or(nested.number)
        .ok_or_else(|| bad_request("MISSING_PR_NUMBER", "prNumber is required"))?;
    let action = input
        .action
        .filter(|action| !action.trim().is_empty())
        .ok_or_else(|| bad_request("MISSING_ACTION", "action is required"))?;

    let outcome = state
        .apply_pull_request_webhook(PullRequestDelivery {
            delivery_id,
            action,
            pr_number,
            merged: input.merged.or(nested.merged),
        })
        .await
        .map_err(driver_error_response)?;
    Ok(Json(json!({
        "success": true,
        "applied": outcome.applied,
        "duplicate": outcome.duplicate,
    })))
}
