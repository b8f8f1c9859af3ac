use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use convoy_core::RunnerConfig;
use convoy_orchestrator::RunQueueEntry;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    Failed(String),
    /// The runner took the attempt elsewhere; completion arrives over HTTP.
    Detached,
}

#[async_trait]
pub trait AttemptRunner: Send + Sync {
    async fn execute(
        &self,
        attempt: &RunQueueEntry,
        cancel: CancellationToken,
    ) -> anyhow::Result<AttemptOutcome>;
}

#[derive(Debug, Clone, Default)]
pub struct DetachedRunner;

#[async_trait]
impl AttemptRunner for DetachedRunner {
    async fn execute(
        &self,
        attempt: &RunQueueEntry,
        _cancel: CancellationToken,
    ) -> anyhow::Result<AttemptOutcome> {
        tracing::debug!(
            attempt_id = %attempt.attempt_id,
            task_id = %attempt.task_id,
            "attempt handed to external runner"
        );
        Ok(AttemptOutcome::Detached)
    }
}

/// Runs one configured program per attempt. Exit status zero completes the
/// attempt; a non-zero status fails it.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_parts(parts: &[String]) -> Option<Self> {
        let (program, args) = parts.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

#[async_trait]
impl AttemptRunner for CommandRunner {
    async fn execute(
        &self,
        attempt: &RunQueueEntry,
        cancel: CancellationToken,
    ) -> anyhow::Result<AttemptOutcome> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("CONVOY_ATTEMPT_ID", &attempt.attempt_id)
            .env("CONVOY_TASK_ID", &attempt.task_id)
            .env("CONVOY_SCOPE_ID", &attempt.scope_id)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning runner `{}`", self.program))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.context("waiting for runner")?;
                if status.success() {
                    Ok(AttemptOutcome::Completed)
                } else {
                    Ok(AttemptOutcome::Failed(format!("runner exited with {status}")))
                }
            }
            _ = cancel.cancelled() => {
                if let Err(err) = child.kill().await {
                    tracing::warn!(attempt_id = %attempt.attempt_id, "failed to kill runner: {}", err);
                }
                Ok(AttemptOutcome::Failed("attempt stopped".to_string()))
            }
        }
    }
}

pub fn runner_from_config(config: &RunnerConfig) -> Arc<dyn AttemptRunner> {
    match config.command.as_deref().and_then(CommandRunner::from_parts) {
        Some(runner) => Arc::new(runner),
        None => Arc::new(DetachedRunner),
    }
}
