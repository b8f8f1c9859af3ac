use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Days, NaiveDate, Utc};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const OBS_TARGET: &str = "convoy.obs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Engine,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
        }
    }

    fn log_prefix(self) -> String {
        format!("convoy.{}", self.as_str())
    }
}

/// One structured record on the `convoy.obs` target. Unset ids log as "".
#[derive(Debug, Clone, Default)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub session_id: Option<&'a str>,
    pub attempt_id: Option<&'a str>,
    pub scope_id: Option<&'a str>,
    pub delivery_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

macro_rules! obs_record {
    ($macro:ident, $process:expr, $event:expr) => {
        tracing::$macro!(
            target: OBS_TARGET,
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            session_id = $event.session_id.unwrap_or_default(),
            attempt_id = $event.attempt_id.unwrap_or_default(),
            scope_id = $event.scope_id.unwrap_or_default(),
            delivery_id = $event.delivery_id.unwrap_or_default(),
            status = $event.status.unwrap_or_default(),
            error_code = $event.error_code.unwrap_or_default(),
            detail = $event.detail.unwrap_or_default(),
            "observability_event"
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => obs_record!(error, process, event),
        Level::WARN => obs_record!(warn, process, event),
        _ => obs_record!(info, process, event),
    }
}

/// Installs a compact console layer plus daily `convoy.<proc>.YYYY-MM-DD.jsonl`
/// files in `logs_dir`. Keep the guard alive for the life of the process.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<WorkerGuard> {
    fs::create_dir_all(logs_dir)?;
    prune_expired_logs(logs_dir, process, retention_days)?;

    let appender = Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(process.log_prefix())
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_target(true))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .ok();

    Ok(guard)
}

/// Stderr only, `warn` unless `RUST_LOG` says otherwise.
pub fn init_console_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
        .try_init()
        .ok();
}

fn log_file_date(name: &str, prefix: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix(prefix)?.strip_prefix('.')?.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn prune_expired_logs(
    logs_dir: &Path,
    process: ProcessKind,
    retention_days: u64,
) -> anyhow::Result<()> {
    let Some(cutoff) = Utc::now().date_naive().checked_sub_days(Days::new(retention_days)) else {
        return Ok(());
    };
    let prefix = process.log_prefix();

    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let expired = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| log_file_date(name, &prefix))
            .is_some_and(|date| date < cutoff);
        if expired && path.is_file() {
            if let Err(err) = fs::remove_file(&path) {
                tracing::debug!("could not prune {}: {}", path.display(), err);
            }
        }
    }
    Ok(())
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_date_requires_prefix_and_suffix() {
        assert_eq!(
            log_file_date("convoy.engine.2026-01-31.jsonl", "convoy.engine"),
            NaiveDate::from_ymd_opt(2026, 1, 31)
        );
        assert_eq!(log_file_date("convoy.engine.2026-01-31.log", "convoy.engine"), None);
        assert_eq!(log_file_date("convoy.engineering.2026-01-31.jsonl", "convoy.engine"), None);
        assert_eq!(log_file_date("convoy.engine.latest.jsonl", "convoy.engine"), None);
    }

    #[test]
    fn prune_removes_only_expired_engine_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let expired = dir.path().join("convoy.engine.2000-01-01.jsonl");
        let today = dir
            .path()
            .join(format!("convoy.engine.{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let foreign = dir.path().join("other.engine.2000-01-01.jsonl");
        let unrelated = dir.path().join("notes.txt");
        for path in [&expired, &today, &foreign, &unrelated] {
            fs::write(path, "{}").expect("write");
        }

        prune_expired_logs(dir.path(), ProcessKind::Engine, 14).expect("prune");

        assert!(!expired.exists());
        assert!(today.exists());
        assert!(foreign.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn logs_live_under_the_state_root() {
        assert_eq!(
            canonical_logs_dir_from_root(Path::new("/var/lib/convoy")),
            PathBuf::from("/var/lib/convoy/logs")
        );
        assert_eq!(ProcessKind::Engine.log_prefix(), "convoy.engine");
    }
}
