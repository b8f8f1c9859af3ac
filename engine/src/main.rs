use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use convoy_core::{parse_command, ConfigStore, Storage};
use convoy_observability::{
    canonical_logs_dir_from_root, emit_event, init_console_logging, init_process_logging,
    ObservabilityEvent, ProcessKind,
};
use convoy_orchestrator::{BacklogChunker, BatchRisk, FixedSizeChunker};
use convoy_server::{serve, AppState};
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "convoy-engine")]
#[command(about = "Headless autopilot and attempt scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host")]
        hostname: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        config: Option<String>,
        /// Program run once per attempt, e.g. "sh ./run-attempt.sh".
        #[arg(long)]
        runner_command: Option<String>,
    },
    /// Chunks a task list into batches and prints them as JSON.
    Plan {
        #[arg(long, default_value_t = 3)]
        batch_size: usize,
        #[arg(long, value_parser = parse_risk, default_value = "low")]
        risk: BatchRisk,
        #[arg(required = true)]
        tasks: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            config,
            runner_command,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let overrides = build_cli_overrides(hostname, port, runner_command)?;
            let config_path = config
                .map(PathBuf::from)
                .unwrap_or_else(|| state_dir.join("config.json"));
            let config = ConfigStore::new(&config_path, overrides).await?;
            let effective = config.get().await;

            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let _log_guard = init_process_logging(
                ProcessKind::Engine,
                &logs_dir,
                effective.logging.retention_days,
            )?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("engine jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!("engine logging initialized: logs_dir={}", logs_dir.display());

            let addr: SocketAddr = format!("{}:{}", effective.server.hostname, effective.server.port)
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&state_dir, config.path(), &addr);

            let storage = Storage::new(state_dir.join("storage")).await?;
            let state = match AppState::from_config(config, storage).await {
                Ok(state) => state,
                Err(err) => {
                    let detail = format!("{err:#}");
                    emit_event(
                        tracing::Level::ERROR,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "engine.startup.failed",
                            component: "engine.main",
                            status: Some("failed"),
                            error_code: Some("ENGINE_STARTUP_FAILED"),
                            detail: Some(&detail),
                            ..Default::default()
                        },
                    );
                    return Err(err);
                }
            };
            serve(addr, state).await?;
        }
        Command::Plan {
            batch_size,
            risk,
            tasks,
        } => {
            init_console_logging();
            let batches = FixedSizeChunker::new(batch_size)
                .with_risk(risk)
                .chunk(&tasks);
            println!("{}", serde_json::to_string_pretty(&batches)?);
        }
    }

    Ok(())
}

fn build_cli_overrides(
    hostname: Option<String>,
    port: Option<u16>,
    runner_command: Option<String>,
) -> anyhow::Result<Option<Value>> {
    let mut root = Map::new();

    let mut server = Map::new();
    if let Some(hostname) = hostname.filter(|h| !h.trim().is_empty()) {
        server.insert("hostname".to_string(), Value::String(hostname));
    }
    if let Some(port) = port {
        server.insert("port".to_string(), json!(port));
    }
    if !server.is_empty() {
        root.insert("server".to_string(), Value::Object(server));
    }

    if let Some(command) = runner_command {
        let Some(parts) = parse_command(&command) else {
            anyhow::bail!("--runner-command has unbalanced quoting: {command}");
        };
        if !parts.is_empty() {
            root.insert("runner".to_string(), json!({ "command": parts }));
        }
    }

    if root.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Value::Object(root)))
    }
}

fn parse_risk(raw: &str) -> Result<BatchRisk, String> {
    serde_json::from_value(Value::String(raw.trim().to_ascii_lowercase()))
        .map_err(|_| format!("unknown risk `{raw}`, expected low, med or high"))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("CONVOY_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".convoy")
}

fn log_startup_paths(state_dir: &Path, config_path: &Path, addr: &SocketAddr) {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting convoy-engine on http://{addr}");
    info!(
        "startup paths: cwd={} state_dir={} config_path={}",
        cwd.display(),
        state_dir.display(),
        config_path.display()
    );
}
