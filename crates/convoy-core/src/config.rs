use std::path::{Path, PathBuf};
use std::sync::Arc;

use convoy_orchestrator::{AutopilotMode, BatchRisk};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use crate::{DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_ENGINE_HOST.to_string(),
            port: DEFAULT_ENGINE_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { retention_days: 14 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RunnerConfig {
    /// Program plus arguments run once per attempt. `None` leaves attempts
    /// detached for an external runner to finish over HTTP.
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub batch_size: usize,
    pub risk: BatchRisk,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            risk: BatchRisk::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScopeBy {
    #[default]
    Project,
    Task,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchedulerConfig {
    pub scope_by: ScopeBy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotConfig {
    pub default_mode: AutopilotMode,
    /// Launch the next runnable task as soon as a transition allows it.
    pub auto_launch: bool,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            default_mode: AutopilotMode::Auto,
            auto_launch: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub runner: RunnerConfig,
    pub chunker: ChunkerConfig,
    pub scheduler: SchedulerConfig,
    pub autopilot: AutopilotConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = read_json_file(&path).await?;
        let layers = ConfigLayers {
            file,
            env: env_layer(),
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self) -> EngineConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("invalid engine config, using defaults: {}", err);
                EngineConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "file": layers.file,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    pub async fn patch_file(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.file, &patch);
        }
        self.save_file().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }

    async fn save_file(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.file.clone();
        write_json_file(&self.path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();

    if let Some(hostname) = lookup("CONVOY_HOSTNAME") {
        if !hostname.trim().is_empty() {
            deep_merge(&mut root, &json!({ "server": { "hostname": hostname.trim() } }));
        }
    }
    if let Some(port) = lookup("CONVOY_PORT").and_then(|raw| raw.trim().parse::<u16>().ok()) {
        deep_merge(&mut root, &json!({ "server": { "port": port } }));
    }
    if let Some(command) = lookup("CONVOY_RUNNER_COMMAND") {
        match parse_command(&command) {
            Some(parts) if !parts.is_empty() => {
                deep_merge(&mut root, &json!({ "runner": { "command": parts } }));
            }
            Some(_) => {}
            None => tracing::warn!("ignoring CONVOY_RUNNER_COMMAND with unbalanced quoting"),
        }
    }
    if let Some(size) = lookup("CONVOY_BATCH_SIZE").and_then(|raw| raw.trim().parse::<usize>().ok())
    {
        deep_merge(&mut root, &json!({ "chunker": { "batch_size": size } }));
    }
    if let Some(scope_by) = lookup("CONVOY_SCOPE_BY") {
        match scope_by.trim().to_ascii_lowercase().as_str() {
            value @ ("project" | "task") => {
                deep_merge(&mut root, &json!({ "scheduler": { "scope_by": value } }));
            }
            _ => {}
        }
    }
    if let Some(days) =
        lookup("CONVOY_LOG_RETENTION_DAYS").and_then(|raw| raw.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "logging": { "retention_days": days } }));
    }

    root
}

/// Splits a command line with POSIX shell quoting. `None` when the quoting
/// is unbalanced.
pub fn parse_command(raw: &str) -> Option<Vec<String>> {
    shlex::split(raw)
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
