use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

pub const SESSIONS_FILE: &str = "autopilot_sessions.json";
pub const RUN_QUEUE_FILE: &str = "run_queue.json";
pub const PROCESSED_WEBHOOKS_FILE: &str = "processed_webhooks.json";
pub const PULL_REQUESTS_FILE: &str = "pull_requests.json";

/// Named JSON documents under one state directory.
#[derive(Debug, Clone)]
pub struct Storage {
    base: PathBuf,
}

impl Storage {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)
            .await
            .with_context(|| format!("creating state dir {}", base.display()))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }

    /// Missing documents load as `T::default()`. Corrupt ones are an error.
    pub async fn load<T>(&self, name: &str) -> anyhow::Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(T::default());
        }
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Writes to a sibling temp file, then renames over the target.
    pub async fn save<T>(&self, name: &str, value: &T) -> anyhow::Result<()>
    where
        T: Serialize + ?Sized,
    {
        let path = self.path_for(name);
        let tmp = self.base.join(format!(".{name}.tmp"));
        let raw = serde_json::to_string_pretty(value)?;
        fs::write(&tmp, raw)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn missing_document_loads_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path()).await.expect("storage");
        let rows: Vec<String> = storage.load(RUN_QUEUE_FILE).await.expect("load");
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_roundtrips_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path().join("state")).await.expect("storage");
        let mut doc = HashMap::new();
        doc.insert("s-1".to_string(), 3u64);
        storage.save(SESSIONS_FILE, &doc).await.expect("save");

        let loaded: HashMap<String, u64> = storage.load(SESSIONS_FILE).await.expect("load");
        assert_eq!(loaded.get("s-1"), Some(&3));
        assert!(!storage.base().join(".autopilot_sessions.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path()).await.expect("storage");
        fs::write(storage.path_for(PULL_REQUESTS_FILE), "{not json")
            .await
            .expect("write");
        let result: anyhow::Result<Vec<u64>> = storage.load(PULL_REQUESTS_FILE).await;
        assert!(result.is_err());
    }
}
