use crate::types::{OutcomeRecord, WorkerDescriptor};
use async_trait::async_trait;
use quorum_core::{QuorumError, QuorumResult};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Durable home for worker registrations. Read only at start-up.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Write or overwrite a registration.
    async fn save(&self, descriptor: &WorkerDescriptor) -> QuorumResult<()>;
    /// Forget a registration. Unknown ids are not an error.
    async fn remove(&self, worker_id: &str) -> QuorumResult<()>;
    /// Every stored registration.
    async fn load_all(&self) -> QuorumResult<Vec<WorkerDescriptor>>;
}

/// Append-only log of completed outcomes.
#[async_trait]
pub trait OutcomeLog: Send + Sync {
    /// Append one record.
    async fn append(&self, record: &OutcomeRecord) -> QuorumResult<()>;
}

/// File-based catalog store: one JSON file per worker.
///
/// File names are the hex-encoded worker id, so ids containing path
/// separators cannot escape the directory.
pub struct FileCatalogStore {
    dir: PathBuf,
}

impl FileCatalogStore {
    /// Open the store, creating `dir` if needed.
    pub async fn new(dir: PathBuf) -> QuorumResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn worker_path(&self, worker_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(worker_id)))
    }
}

#[async_trait]
impl CatalogStore for FileCatalogStore {
    async fn save(&self, descriptor: &WorkerDescriptor) -> QuorumResult<()> {
        let path = self.worker_path(&descriptor.id);
        let json = serde_json::to_string_pretty(descriptor)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    async fn remove(&self, worker_id: &str) -> QuorumResult<()> {
        let path = self.worker_path(worker_id);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn load_all(&self) -> QuorumResult<Vec<WorkerDescriptor>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut descriptors = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<WorkerDescriptor>(&data) {
                Ok(desc) => descriptors.push(desc),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable worker registration");
                }
            }
        }
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(descriptors)
    }
}

/// Outcome log stored as JSON lines.
pub struct JsonlOutcomeLog {
    path: PathBuf,
}

impl JsonlOutcomeLog {
    /// Open the log, creating its parent directory if needed.
    pub async fn new(path: PathBuf) -> QuorumResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self { path })
    }

    /// The log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every record. Malformed lines are skipped.
    pub async fn read_all(&self) -> QuorumResult<Vec<OutcomeRecord>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        Ok(data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[async_trait]
impl OutcomeLog for JsonlOutcomeLog {
    async fn append(&self, record: &OutcomeRecord) -> QuorumResult<()> {
        let line = format!("{}\n", serde_json::to_string(record)?);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                QuorumError::Store(format!(
                    "Failed to open outcome log '{}': {e}",
                    self.path.display()
                ))
            })?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
