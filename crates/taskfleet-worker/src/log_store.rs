//! Persistent destinations for log chunks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use taskfleet_core::{LogChunk, TaskId};

/// Errors from persisting a chunk.
#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("log store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("log store request failed: {0}")]
    Transport(String),

    #[error("log store rejected chunk with status {status}")]
    Rejected { status: u16 },
}

impl LogStoreError {
    /// Worth retrying: I/O, transport and 5xx failures.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::Transport(_) => true,
            Self::Rejected { status } => *status >= 500,
            Self::Serialize(_) => false,
        }
    }
}

/// Accepts log chunks for persistence.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, chunk: &LogChunk) -> Result<(), LogStoreError>;
}

/// Append-only JSON Lines, one file per task.
#[derive(Debug, Clone)]
pub struct FileLogStore {
    dir: PathBuf,
}

impl FileLogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", task_id))
    }

    /// All chunks of a task, ordered by sequence.
    pub async fn read_chunks(&self, task_id: &TaskId) -> Result<Vec<LogChunk>, LogStoreError> {
        read_jsonl(&self.path_for(task_id)).await
    }
}

async fn read_jsonl(path: &Path) -> Result<Vec<LogChunk>, LogStoreError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut chunks = raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str::<LogChunk>)
        .collect::<Result<Vec<_>, _>>()?;
    chunks.sort_by_key(|c| c.sequence);
    Ok(chunks)
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn append(&self, chunk: &LogChunk) -> Result<(), LogStoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut line = serde_json::to_string(chunk)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(&chunk.task_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(task_id = %chunk.task_id, sequence = chunk.sequence, "Chunk appended");
        Ok(())
    }
}

/// POSTs each chunk to an ingest endpoint.
#[derive(Debug, Clone)]
pub struct HttpLogStore {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpLogStore {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self, LogStoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LogStoreError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl LogStore for HttpLogStore {
    async fn append(&self, chunk: &LogChunk) -> Result<(), LogStoreError> {
        let mut request = self.client.post(&self.url).json(chunk);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LogStoreError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LogStoreError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
