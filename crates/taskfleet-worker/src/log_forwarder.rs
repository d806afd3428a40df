//! Tails per-task log files and ships them to a [`LogStore`] as chunks.
//!
//! Each forwarded task gets its own actor task that exclusively owns the file
//! offset, the byte buffer and the sequence counter, so flushes triggered by
//! size, by time and by shutdown can never interleave. The actor is stopped
//! through a [`CancellationToken`] and performs one last read and flush
//! before exiting.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskfleet_core::{split_into_chunks, LogChunk, TaskId, MAX_CHUNK_BYTES};

use crate::log_store::LogStore;

/// Forwarder tuning.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// How often the log file is checked for new bytes.
    pub poll_interval: Duration,
    /// Longest time buffered output waits before being flushed.
    pub flush_interval: Duration,
    /// Buffered size that triggers an immediate flush.
    pub flush_threshold: usize,
    /// Hard cap on buffered bytes; the oldest are discarded beyond it.
    pub max_buffer: usize,
    /// Upload attempts per chunk.
    pub max_attempts: u32,
    /// Backoff before the second attempt, doubled after that.
    pub retry_backoff: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            flush_interval: Duration::from_secs(10),
            flush_threshold: MAX_CHUNK_BYTES,
            max_buffer: 1024 * 1024,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

type DroppedCounts = Arc<StdMutex<HashMap<TaskId, u64>>>;

struct ActiveForwarder {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Manages one forwarding actor per task.
pub struct LogForwarder {
    store: Arc<dyn LogStore>,
    config: ForwarderConfig,
    active: Mutex<HashMap<TaskId, ActiveForwarder>>,
    dropped: DroppedCounts,
}

impl LogForwarder {
    pub fn new(store: Arc<dyn LogStore>, config: ForwarderConfig) -> Self {
        Self {
            store,
            config,
            active: Mutex::new(HashMap::new()),
            dropped: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Begin tailing `path` for `task_id`. No-op if already forwarding.
    pub async fn start_forwarding(&self, task_id: &TaskId, path: impl Into<PathBuf>) {
        let mut active = self.active.lock().await;
        if active.contains_key(task_id) {
            debug!(task_id = %task_id, "Already forwarding");
            return;
        }

        let path = path.into();
        let cancel = CancellationToken::new();
        let actor = ForwardActor {
            task_id: task_id.clone(),
            path: path.clone(),
            offset: 0,
            buffer: Vec::new(),
            sequence: 0,
            last_flush: Instant::now(),
            store: self.store.clone(),
            config: self.config.clone(),
            dropped: self.dropped.clone(),
        };
        let handle = tokio::spawn(actor.run(cancel.clone()));

        active.insert(task_id.clone(), ActiveForwarder { cancel, handle });
        info!(task_id = %task_id, path = %path.display(), "Log forwarding started");
    }

    /// Stop tailing, flushing whatever is left. No-op if not forwarding.
    pub async fn stop_forwarding(&self, task_id: &TaskId) {
        let Some(forwarder) = self.active.lock().await.remove(task_id) else {
            return;
        };

        forwarder.cancel.cancel();
        if let Err(e) = forwarder.handle.await {
            warn!(task_id = %task_id, error = %e, "Log forwarder task failed");
        }
        info!(task_id = %task_id, "Log forwarding stopped");
    }

    pub async fn is_forwarding(&self, task_id: &TaskId) -> bool {
        self.active.lock().await.contains_key(task_id)
    }

    /// Chunks dropped after exhausting retries. Kept after forwarding stops.
    pub fn dropped_chunk_count(&self, task_id: &TaskId) -> u64 {
        self.dropped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }

    /// Stop every active forwarder.
    pub async fn shutdown(&self) {
        let ids: Vec<TaskId> = self.active.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop_forwarding(&id).await;
        }
    }
}

struct ForwardActor {
    task_id: TaskId,
    path: PathBuf,
    offset: u64,
    buffer: Vec<u8>,
    sequence: u64,
    last_flush: Instant,
    store: Arc<dyn LogStore>,
    config: ForwarderConfig,
    dropped: DroppedCounts,
}

impl ForwardActor {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.read_new_bytes().await;
                    if self.buffer.len() >= self.config.flush_threshold {
                        self.flush(false).await;
                    } else if !self.buffer.is_empty()
                        && self.last_flush.elapsed() >= self.config.flush_interval
                    {
                        self.flush(false).await;
                    }
                }
            }
        }

        self.read_new_bytes().await;
        self.flush(true).await;
    }

    async fn read_new_bytes(&mut self) {
        match read_from(&self.path, self.offset).await {
            Ok(Some((bytes, new_offset))) => {
                self.offset = new_offset;
                if bytes.is_empty() {
                    return;
                }
                self.buffer.extend_from_slice(&bytes);
                if self.buffer.len() > self.config.max_buffer {
                    let excess = self.buffer.len() - self.config.max_buffer;
                    self.buffer.drain(..excess);
                    warn!(task_id = %self.task_id, discarded = excess, "Log buffer full, discarding oldest output");
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(task_id = %self.task_id, error = %e, "Failed to read log file");
            }
        }
    }

    /// Ship the buffer. Unless `final_flush`, an incomplete UTF-8 sequence at
    /// the end is kept for the next read.
    async fn flush(&mut self, final_flush: bool) {
        self.last_flush = Instant::now();

        let keep = if final_flush {
            0
        } else {
            incomplete_utf8_tail(&self.buffer)
        };
        let ready = self.buffer.len() - keep;
        if ready == 0 {
            return;
        }

        let bytes: Vec<u8> = self.buffer.drain(..ready).collect();
        let content = String::from_utf8_lossy(&bytes);

        for piece in split_into_chunks(&content, MAX_CHUNK_BYTES) {
            let chunk = LogChunk::new(self.task_id.clone(), self.sequence, piece);
            self.sequence += 1;
            self.upload(chunk).await;
        }
    }

    async fn upload(&self, chunk: LogChunk) {
        let mut backoff = self.config.retry_backoff;

        for attempt in 1..=self.config.max_attempts {
            match self.store.append(&chunk).await {
                Ok(()) => return,
                Err(e) => {
                    let last = attempt == self.config.max_attempts || !e.is_transient();
                    warn!(
                        task_id = %chunk.task_id,
                        sequence = chunk.sequence,
                        attempt,
                        error = %e,
                        "Chunk upload failed"
                    );
                    if last {
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }

        let mut dropped = self.dropped.lock().unwrap_or_else(|e| e.into_inner());
        *dropped.entry(chunk.task_id.clone()).or_default() += 1;
        warn!(task_id = %chunk.task_id, sequence = chunk.sequence, "Chunk dropped");
    }
}

/// Bytes appended to `path` since `offset`, plus the new offset. `None` when
/// the file does not exist yet. A file shorter than `offset` was truncated
/// and is read from the start.
async fn read_from(path: &Path, offset: u64) -> std::io::Result<Option<(Vec<u8>, u64)>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let len = file.metadata().await?.len();
    let start = if len < offset { 0 } else { offset };
    if len == start {
        return Ok(Some((Vec::new(), start)));
    }

    file.seek(SeekFrom::Start(start)).await?;
    let mut bytes = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut bytes).await?;
    let new_offset = start + bytes.len() as u64;
    Ok(Some((bytes, new_offset)))
}

/// Length of a truncated multi-byte sequence at the end of `bytes`.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let b = bytes[len - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            // Continuation byte, keep looking for the lead byte.
            continue;
        }
        let width = match b {
            b if b & 0b1000_0000 == 0 => 1,
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return 0,
        };
        return if width > back { back } else { 0 };
    }
    0
}
