use crate::shared::workspace_id::sanitize_entity_id;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Metadata attached to every persisted stream entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamHeaders {
    pub role: String,
    pub message_id: String,
    /// Set to "external" for entries injected from outside this process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// One conversation event. `key` is the idempotency key; appending the same
/// key twice persists the entry once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEntry {
    pub key: String,
    pub value: Value,
    pub headers: StreamHeaders,
}

/// Append handle for one session's stream.
#[async_trait]
pub trait StreamProducer: Send + Sync {
    async fn append(&self, entry: &StreamEntry) -> Result<()>;
    async fn flush(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait StreamReader: Send + Sync {
    /// All surviving entries for the session, oldest first. Missing streams
    /// read as empty.
    async fn read_entries(&self, session_id: &str) -> Result<Vec<StreamEntry>>;
}

#[async_trait]
pub trait StreamService: Send + Sync {
    async fn connect(&self, session_id: &str) -> Result<Arc<dyn StreamProducer>>;
}

/// NDJSON-file-backed stream store, one file per session id.
pub struct FileStreamService {
    root: PathBuf,
}

impl FileStreamService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn stream_path(&self, session_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.ndjson", sanitize_entity_id(session_id)))
    }

    fn load_entries(&self, session_id: &str) -> Result<Vec<StreamEntry>> {
        let path = self.stream_path(session_id);
        let Ok(raw) = fs::read_to_string(&path) else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for line in raw.lines() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StreamEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => debug!("Skipping malformed stream line in {}: {err}", path.display()),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl StreamService for FileStreamService {
    async fn connect(&self, session_id: &str) -> Result<Arc<dyn StreamProducer>> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create stream dir {}", self.root.display()))?;
        let path = self.stream_path(session_id);

        // Prior keys seed the dedup set so redelivered events stay no-ops
        // across reconnects.
        let seen: HashSet<String> = self
            .load_entries(session_id)?
            .into_iter()
            .map(|entry| entry.key)
            .collect();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open stream file {}", path.display()))?;

        Ok(Arc::new(FileStreamProducer {
            state: Mutex::new(ProducerState {
                writer: Some(BufWriter::new(file)),
                seen,
            }),
        }))
    }
}

#[async_trait]
impl StreamReader for FileStreamService {
    async fn read_entries(&self, session_id: &str) -> Result<Vec<StreamEntry>> {
        self.load_entries(session_id)
    }
}

struct ProducerState {
    writer: Option<BufWriter<File>>,
    seen: HashSet<String>,
}

struct FileStreamProducer {
    state: Mutex<ProducerState>,
}

#[async_trait]
impl StreamProducer for FileStreamProducer {
    async fn append(&self, entry: &StreamEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.seen.contains(&entry.key) {
            debug!("Dropping duplicate stream entry {}", entry.key);
            return Ok(());
        }
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("Stream producer already closed"))?;
        serde_json::to_writer(&mut *writer, entry).context("Failed to encode stream entry")?;
        writer
            .write_all(b"\n")
            .context("Failed to write stream entry")?;
        state.seen.insert(entry.key.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(writer) = state.writer.as_mut() {
            writer.flush().context("Failed to flush stream")?;
            writer
                .get_ref()
                .sync_all()
                .context("Failed to sync stream")?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(mut writer) = state.writer.take() {
            writer.flush().context("Failed to flush stream on close")?;
        }
        Ok(())
    }
}
