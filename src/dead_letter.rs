use crate::normalize::{NormalizedRecord, StoredDocument};
use crate::reading::Reading;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// One record that could not be written to the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub capture_time: String,
    pub data: Reading,
    pub reason: String,
    pub attempts: u32,
    pub received_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(record: NormalizedRecord, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            capture_time: record.capture_time,
            data: record.payload,
            reason: reason.into(),
            attempts,
            received_at: record.received_at,
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn document(&self) -> StoredDocument {
        StoredDocument {
            capture_time: self.capture_time.clone(),
            data: self.data.clone(),
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn append(&mut self, entry: &DeadLetterEntry) -> Result<()>;
}

/// Append-only JSON-lines file. Each entry is synced before `append` returns.
pub struct FileDeadLetter {
    path: PathBuf,
    file: Option<fs::File>,
}

impl FileDeadLetter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn file(&mut self) -> Result<&mut fs::File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create dead-letter dir {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .with_context(|| format!("open dead-letter file {}", self.path.display()))?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .context("dead-letter file unavailable")
    }
}

#[async_trait]
impl DeadLetterSink for FileDeadLetter {
    async fn append(&mut self, entry: &DeadLetterEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry).context("encode dead-letter entry")?;
        line.push(b'\n');
        let result = async {
            let file = self.file().await?;
            file.write_all(&line).await?;
            file.sync_data().await?;
            anyhow::Ok(())
        }
        .await;
        if result.is_err() {
            // Reopen on the next append in case the file was rotated or removed.
            self.file = None;
        }
        result.with_context(|| format!("append to {}", self.path.display()))
    }
}

pub async fn read_entries(path: &Path) -> Result<Vec<DeadLetterEntry>> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read dead-letter file {}", path.display()))
        }
    };
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("dead-letter entry {} in {}", idx + 1, path.display()))
        })
        .collect()
}
