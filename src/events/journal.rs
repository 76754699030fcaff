//! JSON Lines journal of a run's events.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use super::EventStream;

/// Writes every event of a stream to a `.jsonl` file, one event per line.
#[derive(Debug, Clone)]
pub struct EventJournal {
    path: PathBuf,
}

impl EventJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drain `events` into the journal, returning the number of lines written.
    pub async fn record(&self, mut events: EventStream) -> crate::Result<usize> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let mut written = 0;
        while let Some(event) = events.next().await {
            let mut line = serde_json::to_vec(&event)?;
            line.push(b'\n');
            file.write_all(&line).await?;
            written += 1;
        }
        file.flush().await?;

        tracing::debug!(path = %self.path.display(), events = written, "event journal closed");
        Ok(written)
    }

    /// Record in the background until the stream ends.
    pub fn spawn(self, events: EventStream) -> tokio::task::JoinHandle<crate::Result<usize>> {
        tokio::spawn(async move { self.record(events).await })
    }
}
