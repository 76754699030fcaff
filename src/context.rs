//! Per-run workspace layout.
//!
//! ```text
//! <workspace>/runs/<run_id>/
//!     data/
//!     notebooks/
//!     artifacts/
//!     logs/run.log
//!     logs/events.jsonl
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const RUNS_DIR: &str = "runs";

/// Generate a run id of the form `YYYYMMDD_HHMMSS_xxxxxx`.
pub fn generate_run_id() -> String {
    let now = Utc::now();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..6])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub workspace: PathBuf,
    pub run_path: PathBuf,
    pub data_path: PathBuf,
    pub notebooks_path: PathBuf,
    pub artifacts_path: PathBuf,
    pub logs_path: PathBuf,
    pub start_time: DateTime<Utc>,
}

impl RunContext {
    /// Compute the layout for a fresh run without touching the filesystem.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self::with_run_id(workspace, generate_run_id())
    }

    pub fn with_run_id(workspace: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        let workspace = workspace.into();
        let run_id = run_id.into();
        let run_path = workspace.join(RUNS_DIR).join(&run_id);
        Self {
            data_path: run_path.join("data"),
            notebooks_path: run_path.join("notebooks"),
            artifacts_path: run_path.join("artifacts"),
            logs_path: run_path.join("logs"),
            run_path,
            run_id,
            workspace,
            start_time: Utc::now(),
        }
    }

    /// Compute the layout and create every directory in it.
    pub async fn create(
        workspace: impl Into<PathBuf>,
        run_id: Option<String>,
    ) -> std::io::Result<Self> {
        let context = match run_id {
            Some(id) => Self::with_run_id(workspace, id),
            None => Self::new(workspace),
        };
        context.create_dirs().await?;
        Ok(context)
    }

    pub async fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.data_path,
            &self.notebooks_path,
            &self.artifacts_path,
            &self.logs_path,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        tracing::debug!(run_id = %self.run_id, path = %self.run_path.display(), "run directories created");
        Ok(())
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.logs_path.join("run.log")
    }

    pub fn events_log_path(&self) -> PathBuf {
        self.logs_path.join("events.jsonl")
    }

    pub fn artifact_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.artifacts_path.join(name)
    }

    pub fn notebook_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.notebooks_path.join(name)
    }

    pub fn data_file(&self, name: impl AsRef<Path>) -> PathBuf {
        self.data_path.join(name)
    }
}

impl std::fmt::Display for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RunContext(run_id={}, path={})",
            self.run_id,
            self.run_path.display()
        )
    }
}
