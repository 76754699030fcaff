//! Persistent interpreter subprocess speaking line-delimited JSON.
//!
//! Each request is one line `{"id": n, "code": "..."}` on the worker's stdin and
//! each reply one line `{"id": n, "ok": bool, "stdout": .., "stderr": .., "error": ..}`
//! on its stdout. The bundled [`DRIVER_SCRIPT`] implements the worker side for
//! Python; any interpreter speaking the same protocol can be configured.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use super::{Artifact, EnvironmentError, ExecutionEnvironment, ExecutionFailure, ExecutionResult};

const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

pub const DRIVER_SCRIPT: &str = r#"
import contextlib, io, json, os, signal, sys, traceback
signal.signal(signal.SIGINT, signal.default_int_handler)
_proto = os.fdopen(os.dup(1), "w")
os.dup2(2, 1)
_ns = {"__name__": "__main__"}
while True:
    try:
        line = sys.stdin.readline()
    except KeyboardInterrupt:
        continue
    if not line:
        break
    try:
        req = json.loads(line)
    except ValueError:
        continue
    out, err = io.StringIO(), io.StringIO()
    ok, error = True, None
    try:
        with contextlib.redirect_stdout(out), contextlib.redirect_stderr(err):
            exec(compile(req.get("code", ""), "<cell>", "exec"), _ns)
    except KeyboardInterrupt:
        ok, error = False, "KeyboardInterrupt: execution interrupted"
    except BaseException:
        ok, error = False, traceback.format_exc()
    _proto.write(json.dumps({"id": req.get("id"), "ok": ok, "stdout": out.getvalue(), "stderr": err.getvalue(), "error": error}) + "\n")
    _proto.flush()
"#;

#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Directory scanned for files created or modified by each call.
    pub artifact_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// How long an interrupted call may take to report back before the worker is killed.
    pub interrupt_grace: Duration,
    pub max_output_bytes: usize,
}

impl ProcessConfig {
    pub fn python(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: "python3".into(),
            args: vec!["-u".into(), "-c".into(), DRIVER_SCRIPT.into()],
            working_dir: working_dir.into(),
            artifact_dir: None,
            env: HashMap::new(),
            interrupt_grace: Duration::from_secs(5),
            max_output_bytes: MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    fn scan_dir(&self) -> &Path {
        self.artifact_dir.as_deref().unwrap_or(&self.working_dir)
    }
}

#[derive(Debug, Deserialize)]
struct WorkerReply {
    id: Option<u64>,
    ok: bool,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    error: Option<String>,
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    pending: Vec<u8>,
}

impl Worker {
    async fn send(&mut self, id: u64, code: &str) -> Result<(), EnvironmentError> {
        let mut line = serde_json::to_vec(&serde_json::json!({ "id": id, "code": code }))
            .map_err(|e| EnvironmentError::Crashed(e.to_string()))?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Read until the reply for `id` arrives. Partial lines survive cancellation.
    async fn read_reply(&mut self, id: u64) -> Result<WorkerReply, EnvironmentError> {
        loop {
            let n = self.stdout.read_until(b'\n', &mut self.pending).await?;
            if n == 0 {
                return Err(EnvironmentError::Crashed("worker closed its output".into()));
            }
            if !self.pending.ends_with(b"\n") {
                continue;
            }
            let line = std::mem::take(&mut self.pending);
            match serde_json::from_slice::<WorkerReply>(&line) {
                Ok(reply) if reply.id == Some(id) => return Ok(reply),
                Ok(reply) => {
                    tracing::debug!(expected = id, got = ?reply.id, "discarding stale worker reply")
                }
                Err(_) => tracing::trace!(
                    line = %String::from_utf8_lossy(&line).trim_end(),
                    "ignoring non-protocol worker output"
                ),
            }
        }
    }

    #[cfg(unix)]
    fn interrupt(&self) -> bool {
        use rustix::process::{Pid, Signal, kill_process};

        let Some(pid) = self.child.id().and_then(|id| Pid::from_raw(id as i32)) else {
            return false;
        };
        kill_process(pid, Signal::INT).is_ok()
    }

    #[cfg(not(unix))]
    fn interrupt(&self) -> bool {
        false
    }

    async fn terminate(mut self) {
        drop(self.stdin);
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "worker already exited");
        }
    }
}

enum Wait {
    Reply(WorkerReply),
    Failed(EnvironmentError),
    TimedOut,
    Cancelled,
}

pub struct ProcessEnvironment {
    config: ProcessConfig,
    worker: Option<Worker>,
    next_id: u64,
}

impl ProcessEnvironment {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            worker: None,
            next_id: 0,
        }
    }

    pub fn python(working_dir: impl Into<PathBuf>) -> Self {
        Self::new(ProcessConfig::python(working_dir))
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    async fn kill_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.terminate().await;
        }
    }

    fn truncate(&self, mut text: String) -> String {
        let max = self.config.max_output_bytes;
        if text.len() > max {
            let boundary = (0..=max)
                .rev()
                .find(|i| text.is_char_boundary(*i))
                .unwrap_or(0);
            text.truncate(boundary);
            text.push_str("\n... [output truncated]");
        }
        text
    }

    async fn scan_artifacts(&self) -> HashMap<PathBuf, (SystemTime, u64)> {
        let root = self.config.scan_dir().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut found = HashMap::new();
            collect_files(&root, 0, &mut found);
            found
        })
        .await
        .unwrap_or_default()
    }

    fn reply_to_result(&self, reply: WorkerReply) -> ExecutionResult {
        let stdout = self.truncate(reply.stdout);
        let mut error_output = reply.stderr;
        if let Some(error) = reply.error {
            if !error_output.is_empty() && !error_output.ends_with('\n') {
                error_output.push('\n');
            }
            error_output.push_str(&error);
        }
        let error_output = self.truncate(error_output);

        if reply.ok {
            ExecutionResult {
                error_output,
                ..ExecutionResult::success(stdout)
            }
        } else {
            ExecutionResult::failure(ExecutionFailure::Code, error_output).with_output(stdout)
        }
    }
}

fn collect_files(dir: &Path, depth: usize, found: &mut HashMap<PathBuf, (SystemTime, u64)>) {
    if depth > 4 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.') || n == "__pycache__");
            if !hidden {
                collect_files(&path, depth + 1, found);
            }
        } else if meta.is_file() {
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.insert(path, (modified, meta.len()));
        }
    }
}

#[async_trait]
impl ExecutionEnvironment for ProcessEnvironment {
    fn name(&self) -> &str {
        "process"
    }

    async fn start(&mut self) -> Result<(), EnvironmentError> {
        if self.worker.is_some() {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.config.working_dir).await?;

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .current_dir(&self.config.working_dir)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            EnvironmentError::Start(format!("failed to spawn '{}': {}", self.config.program, e))
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(EnvironmentError::Start("worker pipes unavailable".into()));
        };

        tracing::debug!(
            program = %self.config.program,
            pid = ?child.id(),
            cwd = %self.config.working_dir.display(),
            "execution worker started"
        );

        self.worker = Some(Worker {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            pending: Vec::new(),
        });
        Ok(())
    }

    async fn execute(
        &mut self,
        code: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let before = self.scan_artifacts().await;

        self.next_id += 1;
        let id = self.next_id;

        let Some(worker) = self.worker.as_mut() else {
            return ExecutionResult::failure(ExecutionFailure::Crash, "environment is not running")
                .with_duration(started.elapsed());
        };

        if let Err(e) = worker.send(id, code).await {
            self.kill_worker().await;
            return ExecutionResult::failure(ExecutionFailure::Crash, e.to_string())
                .with_duration(started.elapsed());
        }

        let wait = tokio::select! {
            biased;
            _ = cancel.cancelled() => Wait::Cancelled,
            reply = tokio::time::timeout(timeout, worker.read_reply(id)) => match reply {
                Ok(Ok(reply)) => Wait::Reply(reply),
                Ok(Err(e)) => Wait::Failed(e),
                Err(_) => Wait::TimedOut,
            },
        };

        let result = match wait {
            Wait::Reply(reply) => self.reply_to_result(reply),
            Wait::Failed(e) => {
                tracing::warn!(error = %e, "execution worker died");
                self.kill_worker().await;
                ExecutionResult::failure(ExecutionFailure::Crash, e.to_string())
            }
            Wait::Cancelled => {
                tracing::info!(call = id, "cancelling execution");
                self.kill_worker().await;
                ExecutionResult::failure(
                    ExecutionFailure::Cancelled,
                    "execution cancelled before completion",
                )
            }
            Wait::TimedOut => {
                let message = format!("execution exceeded {:.1}s", timeout.as_secs_f64());
                let grace = self.config.interrupt_grace;
                let recovered = match self.worker.as_mut() {
                    Some(worker) if worker.interrupt() => {
                        tokio::time::timeout(grace, worker.read_reply(id))
                            .await
                            .ok()
                            .and_then(Result::ok)
                    }
                    _ => None,
                };

                match recovered {
                    Some(reply) => {
                        tracing::warn!(call = id, "execution interrupted after timeout");
                        let partial = self.truncate(reply.stdout);
                        ExecutionResult::failure(ExecutionFailure::Timeout, message)
                            .with_output(partial)
                    }
                    None => {
                        tracing::warn!(call = id, "worker unresponsive after timeout, killing");
                        self.kill_worker().await;
                        ExecutionResult::failure(
                            ExecutionFailure::Timeout,
                            format!("{}; worker terminated", message),
                        )
                    }
                }
            }
        };

        let after = self.scan_artifacts().await;
        let mut artifacts: Vec<Artifact> = after
            .into_iter()
            .filter(|(path, stamp)| before.get(path) != Some(stamp))
            .map(|(path, (_, size))| Artifact::new(path, size))
            .collect();
        artifacts.sort_by(|a, b| a.path.cmp(&b.path));

        result
            .with_artifacts(artifacts)
            .with_duration(started.elapsed())
    }

    fn is_alive(&self) -> bool {
        self.worker.is_some()
    }

    async fn shutdown(&mut self) -> Result<(), EnvironmentError> {
        if let Some(mut worker) = self.worker.take() {
            // Closing stdin lets the driver leave its loop on its own.
            let _ = worker.stdin.shutdown().await;
            match tokio::time::timeout(Duration::from_secs(2), worker.child.wait()).await {
                Ok(_) => {}
                Err(_) => worker.terminate().await,
            }
            tracing::debug!("execution worker stopped");
        }
        Ok(())
    }
}

impl Drop for ProcessEnvironment {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.as_mut() {
            let _ = worker.child.start_kill();
        }
    }
}
