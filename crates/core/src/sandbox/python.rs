//! Python subprocess runner.
//!
//! The interpreter runs in isolated mode (`-I -S`) with an empty environment,
//! a scratch working directory and per-child rlimits applied between fork and
//! exec. The embedded harness script speaks the line protocol described in
//! the parent module.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, Take};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::{
    CandidateRunner, HarnessReply, PreparedRun, RunJob, RunMode, SandboxError, MAX_OUTPUT_BYTES,
};
use crate::isolation;

/// Interpreter used when none is configured.
pub const DEFAULT_PYTHON_BIN: &str = "python3";

/// Address space reserved for the interpreter itself on top of the
/// candidate's memory limit.
const INTERPRETER_HEADROOM_MB: u64 = 64;

/// Characters of stderr kept in crash reports.
const STDERR_TAIL_CHARS: usize = 2000;

const HARNESS: &str = include_str!("harness.py");

/// Runs candidates under a Python interpreter.
#[derive(Debug, Clone)]
pub struct PythonSandbox {
    python_bin: PathBuf,
    workdir: PathBuf,
}

impl Default for PythonSandbox {
    fn default() -> Self {
        Self::new(DEFAULT_PYTHON_BIN)
    }
}

impl PythonSandbox {
    pub fn new(python_bin: impl Into<PathBuf>) -> Self {
        Self {
            python_bin: python_bin.into(),
            workdir: std::env::temp_dir(),
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    fn command(&self, memory_limit_mb: u64) -> Command {
        let mut cmd = Command::new(&self.python_bin);
        cmd.args(["-I", "-S", "-c", HARNESS])
            .env_clear()
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONHASHSEED", "0")
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let address_space = (memory_limit_mb + INTERPRETER_HEADROOM_MB) * 1024 * 1024;
        // SAFETY: the closure only calls async-signal-safe `setrlimit` and
        // allocates nothing.
        unsafe {
            cmd.pre_exec(move || {
                set_rlimit(libc::RLIMIT_AS, address_space)?;
                set_rlimit(libc::RLIMIT_CORE, 0)?;
                set_rlimit(libc::RLIMIT_FSIZE, 0)?;
                Ok(())
            });
        }
        cmd
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RlimitResource = libc::c_int;

fn set_rlimit(resource: RlimitResource, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid, initialised rlimit struct.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

impl CandidateRunner for PythonSandbox {
    type Prepared = PythonRun;

    async fn prepare(&self, job: RunJob) -> Result<PythonRun, SandboxError> {
        let mut cmd = self.command(job.memory_limit_mb);
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + job.timeout;

        let mut child = cmd.spawn().map_err(SandboxError::Spawn)?;

        if let Some(core) = job.pin_core {
            if let Some(pid) = child.id() {
                if let Err(e) = isolation::pin(pid, core) {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(SandboxError::Isolation(e));
                }
            }
        }

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move { read_stream(stderr).await });

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(SandboxError::Protocol("child stdio was not piped".to_string()));
        };

        let invocation = serde_json::json!({
            "mode": job.mode,
            "source": job.source,
            "function_name": job.function_name,
            "calls": job.calls,
            "min_wall_seconds": job.min_wall_seconds,
            "return_outputs": job.return_outputs,
        });
        let mut payload = serde_json::to_vec(&invocation)
            .map_err(|e| SandboxError::Protocol(e.to_string()))?;
        payload.push(b'\n');
        // Best-effort write; a child that died early is diagnosed from its output.
        let _ = stdin.write_all(&payload).await;
        let _ = stdin.flush().await;

        let mut run = PythonRun {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).take(MAX_OUTPUT_BYTES as u64),
            stderr_task: Some(stderr_task),
            started,
            deadline,
            early_reply: None,
        };

        let first = run.read_line().await?;
        if first.get("status").and_then(|s| s.as_str()) != Some("ready") {
            run.early_reply = Some(parse_reply(first)?);
        } else if job.mode == RunMode::Check {
            let err = SandboxError::Protocol("harness signalled ready in check mode".to_string());
            return Err(run.fail(err).await);
        }
        Ok(run)
    }
}

/// A loaded Python child waiting for the go signal.
pub struct PythonRun {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Take<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<Vec<u8>>>,
    started: Instant,
    deadline: tokio::time::Instant,
    early_reply: Option<HarnessReply>,
}

impl PythonRun {
    /// Read one JSON line from the child, enforcing the deadline.
    async fn read_line(&mut self) -> Result<serde_json::Value, SandboxError> {
        let mut line = String::new();
        let read = tokio::time::timeout_at(self.deadline, self.stdout.read_line(&mut line)).await;
        match read {
            Err(_elapsed) => {
                let err = self.timeout_error();
                Err(self.fail(err).await)
            }
            Ok(Err(e)) => Err(self.fail(SandboxError::Io(e)).await),
            Ok(Ok(0)) => Err(self.crashed().await),
            Ok(Ok(_)) => serde_json::from_str(line.trim()).map_err(|e| {
                SandboxError::Protocol(format!("{e}: {}", truncate(line.trim(), 200)))
            }),
        }
    }

    fn timeout_error(&self) -> SandboxError {
        SandboxError::Timeout {
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    /// Kill and reap the child, then hand back `err`.
    async fn fail(&mut self, err: SandboxError) -> SandboxError {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        err
    }

    /// The child closed stdout without a reply. Reap it and classify the exit.
    async fn crashed(&mut self) -> SandboxError {
        let status = match tokio::time::timeout_at(self.deadline, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => return SandboxError::Io(e),
            Err(_elapsed) => {
                let err = self.timeout_error();
                return self.fail(err).await;
            }
        };
        let stderr = self.stderr_tail().await;
        crash_error(status, stderr)
    }

    async fn stderr_tail(&mut self) -> String {
        let bytes = match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        let text = String::from_utf8_lossy(&bytes);
        let trimmed = text.trim();
        let skip = trimmed.chars().count().saturating_sub(STDERR_TAIL_CHARS);
        trimmed.chars().skip(skip).collect()
    }

    async fn reap(&mut self) -> Result<(), SandboxError> {
        match tokio::time::timeout_at(self.deadline, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(SandboxError::Io(e)),
            Err(_elapsed) => {
                let err = self.timeout_error();
                Err(self.fail(err).await)
            }
        }
    }
}

impl PreparedRun for PythonRun {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn run_workload(&mut self) -> Result<HarnessReply, SandboxError> {
        if let Some(reply) = self.early_reply.take() {
            self.stdin.take();
            return Ok(reply);
        }

        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"go\n").await;
            let _ = stdin.flush().await;
        }

        let line = self.read_line().await?;
        parse_reply(line)
    }

    async fn finish(mut self) -> Result<(), SandboxError> {
        // Closing stdin lets a child that was never released exit.
        self.stdin.take();
        self.reap().await
    }
}

fn parse_reply(mut value: serde_json::Value) -> Result<HarnessReply, SandboxError> {
    // Tagged-enum buffering narrows wide integers to f64; keep outputs out of it.
    let outputs = value.get_mut("outputs").map(serde_json::Value::take);
    let mut reply: HarnessReply =
        serde_json::from_value(value).map_err(|e| SandboxError::Protocol(e.to_string()))?;
    if let HarnessReply::Ok { outputs: slot, .. } = &mut reply {
        *slot = match outputs {
            Some(serde_json::Value::Array(items)) => Some(items),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => {
                return Err(SandboxError::Protocol(format!(
                    "outputs must be an array, got {other}"
                )))
            }
        };
    }
    Ok(reply)
}

fn crash_error(status: Option<ExitStatus>, stderr: String) -> SandboxError {
    SandboxError::Crashed {
        exit_code: status.and_then(|s| s.code()),
        signal: status.and_then(|s| s.signal()),
        stderr,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Read an entire output stream into a byte buffer, capped at [`MAX_OUTPUT_BYTES`].
///
/// Bytes past the cap are drained and discarded so the child never blocks on
/// a full pipe.
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
        let _ = tokio::io::copy(&mut h, &mut tokio::io::sink()).await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
