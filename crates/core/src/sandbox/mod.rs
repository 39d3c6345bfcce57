//! Sandboxed execution of untrusted candidate code.
//!
//! Candidates never run in-process. Each run is a short-lived child process
//! that receives one JSON invocation on stdin and answers with one tagged
//! JSON line on stdout. Runs happen in two phases so that interpreter start-up
//! and code loading stay outside any energy window:
//!
//! 1. [`CandidateRunner::prepare`] spawns the child, applies resource limits,
//!    optionally pins it and waits until the candidate is loaded.
//! 2. [`PreparedRun::run_workload`] releases the child to run the workload
//!    and returns as soon as its reply line arrives.
//! 3. [`PreparedRun::finish`] reaps the child. Interpreter teardown happens
//!    here, after any energy window has closed.
//!
//! Wall-clock deadlines are enforced by the parent, never by a CPU-time
//! limit.

mod python;

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::isolation::IsolationError;
use crate::types::CpuId;

pub use python::{PythonSandbox, DEFAULT_PYTHON_BIN};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum stdout or stderr captured per stream (1 MiB).
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Modules candidate code may import.
pub const ALLOWED_IMPORTS: &[&str] = &[
    "math",
    "collections",
    "itertools",
    "functools",
    "heapq",
    "bisect",
    "random",
    "typing",
    "string",
    "re",
    "operator",
    "fractions",
    "decimal",
    "statistics",
    "copy",
    "dataclasses",
    "array",
];

// ---------------------------------------------------------------------------
// Jobs and replies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Load the source and resolve the function, run nothing.
    Check,
    /// Load, then run the call list once released.
    Run,
}

/// Everything a runner needs for one child process.
#[derive(Debug, Clone)]
pub struct RunJob {
    pub mode: RunMode,
    pub source: String,
    pub function_name: String,
    /// Positional argument lists, applied as `f(*args)`.
    pub calls: Vec<Vec<Value>>,
    /// Wall-clock deadline for the whole child lifetime.
    pub timeout: Duration,
    pub memory_limit_mb: u64,
    /// Repeat the call list until this much wall time has elapsed.
    pub min_wall_seconds: f64,
    /// Return the outputs of the first pass over `calls`.
    pub return_outputs: bool,
    /// Pin the child to this core right after spawn.
    pub pin_core: Option<CpuId>,
}

impl RunJob {
    pub fn check(
        source: impl Into<String>,
        function_name: impl Into<String>,
        timeout: Duration,
        memory_limit_mb: u64,
    ) -> Self {
        Self {
            mode: RunMode::Check,
            source: source.into(),
            function_name: function_name.into(),
            calls: Vec::new(),
            timeout,
            memory_limit_mb,
            min_wall_seconds: 0.0,
            return_outputs: false,
            pin_core: None,
        }
    }

    pub fn run(
        source: impl Into<String>,
        function_name: impl Into<String>,
        calls: Vec<Vec<Value>>,
        timeout: Duration,
        memory_limit_mb: u64,
    ) -> Self {
        Self {
            mode: RunMode::Run,
            source: source.into(),
            function_name: function_name.into(),
            calls,
            timeout,
            memory_limit_mb,
            min_wall_seconds: 0.0,
            return_outputs: true,
            pin_core: None,
        }
    }

    pub fn with_min_wall_seconds(mut self, seconds: f64) -> Self {
        self.min_wall_seconds = seconds;
        self
    }

    pub fn with_return_outputs(mut self, return_outputs: bool) -> Self {
        self.return_outputs = return_outputs;
        self
    }

    pub fn pinned_to(mut self, core: CpuId) -> Self {
        self.pin_core = Some(core);
        self
    }
}

/// Structured answer from the child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HarnessReply {
    Ok {
        #[serde(default)]
        outputs: Option<Vec<Value>>,
        #[serde(default)]
        repeat_count: u64,
        #[serde(default)]
        wall_seconds: f64,
    },
    LoadError {
        message: String,
    },
    Exception {
        message: String,
        #[serde(default)]
        call_index: Option<usize>,
    },
    MemoryExceeded {
        message: String,
    },
}

impl HarnessReply {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Short description for logs and trial failure messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Ok { repeat_count, .. } => format!("ok ({repeat_count} passes)"),
            Self::LoadError { message } => format!("load error: {message}"),
            Self::Exception { message, .. } => format!("exception: {message}"),
            Self::MemoryExceeded { message } => format!("memory exceeded: {message}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The child could not produce a structured reply.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Candidate exceeded the wall-clock limit after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Candidate process crashed (exit code {exit_code:?}, signal {signal:?}): {stderr}")]
    Crashed {
        exit_code: Option<i32>,
        signal: Option<i32>,
        stderr: String,
    },

    #[error("Malformed reply from sandbox: {0}")]
    Protocol(String),

    #[error("Failed to spawn sandbox interpreter: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Isolation(#[from] IsolationError),
}

impl SandboxError {
    /// Whether a crash report looks like the interpreter ran out of memory.
    pub fn is_memory_crash(&self) -> bool {
        matches!(self, Self::Crashed { stderr, .. } if stderr.contains("MemoryError"))
    }
}

// ---------------------------------------------------------------------------
// Runner traits
// ---------------------------------------------------------------------------

/// A spawned, loaded child waiting to be released.
pub trait PreparedRun: Send + Sized {
    /// Process id of the child, if it has not been reaped yet.
    fn pid(&self) -> Option<u32>;

    /// Release the child and wait for its reply. The child may still be
    /// shutting down when this resolves.
    fn run_workload(&mut self) -> impl Future<Output = Result<HarnessReply, SandboxError>> + Send;

    /// Wait for the child to exit.
    fn finish(self) -> impl Future<Output = Result<(), SandboxError>> + Send;

    /// [`run_workload`](Self::run_workload) then [`finish`](Self::finish).
    fn execute(mut self) -> impl Future<Output = Result<HarnessReply, SandboxError>> + Send {
        async move {
            let reply = self.run_workload().await?;
            self.finish().await?;
            Ok(reply)
        }
    }
}

/// Executes candidate code in an isolated child process.
pub trait CandidateRunner: Send + Sync {
    type Prepared: PreparedRun;

    /// Spawn and load. Load failures surface later from `run_workload` as replies.
    fn prepare(
        &self,
        job: RunJob,
    ) -> impl Future<Output = Result<Self::Prepared, SandboxError>> + Send;

    /// Prepare and execute in one step.
    fn run(&self, job: RunJob) -> impl Future<Output = Result<HarnessReply, SandboxError>> + Send {
        async move { self.prepare(job).await?.execute().await }
    }

    /// Compile the source and resolve the function without running it.
    fn check(
        &self,
        source: &str,
        function_name: &str,
        timeout: Duration,
        memory_limit_mb: u64,
    ) -> impl Future<Output = Result<HarnessReply, SandboxError>> + Send {
        self.run(RunJob::check(source, function_name, timeout, memory_limit_mb))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
