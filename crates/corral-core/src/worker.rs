//! The `Worker` trait -- the adapter interface for the opaque coding agent.
//!
//! A worker is a separate OS process (crash isolation is a hard
//! requirement: the agent is a large external binary). The orchestrator
//! communicates with it only by spawning it and reading its exit status and
//! captured output. Each invocation is a fresh session; workers carry no
//! state between calls.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::process::Command;

/// Commit message used when staging whatever the worker left uncommitted.
const RESIDUE_COMMIT_MESSAGE: &str = "Agent work completed";

/// Why a worker run did not succeed, beyond a plain nonzero exit.
///
/// A timeout is kept distinct from a nonzero exit: the re-planner treats
/// them the same today but must stay free to diverge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerFailure {
    /// The process exceeded its wall-clock budget and was killed.
    TimedOut { limit: Duration },
    /// The process could not be spawned or awaited.
    Spawn(String),
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimedOut { limit } => {
                write!(f, "worker timed out after {}s", limit.as_secs())
            }
            Self::Spawn(msg) => write!(f, "worker could not be started: {msg}"),
        }
    }
}

/// Outcome of one worker invocation.
///
/// `success` means exit code 0 within the timeout. A nonzero exit yields
/// `success = false` with `error = None`; abnormal terminations carry a
/// [`WorkerFailure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub success: bool,
    pub output: String,
    pub error: Option<WorkerFailure>,
}

impl WorkerReport {
    /// Human-readable failure description for comments and state files.
    pub fn error_text(&self) -> String {
        match &self.error {
            Some(failure) => failure.to_string(),
            None => "worker exited with a nonzero status".to_string(),
        }
    }
}

/// Adapter interface for running one coding agent to completion.
///
/// Object-safe so the scheduler can hold `Arc<dyn Worker>` and tests can
/// substitute scripted mocks.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Run an agent in `workdir` with `prompt`, bounded by `timeout`.
    ///
    /// Implementations must return a report rather than an error for
    /// agent-level failures (nonzero exit, timeout); `Err` is reserved for
    /// orchestrator-side defects.
    async fn run(&self, workdir: &Path, prompt: &str, timeout: Duration) -> Result<WorkerReport>;
}

/// Worker adapter for the Claude Code CLI.
///
/// Spawns `claude --dangerously-skip-permissions -p <prompt>` inside the
/// given worktree with unrestricted file and shell tools, then stages and
/// commits anything the agent left uncommitted.
#[derive(Debug, Clone)]
pub struct ClaudeWorker {
    /// Path to the agent binary. Defaults to `"claude"` (found via `$PATH`).
    binary: String,
}

impl ClaudeWorker {
    pub fn new() -> Self {
        Self {
            binary: "claude".to_string(),
        }
    }

    /// Use a custom binary path (non-standard installs, tests).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for ClaudeWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Worker for ClaudeWorker {
    async fn run(&self, workdir: &Path, prompt: &str, timeout: Duration) -> Result<WorkerReport> {
        tracing::debug!(
            workdir = %workdir.display(),
            timeout_secs = timeout.as_secs(),
            "spawning worker"
        );

        let fut = Command::new(&self.binary)
            .arg("--dangerously-skip-permissions")
            .arg("-p")
            .arg(prompt)
            .arg("--allowedTools")
            .args(["Bash", "Read", "Write", "Edit", "MultiEdit"])
            .current_dir(workdir)
            .kill_on_drop(true)
            .output();

        let outcome = tokio::time::timeout(timeout, fut).await;

        // Whatever happened, stage and commit any residue so completed work
        // is reachable from the subtask branch. Non-fatal.
        commit_residue(workdir).await;

        let output = match outcome {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                return Ok(WorkerReport {
                    success: false,
                    output: String::new(),
                    error: Some(WorkerFailure::Spawn(e.to_string())),
                });
            }
            Err(_) => {
                return Ok(WorkerReport {
                    success: false,
                    output: String::new(),
                    error: Some(WorkerFailure::TimedOut { limit: timeout }),
                });
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str("\n---STDERR---\n");
            text.push_str(&stderr);
        }

        Ok(WorkerReport {
            success: output.status.success(),
            output: text,
            error: None,
        })
    }
}

/// `git add -A && git commit` in the worker's directory, ignoring failures
/// ("nothing to commit" is the common case).
async fn commit_residue(workdir: &Path) {
    let add = Command::new("git")
        .args(["add", "-A"])
        .current_dir(workdir)
        .output()
        .await;
    if let Err(e) = add {
        tracing::debug!(error = %e, "git add -A after worker run failed");
        return;
    }
    let commit = Command::new("git")
        .args(["commit", "-m", RESIDUE_COMMIT_MESSAGE])
        .current_dir(workdir)
        .output()
        .await;
    if let Err(e) = commit {
        tracing::debug!(error = %e, "git commit after worker run failed");
    }
}
