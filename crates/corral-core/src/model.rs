//! Domain model: the persistent `Run` document, its `Subtask` set, and the
//! status/phase enums, plus the subtask transition graph.
//!
//! A `Run` is the single source of truth for one orchestration. It is owned
//! exclusively by the supervisor task and persisted through
//! [`crate::store::RunStore`] after every mutation.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of an individual subtask.
///
/// `Ready` is a transient scheduling bucket (dependencies met, awaiting a
/// worker slot); the scheduler computes it on the fly and never persists it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Complete,
    Failed,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    /// All statuses in declaration order, for status-count reports.
    pub const ALL: [TaskStatus; 7] = [
        Self::Pending,
        Self::Ready,
        Self::Running,
        Self::Complete,
        Self::Failed,
        Self::Blocked,
        Self::Cancelled,
    ];

    /// A terminal subtask is never reconsidered by the scheduler.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::Blocked | Self::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid status or phase string.
#[derive(Debug, Clone)]
pub struct StatusParseError(pub String);

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid status value: {:?}", self.0)
    }
}

impl std::error::Error for StatusParseError {}

// ---------------------------------------------------------------------------

/// High-level phase of an orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Planning,
    Executing,
    Merging,
    Reviewing,
    Complete,
    Stopped,
    Failed,
}

impl RunPhase {
    /// `Stopped` and `Failed` are absorbing; `Complete` ends the forward path.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Merging => "merging",
            Self::Reviewing => "reviewing",
            Self::Complete => "complete",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for RunPhase {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "executing" => Ok(Self::Executing),
            "merging" => Ok(Self::Merging),
            "reviewing" => Ok(Self::Reviewing),
            "complete" => Ok(Self::Complete),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(StatusParseError(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------

/// Decision returned by the re-planning worker after a subtask failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplanAction {
    Retry,
    Bridge,
    Cancel,
}

impl fmt::Display for ReplanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Retry => "retry",
            Self::Bridge => "bridge",
            Self::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Transition graph
// ---------------------------------------------------------------------------

/// Check whether `from -> to` is an edge of the subtask state machine.
///
/// ```text
/// pending  -> running            (worker slot acquired)
/// pending  -> blocked            (an ancestor failed or was cancelled)
/// pending  -> cancelled          (operator intervention)
/// ready    -> running | blocked | cancelled
/// running  -> complete | failed
/// failed   -> pending            (re-plan chose retry)
/// ```
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Pending, TaskStatus::Running)
            | (TaskStatus::Pending, TaskStatus::Blocked)
            | (TaskStatus::Pending, TaskStatus::Cancelled)
            | (TaskStatus::Ready, TaskStatus::Running)
            | (TaskStatus::Ready, TaskStatus::Blocked)
            | (TaskStatus::Ready, TaskStatus::Cancelled)
            | (TaskStatus::Running, TaskStatus::Complete)
            | (TaskStatus::Running, TaskStatus::Failed)
            | (TaskStatus::Failed, TaskStatus::Pending)
    )
}

/// Error returned by [`Subtask::advance`] for an illegal transition.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid subtask transition {from} -> {to} for {id:?}")]
pub struct TransitionError {
    pub id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

// ---------------------------------------------------------------------------
// Subtask
// ---------------------------------------------------------------------------

/// One unit of coding work, executed by a single worker on its own branch.
///
/// The `description` is a standalone prompt: it must carry every piece of
/// context the worker needs, because workers never see sibling subtasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_files: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub card_id: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub result_summary: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub replanned: bool,
}

fn default_priority() -> i64 {
    99
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Subtask {
    /// Create a fresh pending subtask.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        dependencies: Vec<String>,
        estimated_files: Vec<String>,
        priority: i64,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            dependencies,
            estimated_files,
            priority,
            status: TaskStatus::Pending,
            card_id: None,
            branch: None,
            worktree_path: None,
            started_at: None,
            completed_at: None,
            result_summary: None,
            error: None,
            merged: false,
            replanned: false,
        }
    }

    /// Validate and apply a status transition, stamping timestamps.
    ///
    /// `started_at` is set on entry to `running`; `completed_at` on entry to
    /// `complete` or `failed`.
    pub fn advance(&mut self, to: TaskStatus) -> Result<(), TransitionError> {
        if !is_valid_transition(self.status, to) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        match to {
            TaskStatus::Running => self.started_at = Some(Utc::now().to_rfc3339()),
            TaskStatus::Complete | TaskStatus::Failed => {
                self.completed_at = Some(Utc::now().to_rfc3339());
            }
            _ => {}
        }
        self.status = to;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Persistent state for one end-to-end orchestration of a parent card.
///
/// The run id, parent card id, title, and parent branch are fixed at
/// creation. Everything else mutates as the supervisor drives the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub parent_card_id: String,
    pub parent_card_title: String,
    pub parent_branch: String,
    #[serde(default)]
    pub original_list_id: Option<String>,
    #[serde(default)]
    pub subtask_list_id: Option<String>,
    #[serde(default = "default_phase")]
    pub phase: RunPhase,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default = "now_rfc3339")]
    pub created_at: String,
    #[serde(default = "now_rfc3339")]
    pub updated_at: String,
    #[serde(default)]
    pub last_status_post: Option<String>,
    #[serde(default)]
    pub status_post_count: u64,
    #[serde(default)]
    pub total_workers_spawned: u64,
    #[serde(default)]
    pub review_done: bool,
}

fn default_phase() -> RunPhase {
    RunPhase::Planning
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl Run {
    /// Create a new run in the `planning` phase.
    pub fn new(
        run_id: impl Into<String>,
        parent_card_id: impl Into<String>,
        parent_card_title: impl Into<String>,
        parent_branch: impl Into<String>,
        original_list_id: Option<String>,
    ) -> Self {
        let now = now_rfc3339();
        Self {
            run_id: run_id.into(),
            parent_card_id: parent_card_id.into(),
            parent_card_title: parent_card_title.into(),
            parent_branch: parent_branch.into(),
            original_list_id,
            subtask_list_id: None,
            phase: RunPhase::Planning,
            subtasks: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
            last_status_post: None,
            status_post_count: 0,
            total_workers_spawned: 0,
            review_done: false,
        }
    }

    pub fn find_subtask(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub fn find_subtask_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.id == id)
    }

    /// Titles of all subtasks currently in `complete`.
    pub fn completed_titles(&self) -> Vec<String> {
        self.subtasks
            .iter()
            .filter(|s| s.status == TaskStatus::Complete)
            .map(|s| s.title.clone())
            .collect()
    }

    /// Ids of subtasks whose dependencies are all complete, sorted by
    /// ascending priority; insertion order breaks ties (the sort is stable).
    pub fn ready_subtasks(&self) -> Vec<String> {
        let completed = self.completed_titles();
        let mut ready: Vec<&Subtask> = self
            .subtasks
            .iter()
            .filter(|s| s.status == TaskStatus::Pending)
            .filter(|s| s.dependencies.iter().all(|d| completed.contains(d)))
            .collect();
        ready.sort_by_key(|s| s.priority);
        ready.into_iter().map(|s| s.id.clone()).collect()
    }

    /// True when every subtask has reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.subtasks.iter().all(|s| s.status.is_terminal())
    }

    pub fn running_count(&self) -> usize {
        self.count_with_status(TaskStatus::Running)
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.subtasks.iter().filter(|s| s.status == status).count()
    }

    /// Status counts in declaration order (zero counts included).
    pub fn status_counts(&self) -> Vec<(TaskStatus, usize)> {
        TaskStatus::ALL
            .iter()
            .map(|&st| (st, self.count_with_status(st)))
            .collect()
    }

    /// Block every subtask that transitively depends on `failed_title`.
    ///
    /// Only subtasks still in `pending` (or the transient `ready`) are
    /// moved; running and terminal subtasks are left alone. Returns the
    /// titles that were blocked.
    pub fn block_dependents_of(&mut self, failed_title: &str) -> Vec<String> {
        let mut doomed: Vec<String> = vec![failed_title.to_string()];
        let mut blocked = Vec::new();
        let mut cursor = 0;
        while cursor < doomed.len() {
            let current = doomed[cursor].clone();
            cursor += 1;
            for st in &mut self.subtasks {
                if doomed.contains(&st.title) {
                    continue;
                }
                if !st.dependencies.iter().any(|d| d == &current) {
                    continue;
                }
                doomed.push(st.title.clone());
                if matches!(st.status, TaskStatus::Pending | TaskStatus::Ready) {
                    st.status = TaskStatus::Blocked;
                    blocked.push(st.title.clone());
                }
            }
        }
        blocked
    }

    /// Stamp `updated_at`; called by the store on every save.
    pub fn touch(&mut self) {
        self.updated_at = now_rfc3339();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
