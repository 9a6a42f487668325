//! The scheduling loop: DAG-aware worker dispatch with bounded concurrency,
//! failure re-planning, the human approval gate, and graceful stop.
//!
//! One loop instance drives one run. Each poll cycle performs, in order:
//! stop check, harvest, re-plan, terminal check (with the one-shot
//! self-review), approval gate, slot fill, periodic status, save, sleep.
//! State is persisted after every mutating step so a crash or stop resumes
//! cleanly from the document.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::git::{GitDriver, branch_slug};
use crate::model::{Run, Subtask, TaskStatus};
use crate::replan;
use crate::review::{self, ReviewOutcome};
use crate::status;
use crate::store::RunStore;
use crate::worker::{Worker, WorkerFailure, WorkerReport};
use crate::workitem::{BOT_MARKER, WorkItemPort};

/// Knobs for the scheduling loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of concurrently running workers.
    pub max_agents: usize,
    /// Sleep between poll cycles.
    pub poll_interval: Duration,
    /// Wall-clock budget per worker.
    pub worker_timeout: Duration,
    /// Total-workers-spawned ceiling before the approval gate engages.
    pub worker_limit: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_agents: 3,
            poll_interval: Duration::from_secs(30),
            worker_timeout: Duration::from_secs(900),
            worker_limit: 10,
        }
    }
}

/// Why the scheduling loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Every subtask reached a terminal status; proceed to the merger.
    AllTerminal,
    /// A stop was requested; in-flight workers were drained.
    Stopped,
}

/// Message sent from a spawned worker task back to the loop.
struct WorkerDone {
    subtask_id: String,
    report: WorkerReport,
}

/// Longest worker output echoed into a card comment.
const COMMENT_OUTPUT_LIMIT: usize = 2000;

/// Longest worker output kept in the state document.
const SUMMARY_LIMIT: usize = 500;

/// Subtask branch names are capped for filesystem and remote friendliness.
const BRANCH_NAME_LIMIT: usize = 50;

fn continue_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bcontinue\b").expect("static regex"))
}

/// The scheduling loop and its cross-cycle gate state.
pub struct Scheduler {
    port: Arc<dyn WorkItemPort>,
    worker: Arc<dyn Worker>,
    git: GitDriver,
    store: RunStore,
    config: SchedulerConfig,
    /// List the parent card must stay on; moving it off stops the run.
    trigger_list_id: String,
    cancel: CancellationToken,
    /// True while waiting for a human `continue` after the limit notice.
    paused: bool,
    /// Id of the limit-reached comment; only newer comments count.
    pause_comment_id: Option<String>,
    /// Set once a human approves continuation; the limit no longer applies.
    approved: bool,
}

impl Scheduler {
    pub fn new(
        port: Arc<dyn WorkItemPort>,
        worker: Arc<dyn Worker>,
        git: GitDriver,
        store: RunStore,
        config: SchedulerConfig,
        trigger_list_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port,
            worker,
            git,
            store,
            config,
            trigger_list_id: trigger_list_id.into(),
            cancel,
            paused: false,
            pause_comment_id: None,
            approved: false,
        }
    }

    /// Drive the run until every subtask is terminal or a stop arrives.
    pub async fn run(&mut self, run: &mut Run) -> Result<LoopOutcome> {
        let (tx, mut rx) = mpsc::channel::<WorkerDone>(self.config.max_agents.max(1) * 2);
        let mut in_flight: usize = 0;
        let mut cycle: u64 = 0;

        loop {
            cycle += 1;
            tracing::debug!(cycle, run_id = %run.run_id, "poll cycle");

            // 1. Stop check.
            if self.should_stop(run).await {
                self.drain_and_stop(run, &mut rx, in_flight).await?;
                return Ok(LoopOutcome::Stopped);
            }

            // 2. Harvest completed workers (non-blocking).
            while let Ok(done) = rx.try_recv() {
                in_flight = in_flight.saturating_sub(1);
                self.harvest(run, done).await?;
            }
            self.store.save(run)?;

            // 3. Re-plan fresh failures, once each.
            let fresh_failures: Vec<String> = run
                .subtasks
                .iter()
                .filter(|s| s.status == TaskStatus::Failed && !s.replanned)
                .map(|s| s.id.clone())
                .collect();
            for id in fresh_failures {
                if let Some(st) = run.find_subtask_mut(&id) {
                    st.replanned = true;
                }
                replan::replan_failure(
                    run,
                    &id,
                    self.worker.as_ref(),
                    self.port.as_ref(),
                    self.git.repo_path(),
                )
                .await?;
                self.store.save(run)?;
            }

            // 4. Terminal check, including the one-shot self-review.
            if run.all_terminal() && in_flight == 0 {
                if !run.review_done {
                    // Flag first so the review can never run twice, even if
                    // it errors midway.
                    run.review_done = true;
                    self.store.save(run)?;
                    let outcome = review::reassess(
                        run,
                        self.worker.as_ref(),
                        self.port.as_ref(),
                        &self.git,
                        self.config.max_agents,
                    )
                    .await?;
                    self.store.save(run)?;
                    if let ReviewOutcome::Continue { issues } = outcome {
                        tracing::info!(issues, "critical fixes queued, continuing loop");
                        continue;
                    }
                }
                return Ok(LoopOutcome::AllTerminal);
            }

            // 5 + 6. Approval gate, then fill free worker slots. The limit
            // is enforced per start so a batch fill cannot overshoot it.
            if self.gate_allows(run).await {
                let slots = self.config.max_agents.saturating_sub(run.running_count());
                let ready: Vec<String> =
                    run.ready_subtasks().into_iter().take(slots).collect();
                for id in ready {
                    if !self.approved
                        && run.total_workers_spawned >= self.config.worker_limit
                    {
                        self.engage_pause(run).await;
                        break;
                    }
                    self.start_worker(run, &id, &tx).await?;
                    in_flight += 1;
                    self.store.save(run)?;
                }
            }

            // 7. Periodic status.
            if cycle % 5 == 0 {
                status::post_status(self.port.as_ref(), run, self.config.max_agents, "").await;
                self.store.save(run)?;
            }

            // 8. Sleep; a cancellation wakes the loop immediately.
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    // -- stop handling ----------------------------------------------------

    /// A stop is requested by signal or by the card leaving the trigger
    /// list. A failed card lookup is tolerated for one cycle.
    async fn should_stop(&self, run: &Run) -> bool {
        if self.cancel.is_cancelled() {
            tracing::info!("stop requested by signal");
            return true;
        }
        match self.port.get_card(&run.parent_card_id).await {
            Ok(card) => {
                if card.list_id != self.trigger_list_id {
                    tracing::info!("parent card moved off the trigger list, stopping");
                    return true;
                }
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not check parent card list");
                false
            }
        }
    }

    /// Wait (bounded) for in-flight workers, harvest them one last time,
    /// and record the stop. Worktrees are left intact for inspection.
    async fn drain_and_stop(
        &mut self,
        run: &mut Run,
        rx: &mut mpsc::Receiver<WorkerDone>,
        mut in_flight: usize,
    ) -> Result<()> {
        run.phase = crate::model::RunPhase::Stopped;
        self.store.save(run)?;

        if in_flight > 0 {
            tracing::info!(in_flight, "waiting for active workers to finish");
            let grace = self.config.worker_timeout + Duration::from_secs(60);
            let deadline = tokio::time::Instant::now() + grace;
            while in_flight > 0 {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(done)) => {
                        in_flight -= 1;
                        self.harvest(run, done).await?;
                    }
                    _ => break,
                }
            }
            if in_flight > 0 {
                tracing::warn!(remaining = in_flight, "drain deadline expired");
            }
            self.store.save(run)?;
        }

        status::post_status(
            self.port.as_ref(),
            run,
            self.config.max_agents,
            "**Orchestration stopped by user.** Worktrees left intact for \
             manual inspection.",
        )
        .await;
        self.store.save(run)?;
        Ok(())
    }

    // -- worker lifecycle -------------------------------------------------

    /// Branch a subtask off the parent, give it a worktree, and spawn its
    /// worker process.
    async fn start_worker(
        &self,
        run: &mut Run,
        subtask_id: &str,
        tx: &mpsc::Sender<WorkerDone>,
    ) -> Result<()> {
        let (title, prompt, branch) = {
            let st = run
                .find_subtask(subtask_id)
                .with_context(|| format!("subtask {subtask_id} not found"))?;
            let mut branch = format!(
                "orch/{}-{}",
                branch_slug(&st.id),
                &run.run_id[..run.run_id.len().min(6)]
            );
            branch.truncate(BRANCH_NAME_LIMIT);
            (st.title.clone(), subtask_prompt(run, st), branch)
        };

        self.git.fetch_origin().await?;
        self.git
            .create_branch(&branch, Some(&run.parent_branch))
            .await?;
        let worktree = self.git.create_worktree(&branch, subtask_id).await?;

        {
            let st = run
                .find_subtask_mut(subtask_id)
                .with_context(|| format!("subtask {subtask_id} not found"))?;
            st.advance(TaskStatus::Running)?;
            st.branch = Some(branch.clone());
            st.worktree_path = Some(worktree.to_string_lossy().to_string());
        }
        run.total_workers_spawned += 1;

        let worker = Arc::clone(&self.worker);
        let timeout = self.config.worker_timeout;
        let tx = tx.clone();
        let subtask_id = subtask_id.to_string();

        tokio::spawn(async move {
            let report = worker
                .run(&worktree, &prompt, timeout)
                .await
                .unwrap_or_else(|e| WorkerReport {
                    success: false,
                    output: String::new(),
                    error: Some(WorkerFailure::Spawn(e.to_string())),
                });
            let _ = tx.send(WorkerDone { subtask_id, report }).await;
        });

        tracing::info!(subtask = %title, branch = %branch, "started worker");
        Ok(())
    }

    /// Apply a finished worker's result to its subtask.
    async fn harvest(&self, run: &mut Run, done: WorkerDone) -> Result<()> {
        let Some(st) = run.find_subtask_mut(&done.subtask_id) else {
            tracing::warn!(subtask = %done.subtask_id, "harvested result for unknown subtask");
            return Ok(());
        };
        let title = st.title.clone();
        let card_id = st.card_id.clone();
        let branch = st.branch.clone();
        let worktree = st.worktree_path.clone();

        if done.report.success {
            st.advance(TaskStatus::Complete)?;
            st.result_summary = Some(truncate_chars(&done.report.output, SUMMARY_LIMIT));
            tracing::info!(subtask = %title, "worker completed");

            // Push the subtask branch. Best-effort: the branch still exists
            // locally for the merge phase.
            if let (Some(branch), Some(worktree)) = (&branch, &worktree) {
                match self.git.push(branch, Some(std::path::Path::new(worktree))).await {
                    Ok(out) if out.success => {
                        tracing::info!(branch = %branch, "pushed subtask branch");
                    }
                    Ok(out) => {
                        tracing::warn!(branch = %branch, stderr = %out.stderr.trim(), "failed to push subtask branch");
                    }
                    Err(e) => {
                        tracing::warn!(branch = %branch, error = %e, "failed to push subtask branch");
                    }
                }
            }

            if let Some(card_id) = card_id {
                let comment = format!(
                    "{BOT_MARKER}\n**Agent completed successfully.**\n\n```\n{}\n```",
                    truncate_chars(&done.report.output, COMMENT_OUTPUT_LIMIT)
                );
                if let Err(e) = self.port.add_comment(&card_id, &comment).await {
                    tracing::warn!(error = %e, "failed to post completion comment");
                }
            }
        } else {
            let error_text = done.report.error_text();
            st.advance(TaskStatus::Failed)?;
            st.error = Some(error_text.clone());
            tracing::warn!(subtask = %title, error = %error_text, "worker failed");

            if let Some(card_id) = card_id {
                let comment = format!(
                    "{BOT_MARKER}\n**Agent FAILED.**\n\nError: {error_text}\n\n```\n{}\n```",
                    truncate_chars(&done.report.output, COMMENT_OUTPUT_LIMIT)
                );
                if let Err(e) = self.port.add_comment(&card_id, &comment).await {
                    tracing::warn!(error = %e, "failed to post failure comment");
                }
            }
        }
        Ok(())
    }

    // -- approval gate ----------------------------------------------------

    /// True when the gate permits starting workers this cycle.
    ///
    /// While paused, the gate waits for a human, non-bot comment newer
    /// than the limit notice containing the word `continue`
    /// (case-insensitive). The author of the comment is deliberately not
    /// verified: anyone with write access to the card can resume the run.
    /// Approval is permanent for the rest of the run.
    async fn gate_allows(&mut self, run: &Run) -> bool {
        if !self.paused {
            return true;
        }
        if self.human_continue_posted(run).await {
            tracing::info!("human approved continuation, resuming");
            self.paused = false;
            self.pause_comment_id = None;
            self.approved = true;
            return true;
        }
        false
    }

    /// Engage the approval gate: post the one-time limit-reached notice and
    /// record its id so only newer comments count as approval.
    async fn engage_pause(&mut self, run: &Run) {
        self.paused = true;
        let notice = format!(
            "## {BOT_MARKER} Worker Limit Reached\n\n\
             The orchestrator has spawned **{spawned}** workers \
             (limit: **{limit}**).\n\n\
             No new workers will be started until a human replies to this \
             card with a comment containing the word **continue**.\n\n\
             Already-running workers will keep executing.",
            spawned = run.total_workers_spawned,
            limit = self.config.worker_limit,
        );
        if let Err(e) = self.port.add_comment(&run.parent_card_id, &notice).await {
            tracing::warn!(error = %e, "could not post limit-reached notice");
        }
        // Record the notice's id so only newer comments count as approval.
        match self.port.comments(&run.parent_card_id).await {
            Ok(comments) => {
                self.pause_comment_id = comments
                    .iter()
                    .find(|c| c.text.contains("Worker Limit Reached"))
                    .map(|c| c.id.clone());
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not read back limit-reached notice");
            }
        }
        tracing::info!(
            limit = self.config.worker_limit,
            "paused, waiting for a human 'continue' comment"
        );
    }

    /// Scan comments newer than the limit notice for a human `continue`.
    async fn human_continue_posted(&self, run: &Run) -> bool {
        let comments = match self.port.comments(&run.parent_card_id).await {
            Ok(comments) => comments,
            Err(e) => {
                tracing::warn!(error = %e, "could not read comments for approval check");
                return false;
            }
        };

        // Newest first: everything before the notice id is newer than it.
        for comment in &comments {
            if Some(&comment.id) == self.pause_comment_id.as_ref() {
                break;
            }
            if comment.is_bot() {
                continue;
            }
            if continue_regex().is_match(&comment.text) {
                return true;
            }
        }
        false
    }
}

/// Compose the standalone prompt handed to a subtask's worker.
fn subtask_prompt(run: &Run, subtask: &Subtask) -> String {
    let files = if subtask.estimated_files.is_empty() {
        "Determine from the description.".to_string()
    } else {
        subtask.estimated_files.join(", ")
    };
    format!(
        "You are one of several coding agents working on a larger task.\n\n\
         ## Parent Task\n**{parent}**\n\n\
         ## Your Subtask: {title}\n\n{description}\n\n\
         ## Target Files\n{files}\n\n\
         ## Instructions\n\
         - Only implement what is described above.\n\
         - Commit your changes with a message prefixed with [{title}].\n\
         - Do NOT push to remote.\n",
        parent = run.parent_card_title,
        title = subtask.title,
        description = subtask.description,
    )
}

/// Truncate to a maximum number of characters on a char boundary.
fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
