//! The supervisor: owns the run lifecycle from card pickup to pull request.
//!
//! `planning -> executing -> merging -> reviewing -> complete`, with
//! `stopped` and `failed` as absorbing exits. One supervisor drives one run
//! at a time; all state mutations are serialised through it, so the state
//! document is the single source of truth.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codehost::{Bitbucket, CodeHost};
use crate::config::Settings;
use crate::git::{GitDriver, branch_slug};
use crate::merge;
use crate::model::{Run, RunPhase, TaskStatus};
use crate::planner;
use crate::scheduler::{LoopOutcome, Scheduler, SchedulerConfig};
use crate::status;
use crate::store::RunStore;
use crate::worker::{ClaudeWorker, Worker};
use crate::workitem::{BOT_MARKER, TrelloBoard, WorkItemPort};

/// Poll cadence of watch mode.
const WATCH_INTERVAL: Duration = Duration::from_secs(60);

/// Supervisor wiring and policy.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub scheduler: SchedulerConfig,
    /// Board that hosts the child subtask list.
    pub board_id: String,
    /// List that triggers orchestration; leaving it stops the run.
    pub trigger_list_id: String,
    /// Where cards go at the end when their original list is unknown.
    pub parking_list_id: Option<String>,
}

/// Orchestrates runs over the injected ports.
pub struct Supervisor {
    port: Arc<dyn WorkItemPort>,
    codehost: Option<Arc<dyn CodeHost>>,
    worker: Arc<dyn Worker>,
    git: GitDriver,
    store: RunStore,
    config: SupervisorConfig,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        port: Arc<dyn WorkItemPort>,
        codehost: Option<Arc<dyn CodeHost>>,
        worker: Arc<dyn Worker>,
        git: GitDriver,
        store: RunStore,
        config: SupervisorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port,
            codehost,
            worker,
            git,
            store,
            config,
            cancel,
        }
    }

    /// Wire up the production adapters from resolved settings.
    ///
    /// Also prunes orphaned worktree registrations left over from earlier
    /// runs.
    pub async fn from_settings(
        settings: &Settings,
        scheduler: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let port: Arc<dyn WorkItemPort> = Arc::new(TrelloBoard::new(
            settings.trello_api_key.clone(),
            settings.trello_token.clone(),
        )?);

        let codehost: Option<Arc<dyn CodeHost>> = match (
            &settings.bitbucket_token,
            &settings.bitbucket_workspace,
            &settings.bitbucket_repo_slug,
        ) {
            (Some(token), Some(workspace), Some(slug)) => Some(Arc::new(Bitbucket::new(
                token.clone(),
                workspace.clone(),
                slug.clone(),
            )?)),
            _ => None,
        };

        let git = GitDriver::new(&settings.repo_path, settings.worktree_base()).await?;
        match git.prune_orphaned_worktrees().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "pruned orphaned worktrees"),
            Err(e) => tracing::warn!(error = %e, "worktree pruning failed"),
        }

        let store = RunStore::new(settings.orchestrator_state_dir())?;

        Ok(Self::new(
            port,
            codehost,
            Arc::new(ClaudeWorker::new()),
            git,
            store,
            SupervisorConfig {
                scheduler,
                board_id: settings.board_id.clone(),
                trigger_list_id: settings.orchestrator_list_id.clone(),
                parking_list_id: settings.parking_list_id.clone(),
            },
            cancel,
        ))
    }

    // -- lifecycle --------------------------------------------------------

    /// Run the full orchestration lifecycle for one parent card.
    ///
    /// Resumes from the persisted document when one exists; `complete` and
    /// `failed` runs are left alone.
    pub async fn orchestrate(&self, card_id: &str) -> Result<()> {
        let mut run = match self.store.load(card_id)? {
            Some(run) => {
                if matches!(run.phase, RunPhase::Complete | RunPhase::Failed) {
                    tracing::info!(
                        card = card_id,
                        phase = %run.phase,
                        "run already finished, nothing to do"
                    );
                    return Ok(());
                }
                tracing::info!(card = card_id, phase = %run.phase, "resuming orchestration");
                run
            }
            None => self.plan_new_run(card_id).await?,
        };

        // Execution phase: the scheduling loop.
        run.phase = RunPhase::Executing;
        self.store.save(&mut run)?;
        status::post_status(
            self.port.as_ref(),
            &mut run,
            self.config.scheduler.max_agents,
            "",
        )
        .await;
        self.store.save(&mut run)?;

        let mut scheduler = Scheduler::new(
            Arc::clone(&self.port),
            Arc::clone(&self.worker),
            self.git.clone(),
            self.store.clone(),
            self.config.scheduler.clone(),
            self.config.trigger_list_id.clone(),
            self.cancel.clone(),
        );

        match scheduler.run(&mut run).await {
            Ok(LoopOutcome::Stopped) => {
                tracing::info!(card = card_id, "orchestration stopped");
                return Ok(());
            }
            Ok(LoopOutcome::AllTerminal) => {}
            Err(e) => {
                run.phase = RunPhase::Failed;
                self.store.save(&mut run)?;
                status::post_status(
                    self.port.as_ref(),
                    &mut run,
                    self.config.scheduler.max_agents,
                    &format!("**Orchestration error:** {e:#}"),
                )
                .await;
                self.store.save(&mut run)?;
                return Err(e);
            }
        }

        // Merge phase. Merge trouble is logged, not fatal: the run proceeds
        // with whatever landed.
        tracing::info!("all subtasks terminal, starting merge");
        run.phase = RunPhase::Merging;
        self.store.save(&mut run)?;
        if let Err(e) = merge::merge_all(&mut run, &self.git, self.worker.as_ref()).await {
            tracing::error!(error = %e, "merge phase error");
        }
        self.store.save(&mut run)?;

        // Review phase: open the pull request.
        run.phase = RunPhase::Reviewing;
        self.store.save(&mut run)?;
        let pr_url = self.create_pr(&run).await;

        // Completion.
        self.complete(&mut run).await?;
        if let Some(url) = pr_url {
            let comment = format!("{BOT_MARKER}\n**Pull Request created:** {url}");
            if let Err(e) = self.port.add_comment(&run.parent_card_id, &comment).await {
                tracing::warn!(error = %e, "failed to post PR comment");
            }
        }

        tracing::info!(card = card_id, title = %run.parent_card_title, "orchestration complete");
        Ok(())
    }

    /// Create a fresh run: fetch the card, decompose it, cut the parent
    /// branch, and materialise the child list and cards.
    async fn plan_new_run(&self, card_id: &str) -> Result<Run> {
        let card = self
            .port
            .get_card(card_id)
            .await
            .with_context(|| format!("failed to fetch card {card_id}"))?;

        let run_id = Uuid::new_v4().simple().to_string()[..12].to_string();
        let title_slug: String = branch_slug(&card.title.chars().take(30).collect::<String>());
        let parent_branch = format!("orch/{title_slug}-{run_id}");

        // Remember where the card came from so it can go back at the end.
        let original_list_id = if card.list_id != self.config.trigger_list_id {
            Some(card.list_id.clone())
        } else {
            self.config.parking_list_id.clone()
        };

        let mut run = Run::new(
            run_id,
            card.id.clone(),
            card.title.clone(),
            parent_branch.clone(),
            original_list_id,
        );
        self.store.save(&mut run)?;

        tracing::info!(title = %card.title, "decomposing parent task");
        let attachments_info = self.attachment_summary(card_id).await;

        let subtasks = match planner::decompose(
            self.worker.as_ref(),
            self.git.repo_path(),
            &card.title,
            &card.description,
            &attachments_info,
        )
        .await
        {
            Ok(subtasks) => subtasks,
            Err(e) => {
                run.phase = RunPhase::Failed;
                self.store.save(&mut run)?;
                status::post_status(
                    self.port.as_ref(),
                    &mut run,
                    self.config.scheduler.max_agents,
                    &format!("**Planning failed:** {e}"),
                )
                .await;
                self.store.save(&mut run)?;
                return Err(anyhow::Error::new(e).context("planning failed"));
            }
        };

        run.subtasks = subtasks;
        self.store.save(&mut run)?;
        tracing::info!(count = run.subtasks.len(), "plan created");

        // Parent branch exists before any worker branches off it.
        self.git.fetch_origin().await?;
        self.git.create_branch(&parent_branch, None).await?;
        let push = self.git.push(&parent_branch, None).await?;
        if !push.success {
            tracing::warn!(stderr = %push.stderr.trim(), "failed to push parent branch");
        }

        self.create_subtask_list_and_cards(&mut run).await;
        self.store.save(&mut run)?;
        Ok(run)
    }

    /// One-line-per-attachment summary for the planner prompt.
    async fn attachment_summary(&self, card_id: &str) -> String {
        match self.port.attachments(card_id).await {
            Ok(attachments) => attachments
                .iter()
                .map(|a| {
                    format!("- {} ({})", a.name, a.mime_type.as_deref().unwrap_or("?"))
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => {
                tracing::warn!(error = %e, "could not fetch attachments");
                String::new()
            }
        }
    }

    /// Create the child list, one card per subtask, and the plan comment.
    /// All best-effort: a card-less subtask still executes.
    async fn create_subtask_list_and_cards(&self, run: &mut Run) {
        let truncated: String = run.parent_card_title.chars().take(40).collect();
        let list_name = format!("\u{1F916} Agents: {truncated}");
        let list_id = match self
            .port
            .create_list(&self.config.board_id, &list_name)
            .await
        {
            Ok(list_id) => {
                run.subtask_list_id = Some(list_id.clone());
                list_id
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not create subtask list");
                return;
            }
        };
        for st in &mut run.subtasks {
            let body = format!(
                "**Subtask:** {title}\n\n\
                 **Priority:** {priority}\n\
                 **Dependencies:** {deps}\n\
                 **Target files:** {files}\n\n\
                 ---\n\n{description}",
                title = st.title,
                priority = st.priority,
                deps = if st.dependencies.is_empty() {
                    "None".to_string()
                } else {
                    st.dependencies.join(", ")
                },
                files = if st.estimated_files.is_empty() {
                    "TBD".to_string()
                } else {
                    st.estimated_files.join(", ")
                },
                description = st.description,
            );
            match self.port.create_card(&list_id, &st.title, &body).await {
                Ok(card_id) => st.card_id = Some(card_id),
                Err(e) => {
                    tracing::warn!(error = %e, title = %st.title, "could not create subtask card");
                }
            }
        }

        let comment = plan_comment(run);
        if let Err(e) = self.port.add_comment(&run.parent_card_id, &comment).await {
            tracing::warn!(error = %e, "could not post plan comment");
        }
    }

    /// Open the pull request; `None` when unconfigured or on failure.
    async fn create_pr(&self, run: &Run) -> Option<String> {
        let Some(codehost) = &self.codehost else {
            tracing::info!("no code-host token configured, skipping PR creation");
            return None;
        };

        let title: String = run.parent_card_title.chars().take(60).collect();
        match codehost
            .create_pull_request(
                &run.parent_branch,
                &format!("[Orchestrated] {title}"),
                &pr_description(run),
            )
            .await
        {
            Ok(url) if !url.is_empty() => {
                tracing::info!(url = %url, "pull request created");
                Some(url)
            }
            Ok(_) => {
                tracing::warn!("pull request created but no URL returned");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "pull request creation failed");
                None
            }
        }
    }

    /// Final status, card return, and the `complete` phase.
    async fn complete(&self, run: &mut Run) -> Result<()> {
        run.phase = RunPhase::Complete;
        self.store.save(run)?;

        let completed = run.count_with_status(TaskStatus::Complete);
        let failed = run.count_with_status(TaskStatus::Failed);
        let summary = format!(
            "## {BOT_MARKER} Orchestration Complete\n\n\
             - **Completed subtasks:** {completed}\n\
             - **Failed subtasks:** {failed}\n\
             - **Total workers spawned:** {spawned}\n\
             - **Branch:** `{branch}`",
            spawned = run.total_workers_spawned,
            branch = run.parent_branch,
        );
        status::post_status(
            self.port.as_ref(),
            run,
            self.config.scheduler.max_agents,
            &summary,
        )
        .await;

        if let Some(target) = run.original_list_id.clone() {
            match self.port.move_card(&run.parent_card_id, &target).await {
                Ok(()) => tracing::info!(list = %target, "moved card back"),
                Err(e) => tracing::warn!(error = %e, "could not move card back"),
            }
        }

        self.store.save(run)?;
        Ok(())
    }

    // -- watch mode -------------------------------------------------------

    /// Poll the trigger list and orchestrate new cards, one at a time.
    ///
    /// Cards that already have a state document are skipped; `orchestrate`
    /// is still the entry point for resuming those explicitly.
    pub async fn watch(&self) -> Result<()> {
        let mut seen: HashSet<String> = self.store.known_card_ids()?.into_iter().collect();
        tracing::info!(
            list = %self.config.trigger_list_id,
            "watching for orchestration cards"
        );

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("watch loop stopped");
                return Ok(());
            }

            match self.port.cards_on_list(&self.config.trigger_list_id).await {
                Ok(cards) => {
                    for card in cards {
                        if !seen.insert(card.id.clone()) {
                            continue;
                        }
                        tracing::info!(title = %card.title, card = %card.id, "new card detected");
                        if let Err(e) = self.orchestrate(&card.id).await {
                            tracing::error!(card = %card.id, error = %e, "orchestration failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "could not poll trigger list");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(WATCH_INTERVAL) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }
}

/// The plan comment posted to the parent card after decomposition.
fn plan_comment(run: &Run) -> String {
    let mut lines = vec![format!("## {BOT_MARKER} Orchestration Plan"), String::new()];
    for (i, st) in run.subtasks.iter().enumerate() {
        let deps = if st.dependencies.is_empty() {
            "none".to_string()
        } else {
            st.dependencies.join(", ")
        };
        lines.push(format!(
            "{}. **{}** (priority {}, deps: {})",
            i + 1,
            st.title,
            st.priority,
            deps
        ));
    }
    lines.push(String::new());
    lines.push("> Move this card off the orchestrator list to halt execution.".to_string());
    lines.join("\n")
}

/// The pull request body: parent title, merged subtasks, provenance line.
fn pr_description(run: &Run) -> String {
    let mut description = format!(
        "## Orchestrated Implementation: {}\n\n### Completed Subtasks\n",
        run.parent_card_title
    );
    for st in run.subtasks.iter().filter(|s| s.merged) {
        description.push_str(&format!("- {}\n", st.title));
    }
    description.push_str(&format!(
        "\n*Auto-generated by the orchestrator. Run ID: {}*",
        run.run_id
    ));
    description
}
