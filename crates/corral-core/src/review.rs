//! Post-execution self-review.
//!
//! Once every subtask is terminal, the completed branches are merged into a
//! throwaway branch and a worker inspects the combined result for critical
//! defects only. Anything it flags becomes a high-priority fix subtask and
//! the scheduling loop re-opens; anything less than critical is waved
//! through. The whole mechanism fires at most once per run to bound cost.

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use uuid::Uuid;

use crate::extract;
use crate::git::GitDriver;
use crate::model::{Run, Subtask, TaskStatus};
use crate::status;
use crate::worker::Worker;
use crate::workitem::WorkItemPort;

/// Wall-clock budget for the review worker.
const REVIEW_TIMEOUT: Duration = Duration::from_secs(300);

/// Verdict of the self-review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// Work accepted; proceed to the merge phase.
    Accept,
    /// Critical issues were injected as new subtasks; re-enter the loop.
    Continue { issues: usize },
}

#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default)]
    critical: bool,
    #[serde(default)]
    issues: Vec<RawIssue>,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    #[serde(default)]
    title: Option<String>,
    description: String,
    #[serde(default)]
    estimated_files: Vec<String>,
    #[serde(default)]
    priority: Option<i64>,
}

/// Build the critical-defects-only review prompt.
fn review_prompt(run: &Run, completed: &[&Subtask]) -> String {
    let summaries: Vec<String> = completed
        .iter()
        .map(|s| {
            format!(
                "- {}: branch={}, files={}",
                s.title,
                s.branch.as_deref().unwrap_or("?"),
                s.estimated_files.join(", ")
            )
        })
        .collect();

    format!(
        "You are a senior code reviewer. You are inside a git worktree that \
         contains the merged output of several coding agents.\n\n\
         ## Parent Task\n{parent}\n\n\
         ## Completed Subtasks\n{summaries}\n\n\
         ## Your Job\n\
         1. Use `git log --oneline` and `git diff HEAD~{count}` to inspect \
         what the agents changed.\n\
         2. Look for VERY CRITICAL problems ONLY:\n\
         \x20  - Broken imports or syntax errors that prevent the project from running\n\
         \x20  - Security vulnerabilities (credentials leaked, SQL injection, etc.)\n\
         \x20  - Completely missing implementations (function stubs left empty \
         when they should have been filled)\n\
         \x20  - Logic that is the exact opposite of what was requested\n\
         3. Do NOT flag style issues, minor bugs, missing tests, or \
         improvements. Those are not critical.\n\n\
         ## Output\n\
         Return ONLY a JSON object (no markdown fences):\n\
         {{\"critical\": false}} if no very critical problems were found.\n\
         OR\n\
         {{\"critical\": true, \"issues\": [{{\"title\": \"short-slug\", \
         \"description\": \"Complete standalone prompt for a coding agent to \
         fix this issue. Include file paths and exact problem.\", \
         \"estimated_files\": [\"path/to/file\"], \"priority\": 1}}]}}\n\
         Remember: only VERY CRITICAL issues. When in doubt, it is fine.",
        parent = run.parent_card_title,
        summaries = summaries.join("\n"),
        count = completed.len(),
    )
}

/// Review all completed work; inject fix subtasks when critical issues are
/// found.
///
/// Every failure path (merge trouble, worker failure, unparseable verdict)
/// resolves to [`ReviewOutcome::Accept`]: the review gate must never wedge
/// a run.
pub async fn reassess(
    run: &mut Run,
    worker: &dyn Worker,
    port: &dyn WorkItemPort,
    git: &GitDriver,
    max_agents: usize,
) -> Result<ReviewOutcome> {
    let completed: Vec<Subtask> = run
        .subtasks
        .iter()
        .filter(|s| s.status == TaskStatus::Complete)
        .cloned()
        .collect();
    if completed.is_empty() {
        return Ok(ReviewOutcome::Accept);
    }

    let run8 = &run.run_id[..run.run_id.len().min(8)];
    let nonce = &Uuid::new_v4().to_string()[..4];
    let review_branch = format!("orch/review-{run8}-{nonce}");
    let label = format!("review-{run8}");

    git.fetch_origin().await?;
    git.create_branch(&review_branch, Some(&run.parent_branch))
        .await?;
    let review_wt = git.create_worktree(&review_branch, &label).await?;

    // Merge every completed branch. This merge is discarded, so conflicts
    // are auto-resolved in favour of the incoming branch as a last resort.
    for st in &completed {
        let Some(branch) = st.branch.as_deref() else {
            continue;
        };
        let _ = git.merge_branch(branch, &review_wt).await?;
        if git.has_conflicts(&review_wt).await? {
            git.take_theirs(&review_wt).await?;
            git.commit_all(
                &review_wt,
                &format!("Auto-resolved conflicts for review of {branch}"),
            )
            .await?;
        }
    }

    let completed_refs: Vec<&Subtask> = completed.iter().collect();
    let prompt = review_prompt(run, &completed_refs);

    tracing::info!("delegating post-execution review to a worker");
    let report = worker.run(&review_wt, &prompt, REVIEW_TIMEOUT).await;

    // The review branch and worktree are temporary in every outcome.
    git.remove_worktree(&review_wt).await?;
    git.delete_branch(&review_branch).await?;

    let report = match report {
        Ok(report) if report.success => report,
        Ok(report) => {
            tracing::warn!(error = %report.error_text(), "review worker failed, accepting work");
            return Ok(ReviewOutcome::Accept);
        }
        Err(e) => {
            tracing::warn!(error = %e, "review worker errored, accepting work");
            return Ok(ReviewOutcome::Accept);
        }
    };

    let verdict = match parse_verdict(&report.output) {
        Some(verdict) => verdict,
        None => {
            tracing::warn!("review reply had no parseable JSON, accepting work");
            return Ok(ReviewOutcome::Accept);
        }
    };

    if !verdict.critical {
        tracing::info!("review passed, no critical issues");
        return Ok(ReviewOutcome::Accept);
    }
    if verdict.issues.is_empty() {
        tracing::warn!("review flagged critical but listed no issues, accepting work");
        return Ok(ReviewOutcome::Accept);
    }

    let count = verdict.issues.len();
    tracing::info!(count, "review found critical issues, queueing fix subtasks");

    for issue in verdict.issues {
        let slug = issue
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(crate::planner::short_id);
        let fix_id = format!("fix-{slug}");
        let mut fix = Subtask::new(
            fix_id,
            slug,
            issue.description,
            vec![],
            issue.estimated_files,
            issue.priority.unwrap_or(1),
        );
        if let Some(list_id) = &run.subtask_list_id {
            match port.create_card(list_id, &fix.title, &fix.description).await {
                Ok(card_id) => fix.card_id = Some(card_id),
                Err(e) => {
                    tracing::warn!(error = %e, title = %fix.title, "could not create fix card");
                }
            }
        }
        run.subtasks.push(fix);
    }

    status::post_status(
        port,
        run,
        max_agents,
        &format!(
            "**Post-execution review found {count} critical issue(s).** \
             Spawning fix agents…"
        ),
    )
    .await;

    Ok(ReviewOutcome::Continue { issues: count })
}

fn parse_verdict(raw: &str) -> Option<Verdict> {
    let cleaned = extract::strip_code_fences(raw);
    let object = extract::first_json_object(&cleaned)?;
    serde_json::from_str(object).ok()
}
