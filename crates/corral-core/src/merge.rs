//! Merge phase: land completed subtask branches on the parent branch.
//!
//! Runs exactly once per run, after the scheduling loop exits normally.
//! Branches merge in ascending priority order so foundational changes land
//! before the integration work that expects them; `--no-ff` keeps the
//! subtask-branch structure visible in history. A branch that cannot be
//! merged is skipped, not re-queued: the run proceeds with partial results
//! and the subtask keeps `merged = false`.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::git::GitDriver;
use crate::model::{Run, TaskStatus};
use crate::worker::Worker;

/// Wall-clock budget for the conflict-resolution worker.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Prompt for the conflict-resolution worker.
const RESOLVE_PROMPT: &str = "\
Resolve ALL git merge conflict markers in this repository. Look at every \
file with conflict markers (<<<<<<< ======= >>>>>>>) and produce a clean \
resolution that preserves the intent of both sides. Stage the resolved \
files with git add.";

/// Counters for the final report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub merged: usize,
    pub skipped: usize,
}

/// Merge all completed, unmerged subtask branches into the parent branch.
pub async fn merge_all(
    run: &mut Run,
    git: &GitDriver,
    worker: &dyn Worker,
) -> Result<MergeSummary> {
    let run8 = &run.run_id[..run.run_id.len().min(8)];
    let merge_wt = git
        .create_worktree(&run.parent_branch, &format!("merge-{run8}"))
        .await?;
    git.pull(&run.parent_branch, &merge_wt).await?;

    // Completed-and-unmerged subtasks, ascending priority.
    let mut queue: Vec<String> = {
        let mut pending: Vec<&crate::model::Subtask> = run
            .subtasks
            .iter()
            .filter(|s| s.status == TaskStatus::Complete && !s.merged && s.branch.is_some())
            .collect();
        pending.sort_by_key(|s| s.priority);
        pending.into_iter().map(|s| s.id.clone()).collect()
    };

    let mut summary = MergeSummary::default();

    for id in queue.drain(..) {
        let Some(st) = run.find_subtask(&id) else { continue };
        let Some(branch) = st.branch.clone() else { continue };
        let worktree_path = st.worktree_path.clone();

        tracing::info!(branch = %branch, "merging subtask branch");
        let merged = merge_one(git, worker, &branch, &merge_wt).await?;

        if merged {
            summary.merged += 1;
            if let Some(st) = run.find_subtask_mut(&id) {
                st.merged = true;
            }
            // The branch has landed; its worktree is no longer needed.
            if let Some(wt) = worktree_path {
                git.remove_worktree(Path::new(&wt)).await?;
            }
        } else {
            summary.skipped += 1;
            tracing::warn!(branch = %branch, "could not merge branch, proceeding without it");
        }
    }

    let push = git.push(&run.parent_branch, Some(&merge_wt)).await?;
    if !push.success {
        tracing::warn!(stderr = %push.stderr.trim(), "failed to push parent branch");
    }

    git.remove_worktree(&merge_wt).await?;

    tracing::info!(
        merged = summary.merged,
        skipped = summary.skipped,
        "merge phase finished"
    );
    Ok(summary)
}

/// Merge one branch into the merge worktree; returns whether it landed.
///
/// On unresolved conflict markers, a worker gets one attempt to clear
/// them; if markers remain the merge is aborted.
async fn merge_one(
    git: &GitDriver,
    worker: &dyn Worker,
    branch: &str,
    merge_wt: &Path,
) -> Result<bool> {
    let _ = git.merge_branch(branch, merge_wt).await?;

    if !git.has_conflicts(merge_wt).await? {
        return Ok(true);
    }

    tracing::info!(branch, "merge conflict, delegating resolution to a worker");
    let resolution = worker.run(merge_wt, RESOLVE_PROMPT, RESOLVE_TIMEOUT).await;

    let resolved = match resolution {
        Ok(report) if report.success => !git.has_conflicts(merge_wt).await?,
        Ok(report) => {
            tracing::warn!(error = %report.error_text(), "resolution worker failed");
            false
        }
        Err(e) => {
            tracing::warn!(error = %e, "resolution worker errored");
            false
        }
    };

    if resolved {
        git.commit_all(merge_wt, &format!("Resolved merge conflicts for {branch}"))
            .await?;
        Ok(true)
    } else {
        git.abort_merge(merge_wt).await?;
        Ok(false)
    }
}
