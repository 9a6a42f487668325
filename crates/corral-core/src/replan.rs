//! Re-planner: decide what to do about a failed subtask.
//!
//! Invoked exactly once per failure (the subtask's `replanned` flag is set
//! before the call, so a retried task that fails again falls through to
//! cancellation). The decision is delegated to a worker running in the
//! failed subtask's worktree when it exists, because the partial work is
//! often the best evidence of what went wrong.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::extract;
use crate::model::{ReplanAction, Run, TaskStatus};
use crate::planner::{self, RawSubtask};
use crate::worker::Worker;
use crate::workitem::WorkItemPort;

/// Wall-clock budget for the re-planning worker.
const REPLAN_TIMEOUT: Duration = Duration::from_secs(300);

/// Bridging is capped to keep a single failure from ballooning the DAG.
const MAX_BRIDGE_TASKS: usize = 2;

/// Priority given to bridging subtasks when the worker supplies none.
const BRIDGE_PRIORITY: i64 = 50;

/// What the re-planner did to the DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplanOutcome {
    /// The failed subtask was reset to pending with new instructions.
    Retried,
    /// Bridging subtasks were appended; dependents of the failure blocked.
    Bridged { added: usize },
    /// Dependents of the failure were blocked.
    Cancelled,
}

/// Decision object as the worker emits it.
#[derive(Debug, Deserialize)]
struct ReplanDecision {
    #[serde(default)]
    action: Option<ReplanAction>,
    #[serde(default)]
    modified_instructions: Option<String>,
    #[serde(default)]
    new_tasks: Vec<RawSubtask>,
    #[serde(default)]
    reason: Option<String>,
}

/// Build the re-planning prompt.
fn replan_prompt(run: &Run, failed_id: &str) -> String {
    let failed = run.find_subtask(failed_id);
    let failed_title = failed.map(|s| s.title.as_str()).unwrap_or("?");
    let failed_error = failed
        .and_then(|s| s.error.as_deref())
        .unwrap_or("unknown");

    let completed = run.completed_titles();
    let pending: Vec<&str> = run
        .subtasks
        .iter()
        .filter(|s| matches!(s.status, TaskStatus::Pending | TaskStatus::Ready))
        .map(|s| s.title.as_str())
        .collect();

    let join = |items: &[String]| {
        if items.is_empty() {
            "none".to_string()
        } else {
            items.join(", ")
        }
    };

    format!(
        "A subtask in an automated code orchestration failed.\n\n\
         Completed tasks: {completed}\n\
         Failed task: {failed_title}\n\
         Error: {failed_error}\n\
         Pending tasks: {pending}\n\n\
         Original parent task: {parent}\n\n\
         Decide ONE of:\n\
         1. RETRY -- provide modified instructions for the failed task\n\
         2. BRIDGE -- provide 1-2 new bridging subtasks that work around the failure\n\
         3. CANCEL -- cancel all downstream dependents of the failed task\n\n\
         Return ONLY a JSON object (no markdown fences) with:\n\
         - \"action\": \"retry\" | \"bridge\" | \"cancel\"\n\
         - \"modified_instructions\": string (only for retry)\n\
         - \"new_tasks\": array of subtask objects (only for bridge). Each \
         object needs: \"id\", \"title\", \"description\", \"dependencies\", \
         \"estimated_files\", \"priority\"\n\
         - \"reason\": brief explanation",
        completed = join(&completed),
        pending = if pending.is_empty() {
            "none".to_string()
        } else {
            pending.join(", ")
        },
        parent = run.parent_card_title,
    )
}

/// Re-plan after `failed_id` failed.
///
/// Any worker failure, missing JSON, or schema violation defaults to
/// **cancel**: dependents are blocked and the run carries on with what it
/// has.
pub async fn replan_failure(
    run: &mut Run,
    failed_id: &str,
    worker: &dyn Worker,
    port: &dyn WorkItemPort,
    repo_path: &Path,
) -> Result<ReplanOutcome> {
    let Some(failed) = run.find_subtask(failed_id) else {
        tracing::warn!(subtask = failed_id, "re-plan requested for unknown subtask");
        return Ok(ReplanOutcome::Cancelled);
    };
    let failed_title = failed.title.clone();

    // Prefer the failed worktree: the partial work is useful context.
    let workdir = failed
        .worktree_path
        .as_deref()
        .map(Path::new)
        .filter(|p| p.exists())
        .unwrap_or(repo_path)
        .to_path_buf();

    let prompt = replan_prompt(run, failed_id);
    tracing::info!(subtask = %failed_title, "delegating re-plan to a worker");

    let report = match worker.run(&workdir, &prompt, REPLAN_TIMEOUT).await {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(error = %e, "re-plan worker errored, cancelling dependents");
            run.block_dependents_of(&failed_title);
            return Ok(ReplanOutcome::Cancelled);
        }
    };
    if !report.success {
        tracing::warn!(
            error = %report.error_text(),
            "re-plan worker failed, cancelling dependents"
        );
        run.block_dependents_of(&failed_title);
        return Ok(ReplanOutcome::Cancelled);
    }

    let decision = match parse_decision(&report.output) {
        Some(decision) => decision,
        None => {
            tracing::warn!("re-plan reply had no parseable JSON, cancelling dependents");
            run.block_dependents_of(&failed_title);
            return Ok(ReplanOutcome::Cancelled);
        }
    };

    if let Some(reason) = &decision.reason {
        tracing::debug!(reason = %reason, "re-plan rationale");
    }

    match decision.action.unwrap_or(ReplanAction::Cancel) {
        ReplanAction::Retry => {
            let Some(st) = run.find_subtask_mut(failed_id) else {
                return Ok(ReplanOutcome::Cancelled);
            };
            if let Some(instructions) = decision.modified_instructions {
                st.description = instructions;
            }
            st.error = None;
            st.advance(TaskStatus::Pending)?;
            // `replanned` stays set: a second failure cancels implicitly.
            tracing::info!(subtask = %failed_title, "retrying with modified instructions");
            Ok(ReplanOutcome::Retried)
        }
        ReplanAction::Bridge => {
            let bridged = apply_bridge(run, &failed_title, decision.new_tasks, port).await;
            run.block_dependents_of(&failed_title);
            match bridged {
                Some(added) => {
                    tracing::info!(added, subtask = %failed_title, "bridging subtasks appended");
                    Ok(ReplanOutcome::Bridged { added })
                }
                None => {
                    tracing::warn!("bridge tasks failed validation, cancelling instead");
                    Ok(ReplanOutcome::Cancelled)
                }
            }
        }
        ReplanAction::Cancel => {
            run.block_dependents_of(&failed_title);
            tracing::info!(subtask = %failed_title, "cancelled dependents of failed subtask");
            Ok(ReplanOutcome::Cancelled)
        }
    }
}

/// Extract and decode the first JSON object in the reply.
fn parse_decision(raw: &str) -> Option<ReplanDecision> {
    let cleaned = extract::strip_code_fences(raw);
    let object = extract::first_json_object(&cleaned)?;
    serde_json::from_str(object).ok()
}

/// Append validated bridge subtasks to the run and materialise their cards.
///
/// Returns `None` when the combined graph would be invalid; the run is left
/// untouched in that case.
async fn apply_bridge(
    run: &mut Run,
    failed_title: &str,
    new_tasks: Vec<RawSubtask>,
    port: &dyn WorkItemPort,
) -> Option<usize> {
    if new_tasks.is_empty() {
        tracing::warn!(subtask = failed_title, "bridge decision carried no new tasks");
        return None;
    }

    let mut bridges = planner::subtasks_from_raw(new_tasks, BRIDGE_PRIORITY);
    bridges.truncate(MAX_BRIDGE_TASKS);

    // Validate against the combined graph before committing anything.
    let mut combined = run.subtasks.clone();
    combined.extend(bridges.iter().cloned());
    if let Err(e) = planner::validate_graph(&combined) {
        tracing::warn!(error = %e, "bridge subtasks rejected");
        return None;
    }

    let added = bridges.len();
    for mut bridge in bridges {
        if let Some(list_id) = &run.subtask_list_id {
            match port
                .create_card(list_id, &bridge.title, &bridge.description)
                .await
            {
                Ok(card_id) => bridge.card_id = Some(card_id),
                Err(e) => {
                    tracing::warn!(error = %e, title = %bridge.title, "could not create bridge card");
                }
            }
        }
        run.subtasks.push(bridge);
    }
    Some(added)
}
