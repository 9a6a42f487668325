//! Periodic status publication to the parent card.
//!
//! Every state change a user cares about surfaces as a bot-tagged markdown
//! comment. Posting is best-effort throughout: a failed post is logged and
//! the run carries on.

use chrono::Utc;

use crate::model::{Run, TaskStatus};
use crate::workitem::{BOT_MARKER, WorkItemPort};

/// Build the status comment and bump the run's publication counters.
pub fn status_comment(run: &mut Run, max_agents: usize, extra: &str) -> String {
    let running_titles: Vec<&str> = run
        .subtasks
        .iter()
        .filter(|s| s.status == TaskStatus::Running)
        .map(|s| s.title.as_str())
        .collect();

    run.status_post_count += 1;
    let now = Utc::now().to_rfc3339();
    run.last_status_post = Some(now.clone());

    let mut lines = vec![
        format!("## {BOT_MARKER} Orchestrator Status #{}", run.status_post_count),
        format!("**Time:** {now}"),
        format!("**Phase:** {}", run.phase),
        format!(
            "**Workers:** {}/{} active, {} total spawned",
            running_titles.len(),
            max_agents,
            run.total_workers_spawned
        ),
        String::new(),
        "### Task Counts".to_string(),
    ];

    for (status, count) in run.status_counts() {
        if count > 0 {
            lines.push(format!("- **{status}**: {count}"));
        }
    }

    if !running_titles.is_empty() {
        lines.push(String::new());
        lines.push("### Currently Running".to_string());
        for title in &running_titles {
            lines.push(format!("- {title}"));
        }
    }

    if !extra.is_empty() {
        lines.push(String::new());
        lines.push(extra.to_string());
    }

    lines.join("\n")
}

/// Post a status comment to the parent card; failures are logged only.
pub async fn post_status(
    port: &dyn WorkItemPort,
    run: &mut Run,
    max_agents: usize,
    extra: &str,
) {
    let comment = status_comment(run, max_agents, extra);
    if let Err(e) = port.add_comment(&run.parent_card_id, &comment).await {
        tracing::warn!(error = %e, "failed to post status comment");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Subtask;

    fn sample_run() -> Run {
        let mut run = Run::new("run123456789", "card-1", "Parent", "orch/parent-run123456789", None);
        let mut a = Subtask::new("a", "Task A", "do a", vec![], vec![], 1);
        a.status = TaskStatus::Running;
        let mut b = Subtask::new("b", "Task B", "do b", vec![], vec![], 2);
        b.status = TaskStatus::Complete;
        run.subtasks = vec![a, b];
        run.total_workers_spawned = 2;
        run
    }

    #[test]
    fn comment_starts_with_bot_marker_heading() {
        let mut run = sample_run();
        let comment = status_comment(&mut run, 3, "");
        let first_line = comment.lines().next().unwrap();
        assert!(first_line.contains(BOT_MARKER));
    }

    #[test]
    fn comment_reports_counts_and_running_titles() {
        let mut run = sample_run();
        let comment = status_comment(&mut run, 3, "");
        assert!(comment.contains("**Phase:** planning"));
        assert!(comment.contains("**Workers:** 1/3 active, 2 total spawned"));
        assert!(comment.contains("- **running**: 1"));
        assert!(comment.contains("- **complete**: 1"));
        assert!(comment.contains("### Currently Running"));
        assert!(comment.contains("- Task A"));
        // Zero counts are omitted.
        assert!(!comment.contains("- **blocked**"));
    }

    #[test]
    fn comment_appends_extra_section() {
        let mut run = sample_run();
        let comment = status_comment(&mut run, 3, "**Stopped by user.**");
        assert!(comment.ends_with("**Stopped by user.**"));
    }

    #[test]
    fn counters_increment_per_comment() {
        let mut run = sample_run();
        status_comment(&mut run, 3, "");
        status_comment(&mut run, 3, "");
        assert_eq!(run.status_post_count, 2);
        assert!(run.last_status_post.is_some());
    }
}
