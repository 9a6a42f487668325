//! Planner: delegate task decomposition to a worker and validate the
//! resulting subtask DAG.
//!
//! The decomposition worker runs in the main repository working tree (not a
//! fresh worktree) so it can read the codebase. Its output is untrusted
//! text; parsing goes through [`crate::extract`], with one repair attempt by
//! a second worker whose sole job is to return valid JSON. Validation never
//! repairs silently: a duplicate, dangling, or cyclic graph fails the run
//! with a descriptive error.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::extract;
use crate::model::Subtask;
use crate::worker::Worker;

/// Wall-clock budget for the decomposition worker.
pub const DECOMPOSE_TIMEOUT: Duration = Duration::from_secs(300);

/// Wall-clock budget for the JSON-repair worker.
const REPAIR_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors from decomposition and plan validation.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("decomposition worker failed: {0}")]
    WorkerFailed(String),

    #[error("worker output contained no JSON array, even after repair")]
    NoJsonFound,

    #[error("worker output was not a valid subtask array: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("plan contains no subtasks")]
    NoSubtasks,

    #[error("duplicate subtask id: {0:?}")]
    DuplicateId(String),

    #[error("duplicate subtask title: {0:?}")]
    DuplicateTitle(String),

    #[error("subtask {task:?} depends on unknown title {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving: {0}")]
    CycleDetected(String),

    #[error(transparent)]
    Worker(#[from] anyhow::Error),
}

/// Subtask object as the worker emits it. Converted to a domain
/// [`Subtask`] with [`subtasks_from_raw`].
#[derive(Debug, Clone, Deserialize)]
pub struct RawSubtask {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_files: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

// ---------------------------------------------------------------------------
// Prompt construction
// ---------------------------------------------------------------------------

/// Decomposition policy baked into the prompt.
const DECOMPOSITION_RULES: &str = "\
Rules:
- Make each subtask independently implementable in its own git branch
- Minimise file overlap between subtasks to avoid merge conflicts
- Include concrete file paths and clear acceptance criteria in each description
- Specify dependencies between subtasks by title
- Always include a final integration/testing subtask that depends on all others
- Return ONLY the JSON array, no markdown fences, no explanation";

/// Build the decomposition prompt for the parent card.
pub fn decomposition_prompt(title: &str, description: &str, attachments_info: &str) -> String {
    let mut prompt = String::with_capacity(2048);
    prompt.push_str(
        "You are a software architect. Decompose the following task into 3-8 \
         independently executable subtasks for parallel coding agents.\n\n",
    );
    prompt.push_str(&format!("TASK TITLE: {title}\n\n"));
    prompt.push_str(&format!("TASK DESCRIPTION:\n{description}\n\n"));
    if !attachments_info.is_empty() {
        prompt.push_str(&format!("ATTACHMENTS INFO:\n{attachments_info}\n\n"));
    }
    prompt.push_str(
        "Return ONLY a JSON array of subtask objects. Each object must have \
         these fields:\n\
         - \"id\": a short unique slug (e.g. \"setup-auth\")\n\
         - \"title\": concise subtask title\n\
         - \"description\": a complete, standalone prompt for a coding agent \
         -- include ALL context needed so the agent can work without seeing \
         other subtasks\n\
         - \"dependencies\": list of other subtask titles this depends on \
         (empty list if none)\n\
         - \"estimated_files\": list of file paths this subtask will likely \
         touch\n\
         - \"priority\": integer (1 = highest). Same priority means tasks can \
         run in parallel.\n\n",
    );
    prompt.push_str(DECOMPOSITION_RULES);
    prompt
}

/// Build the one-shot JSON repair prompt.
fn repair_prompt(raw: &str) -> String {
    format!(
        "The following text was supposed to be a JSON array of subtask \
         objects but it has syntax errors. Fix it and return ONLY the \
         corrected JSON array, nothing else:\n\n{raw}"
    )
}

// ---------------------------------------------------------------------------
// Parsing and validation
// ---------------------------------------------------------------------------

/// Parse a worker reply into raw subtask records.
///
/// Strips code fences, takes the first balanced `[...]`, and decodes it.
pub fn parse_subtask_array(raw: &str) -> Result<Vec<RawSubtask>, PlanError> {
    let cleaned = extract::strip_code_fences(raw);
    let array = extract::first_json_array(&cleaned).ok_or(PlanError::NoJsonFound)?;
    Ok(serde_json::from_str(array)?)
}

/// Convert raw records into domain subtasks.
///
/// Records without an id get a random 8-char slug; records without a
/// priority get `default_priority`.
pub fn subtasks_from_raw(raw: Vec<RawSubtask>, default_priority: i64) -> Vec<Subtask> {
    raw.into_iter()
        .map(|item| {
            let id = item
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(short_id);
            Subtask::new(
                id,
                item.title,
                item.description,
                item.dependencies,
                item.estimated_files,
                item.priority.unwrap_or(default_priority),
            )
        })
        .collect()
}

/// A random 8-character id for subtasks the worker left unnamed.
pub fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Validate the whole subtask set: non-empty, unique ids and titles, every
/// dependency declared, and an acyclic graph.
pub fn validate_graph(subtasks: &[Subtask]) -> Result<(), PlanError> {
    if subtasks.is_empty() {
        return Err(PlanError::NoSubtasks);
    }

    let mut ids = HashSet::new();
    let mut titles = HashSet::new();
    for st in subtasks {
        if !ids.insert(st.id.as_str()) {
            return Err(PlanError::DuplicateId(st.id.clone()));
        }
        if !titles.insert(st.title.as_str()) {
            return Err(PlanError::DuplicateTitle(st.title.clone()));
        }
    }

    for st in subtasks {
        for dep in &st.dependencies {
            if !titles.contains(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    task: st.title.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_for_cycles(subtasks)
}

/// Kahn's algorithm over the title graph; leftover in-degree means a cycle.
fn check_for_cycles(subtasks: &[Subtask]) -> Result<(), PlanError> {
    let titles: Vec<&str> = subtasks.iter().map(|s| s.title.as_str()).collect();
    let index_of: HashMap<&str, usize> = titles
        .iter()
        .enumerate()
        .map(|(i, title)| (*title, i))
        .collect();

    let n = titles.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for st in subtasks {
        let task_idx = index_of[st.title.as_str()];
        for dep in &st.dependencies {
            let dep_idx = index_of[dep.as_str()];
            adj[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut sorted = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted != n {
        let cycle: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| titles[i])
            .collect();
        return Err(PlanError::CycleDetected(cycle.join(", ")));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Decomposition
// ---------------------------------------------------------------------------

/// Delegate decomposition of the parent card to a worker and return the
/// validated subtask set.
pub async fn decompose(
    worker: &dyn Worker,
    repo_path: &Path,
    title: &str,
    description: &str,
    attachments_info: &str,
) -> Result<Vec<Subtask>, PlanError> {
    let prompt = decomposition_prompt(title, description, attachments_info);

    tracing::info!("delegating task decomposition to a worker");
    let report = worker
        .run(repo_path, &prompt, DECOMPOSE_TIMEOUT)
        .await
        .map_err(PlanError::Worker)?;
    if !report.success {
        return Err(PlanError::WorkerFailed(report.error_text()));
    }

    let raw = match parse_subtask_array(&report.output) {
        Ok(raw) => raw,
        Err(first_err) => {
            tracing::warn!(error = %first_err, "plan output malformed, delegating repair");
            let fix = worker
                .run(repo_path, &repair_prompt(&report.output), REPAIR_TIMEOUT)
                .await
                .map_err(PlanError::Worker)?;
            if !fix.success {
                return Err(PlanError::WorkerFailed(fix.error_text()));
            }
            parse_subtask_array(&fix.output)?
        }
    };

    let subtasks = subtasks_from_raw(raw, 99);
    validate_graph(&subtasks)?;

    tracing::info!(count = subtasks.len(), "decomposition produced subtasks");
    Ok(subtasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::worker::WorkerReport;

    /// Worker that replays a scripted sequence of outputs.
    struct ScriptedWorker {
        replies: Mutex<Vec<WorkerReport>>,
    }

    impl ScriptedWorker {
        fn new(outputs: Vec<&str>) -> Self {
            Self {
                replies: Mutex::new(
                    outputs
                        .into_iter()
                        .rev()
                        .map(|o| WorkerReport {
                            success: true,
                            output: o.to_string(),
                            error: None,
                        })
                        .collect(),
                ),
            }
        }

        fn failing() -> Self {
            Self {
                replies: Mutex::new(vec![WorkerReport {
                    success: false,
                    output: String::new(),
                    error: None,
                }]),
            }
        }
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        async fn run(
            &self,
            _workdir: &Path,
            _prompt: &str,
            _timeout: Duration,
        ) -> Result<WorkerReport> {
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop()
                .expect("scripted worker ran out of replies"))
        }
    }

    const VALID_PLAN: &str = r#"[
        {"id": "models", "title": "Models", "description": "Define the models.",
         "dependencies": [], "estimated_files": ["src/models.rs"], "priority": 1},
        {"id": "api", "title": "API", "description": "Build the API.",
         "dependencies": ["Models"], "estimated_files": ["src/api.rs"], "priority": 2},
        {"id": "integrate", "title": "Integration", "description": "Wire and test everything.",
         "dependencies": ["Models", "API"], "estimated_files": [], "priority": 3}
    ]"#;

    #[test]
    fn prompt_carries_contract_and_rules() {
        let prompt = decomposition_prompt("Add auth", "OAuth login", "- spec.pdf");
        assert!(prompt.contains("TASK TITLE: Add auth"));
        assert!(prompt.contains("OAuth login"));
        assert!(prompt.contains("ATTACHMENTS INFO:\n- spec.pdf"));
        assert!(prompt.contains("3-8"));
        assert!(prompt.contains("Minimise file overlap"));
        assert!(prompt.contains("final integration/testing subtask"));
        assert!(prompt.contains("ONLY the JSON array"));
    }

    #[test]
    fn prompt_omits_empty_attachment_block() {
        let prompt = decomposition_prompt("T", "D", "");
        assert!(!prompt.contains("ATTACHMENTS INFO"));
    }

    #[test]
    fn parses_bare_array() {
        let raw = parse_subtask_array(VALID_PLAN).unwrap();
        assert_eq!(raw.len(), 3);
        assert_eq!(raw[0].title, "Models");
    }

    #[test]
    fn parses_fenced_array_with_prose() {
        let wrapped = format!("Here you go:\n```json\n{VALID_PLAN}\n```\nDone.");
        let raw = parse_subtask_array(&wrapped).unwrap();
        assert_eq!(raw.len(), 3);
    }

    #[test]
    fn rejects_text_without_array() {
        let err = parse_subtask_array("I could not decompose this.").unwrap_err();
        assert!(matches!(err, PlanError::NoJsonFound));
    }

    #[test]
    fn missing_id_gets_generated_slug() {
        let raw = vec![RawSubtask {
            id: None,
            title: "T".into(),
            description: "D".into(),
            dependencies: vec![],
            estimated_files: vec![],
            priority: None,
        }];
        let subtasks = subtasks_from_raw(raw, 99);
        assert_eq!(subtasks[0].id.len(), 8);
        assert_eq!(subtasks[0].priority, 99);
    }

    #[test]
    fn validate_accepts_diamond() {
        let raw = parse_subtask_array(VALID_PLAN).unwrap();
        let subtasks = subtasks_from_raw(raw, 99);
        validate_graph(&subtasks).unwrap();
    }

    #[test]
    fn validate_rejects_empty_plan() {
        assert!(matches!(validate_graph(&[]), Err(PlanError::NoSubtasks)));
    }

    #[test]
    fn validate_rejects_duplicate_id() {
        let subtasks = vec![
            Subtask::new("a", "First", "d", vec![], vec![], 1),
            Subtask::new("a", "Second", "d", vec![], vec![], 1),
        ];
        assert!(matches!(
            validate_graph(&subtasks),
            Err(PlanError::DuplicateId(_))
        ));
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let subtasks = vec![Subtask::new(
            "a",
            "A",
            "d",
            vec!["Ghost".to_string()],
            vec![],
            1,
        )];
        let err = validate_graph(&subtasks).unwrap_err();
        assert!(matches!(
            err,
            PlanError::UnknownDependency { ref dependency, .. } if dependency == "Ghost"
        ));
    }

    #[test]
    fn validate_rejects_direct_cycle() {
        let subtasks = vec![
            Subtask::new("a", "A", "d", vec!["B".to_string()], vec![], 1),
            Subtask::new("b", "B", "d", vec!["A".to_string()], vec![], 1),
        ];
        assert!(matches!(
            validate_graph(&subtasks),
            Err(PlanError::CycleDetected(_))
        ));
    }

    #[test]
    fn validate_rejects_transitive_cycle() {
        let subtasks = vec![
            Subtask::new("a", "A", "d", vec!["C".to_string()], vec![], 1),
            Subtask::new("b", "B", "d", vec!["A".to_string()], vec![], 1),
            Subtask::new("c", "C", "d", vec!["B".to_string()], vec![], 1),
        ];
        assert!(matches!(
            validate_graph(&subtasks),
            Err(PlanError::CycleDetected(_))
        ));
    }

    #[tokio::test]
    async fn decompose_happy_path() {
        let worker = ScriptedWorker::new(vec![VALID_PLAN]);
        let subtasks = decompose(&worker, Path::new("/tmp"), "T", "D", "")
            .await
            .unwrap();
        assert_eq!(subtasks.len(), 3);
        assert_eq!(subtasks[2].dependencies, vec!["Models", "API"]);
    }

    #[tokio::test]
    async fn decompose_repairs_malformed_output_once() {
        // First reply is broken JSON; the repair reply is valid.
        let worker = ScriptedWorker::new(vec!["[{\"title\": broken", VALID_PLAN]);
        let subtasks = decompose(&worker, Path::new("/tmp"), "T", "D", "")
            .await
            .unwrap();
        assert_eq!(subtasks.len(), 3);
    }

    #[tokio::test]
    async fn decompose_fails_when_repair_also_fails() {
        let worker = ScriptedWorker::new(vec!["not json", "still not json"]);
        let err = decompose(&worker, Path::new("/tmp"), "T", "D", "")
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::NoJsonFound));
    }

    #[tokio::test]
    async fn decompose_fails_when_worker_fails() {
        let worker = ScriptedWorker::failing();
        let err = decompose(&worker, Path::new("/tmp"), "T", "D", "")
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::WorkerFailed(_)));
    }

    #[tokio::test]
    async fn decompose_rejects_empty_array() {
        let worker = ScriptedWorker::new(vec!["[]"]);
        let err = decompose(&worker, Path::new("/tmp"), "T", "D", "")
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::NoSubtasks));
    }
}
