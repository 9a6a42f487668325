//! Shared fixtures: an in-memory board, a scripted worker, and throwaway
//! git repositories.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use corral_core::git::branch_slug;
use corral_core::worker::{Worker, WorkerReport};
use corral_core::workitem::{Attachment, Card, Comment, WorkItemPort};

// ---------------------------------------------------------------------------
// Git helpers
// ---------------------------------------------------------------------------

pub fn git_in(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
    assert!(
        out.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Temp repository with an initial commit. Returns (guard, repo path).
pub fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().to_path_buf();
    git_in(&path, &["init"]);
    git_in(&path, &["config", "user.email", "test@corral.dev"]);
    git_in(&path, &["config", "user.name", "Corral Test"]);
    std::fs::write(path.join("README.md"), "# Test repo\n").unwrap();
    git_in(&path, &["add", "."]);
    git_in(&path, &["commit", "-m", "Initial commit"]);
    (dir, path)
}

pub fn branch_exists(repo: &Path, branch: &str) -> bool {
    Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(repo)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// In-memory board
// ---------------------------------------------------------------------------

/// In-memory [`WorkItemPort`] with the knobs the scenarios need: moving the
/// parent card off the trigger list after N polls, and auto-replying
/// `continue` when the limit notice lands.
#[derive(Default)]
pub struct MockBoard {
    cards: Mutex<HashMap<String, Card>>,
    /// Comments per card, in insertion order; listings return newest first.
    comments: Mutex<HashMap<String, Vec<Comment>>>,
    /// (list_id, title) of every card created through the port.
    pub created_cards: Mutex<Vec<(String, String)>>,
    pub created_lists: Mutex<Vec<String>>,
    pub moved_cards: Mutex<Vec<(String, String)>>,
    get_card_calls: AtomicUsize,
    next_id: AtomicUsize,
    /// After this many `get_card` calls, the card reports this list.
    move_after: Mutex<Option<(usize, String)>>,
    /// Reply `please continue` as a human when the limit notice is posted.
    pub auto_continue: Mutex<bool>,
}

impl MockBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_card(&self, card: Card) {
        self.cards.lock().unwrap().insert(card.id.clone(), card);
    }

    /// Report `list_id` for the card once more than `calls` lookups happened.
    pub fn move_card_after(&self, calls: usize, list_id: &str) {
        *self.move_after.lock().unwrap() = Some((calls, list_id.to_string()));
    }

    pub fn clear_move(&self) {
        *self.move_after.lock().unwrap() = None;
    }

    pub fn comments_for(&self, card_id: &str) -> Vec<Comment> {
        self.comments
            .lock()
            .unwrap()
            .get(card_id)
            .cloned()
            .unwrap_or_default()
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl WorkItemPort for MockBoard {
    async fn get_card(&self, card_id: &str) -> Result<Card> {
        let calls = self.get_card_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut card = self
            .cards
            .lock()
            .unwrap()
            .get(card_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such card: {card_id}"))?;
        if let Some((after, list_id)) = self.move_after.lock().unwrap().clone() {
            if calls > after {
                card.list_id = list_id;
            }
        }
        Ok(card)
    }

    async fn cards_on_list(&self, list_id: &str) -> Result<Vec<Card>> {
        Ok(self
            .cards
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.list_id == list_id)
            .cloned()
            .collect())
    }

    async fn attachments(&self, _card_id: &str) -> Result<Vec<Attachment>> {
        Ok(vec![])
    }

    async fn add_comment(&self, card_id: &str, text: &str) -> Result<()> {
        let id = self.fresh_id("comment");
        let mut comments = self.comments.lock().unwrap();
        let entry = comments.entry(card_id.to_string()).or_default();
        entry.push(Comment {
            id,
            text: text.to_string(),
            author: None,
        });
        if *self.auto_continue.lock().unwrap() && text.contains("Worker Limit Reached") {
            entry.push(Comment {
                id: self.fresh_id("comment"),
                text: "yes, please continue".to_string(),
                author: Some("Dana Developer".to_string()),
            });
        }
        Ok(())
    }

    async fn comments(&self, card_id: &str) -> Result<Vec<Comment>> {
        let mut comments = self.comments_for(card_id);
        comments.reverse(); // newest first, like the real API
        Ok(comments)
    }

    async fn move_card(&self, card_id: &str, list_id: &str) -> Result<()> {
        self.moved_cards
            .lock()
            .unwrap()
            .push((card_id.to_string(), list_id.to_string()));
        if let Some(card) = self.cards.lock().unwrap().get_mut(card_id) {
            card.list_id = list_id.to_string();
        }
        Ok(())
    }

    async fn create_list(&self, _board_id: &str, name: &str) -> Result<String> {
        self.created_lists.lock().unwrap().push(name.to_string());
        Ok(self.fresh_id("list"))
    }

    async fn create_card(&self, list_id: &str, title: &str, _body: &str) -> Result<String> {
        self.created_cards
            .lock()
            .unwrap()
            .push((list_id.to_string(), title.to_string()));
        Ok(self.fresh_id("card"))
    }
}

// ---------------------------------------------------------------------------
// Scripted worker
// ---------------------------------------------------------------------------

/// What a subtask worker invocation should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Write a file named after the subtask and commit it.
    Succeed,
    /// Exit nonzero without committing anything.
    Fail,
}

/// Scripted [`Worker`]: routes each prompt kind (plan, re-plan, review,
/// conflict resolution, subtask) to configured replies, does real git
/// commits for successful subtasks, and records enough bookkeeping to
/// assert the concurrency invariants.
pub struct MockWorker {
    /// Reply for the decomposition prompt.
    pub plan_json: Mutex<Option<String>>,
    /// Reply for the re-plan prompt; defaults to `cancel`.
    pub replan_json: Mutex<Option<String>>,
    /// Reply for the review prompt; defaults to not-critical.
    pub review_json: Mutex<Option<String>>,
    /// Per-title scripted steps; missing entries succeed.
    pub steps: Mutex<HashMap<String, VecDeque<Step>>>,
    /// Subtask titles in start order.
    pub started: Mutex<Vec<String>>,
    pub review_calls: AtomicUsize,
    pub replan_calls: AtomicUsize,
    running_now: AtomicUsize,
    pub max_running: AtomicUsize,
    /// Simulated work time per subtask.
    pub work_delay: Duration,
}

impl MockWorker {
    pub fn new() -> Self {
        Self {
            plan_json: Mutex::new(None),
            replan_json: Mutex::new(None),
            review_json: Mutex::new(None),
            steps: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            review_calls: AtomicUsize::new(0),
            replan_calls: AtomicUsize::new(0),
            running_now: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            work_delay: Duration::from_millis(40),
        }
    }

    pub fn script(&self, title: &str, steps: &[Step]) {
        self.steps
            .lock()
            .unwrap()
            .insert(title.to_string(), steps.iter().copied().collect());
    }

    pub fn started_titles(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn next_step(&self, title: &str) -> Step {
        self.steps
            .lock()
            .unwrap()
            .get_mut(title)
            .and_then(|q| q.pop_front())
            .unwrap_or(Step::Succeed)
    }
}

fn ok(output: impl Into<String>) -> WorkerReport {
    WorkerReport {
        success: true,
        output: output.into(),
        error: None,
    }
}

fn failed(output: impl Into<String>) -> WorkerReport {
    WorkerReport {
        success: false,
        output: output.into(),
        error: None,
    }
}

#[async_trait]
impl Worker for MockWorker {
    async fn run(&self, workdir: &Path, prompt: &str, _timeout: Duration) -> Result<WorkerReport> {
        // Decomposition request.
        if prompt.starts_with("You are a software architect") {
            return Ok(match self.plan_json.lock().unwrap().clone() {
                Some(json) => ok(json),
                None => failed("no plan scripted"),
            });
        }

        // Re-plan request.
        if prompt.starts_with("A subtask in an automated code orchestration failed") {
            self.replan_calls.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replan_json
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| r#"{"action": "cancel"}"#.to_string());
            return Ok(ok(reply));
        }

        // Review request.
        if prompt.contains("senior code reviewer") {
            self.review_calls.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .review_json
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| r#"{"critical": false}"#.to_string());
            return Ok(ok(reply));
        }

        // Conflict resolution request: succeed without clearing markers.
        if prompt.starts_with("Resolve ALL git merge conflict markers") {
            return Ok(ok("attempted resolution"));
        }

        // Otherwise: a subtask prompt. Extract the title line.
        let title = prompt
            .lines()
            .find_map(|line| line.strip_prefix("## Your Subtask: "))
            .unwrap_or("unknown")
            .to_string();
        self.started.lock().unwrap().push(title.clone());

        let now = self.running_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.work_delay).await;

        let step = self.next_step(&title);
        let report = match step {
            Step::Succeed => {
                let file = format!("{}.txt", branch_slug(&title));
                std::fs::write(workdir.join(&file), format!("{title}\n"))?;
                git_in(workdir, &["add", "-A"]);
                git_in(workdir, &["commit", "-m", &format!("[{title}] done")]);
                ok(format!("implemented {title}"))
            }
            Step::Fail => failed(format!("could not implement {title}")),
        };

        self.running_now.fetch_sub(1, Ordering::SeqCst);
        Ok(report)
    }
}
