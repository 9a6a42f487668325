//! Git driver: branch, worktree, merge, and push operations for the
//! orchestrator.
//!
//! Every agent works in its own worktree, which shares the object store of
//! the main repository but has an independent working directory, so
//! parallel agents never collide on the filesystem. Ref updates are
//! serialised by git's own repository locking.
//!
//! Each command is spawned through `tokio::process` with a wall-clock
//! timeout; callers get exit status, stdout, and stderr so they can
//! classify failures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

/// Wall-clock limit for a single git invocation.
const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The path is not a git repository.
    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),

    /// The command could not be spawned or awaited.
    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The command exceeded the per-invocation timeout.
    #[error("git {command} timed out after {}s", GIT_TIMEOUT.as_secs())]
    Timeout { command: String },

    /// The command exited nonzero where the caller required success.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to create worktree base directory {path}: {source}")]
    WorktreeBase {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Captured output of a git command.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Sanitise a string for use as a branch-name component: lowercase, with
/// every run of characters outside `[a-z0-9-]` collapsed to a single `-`.
pub fn branch_slug(raw: &str) -> String {
    let re = regex::Regex::new(r"[^a-z0-9-]+").expect("static regex");
    re.replace_all(&raw.to_lowercase(), "-").trim_matches('-').to_string()
}

/// Git operations bound to one repository and one worktree base directory.
#[derive(Debug, Clone)]
pub struct GitDriver {
    repo_path: PathBuf,
    worktree_base: PathBuf,
}

impl GitDriver {
    /// Create a driver for `repo_path`, verifying it is a git repository
    /// and creating `worktree_base` if needed.
    pub async fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: impl Into<PathBuf>,
    ) -> Result<Self, GitError> {
        let repo_path = repo_path.into();
        let worktree_base = worktree_base.into();

        let probe = run_git(&["rev-parse", "--git-dir"], &repo_path, false).await?;
        if !probe.success {
            return Err(GitError::NotARepo(repo_path));
        }

        std::fs::create_dir_all(&worktree_base).map_err(|e| GitError::WorktreeBase {
            path: worktree_base.clone(),
            source: e,
        })?;

        Ok(Self {
            repo_path,
            worktree_base,
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// `git fetch origin`. Best-effort: a missing remote is logged, not fatal.
    pub async fn fetch_origin(&self) -> Result<(), GitError> {
        let out = run_git(&["fetch", "origin"], &self.repo_path, false).await?;
        if !out.success {
            tracing::debug!(stderr = %out.stderr.trim(), "git fetch origin failed");
        }
        Ok(())
    }

    /// Create a branch from `start` (default `HEAD`).
    ///
    /// Tolerates the branch already existing, which happens on every resume.
    pub async fn create_branch(&self, name: &str, start: Option<&str>) -> Result<(), GitError> {
        let start = start.unwrap_or("HEAD");
        let out = run_git(&["branch", name, start], &self.repo_path, false).await?;
        if !out.success {
            tracing::debug!(branch = name, stderr = %out.stderr.trim(), "git branch failed");
        }
        Ok(())
    }

    /// Check whether a local branch exists.
    pub async fn branch_exists(&self, name: &str) -> Result<bool, GitError> {
        let refname = format!("refs/heads/{name}");
        let out = run_git(&["rev-parse", "--verify", &refname], &self.repo_path, false).await?;
        Ok(out.success)
    }

    /// Force-delete a local branch. Idempotent.
    pub async fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        let out = run_git(&["branch", "-D", name], &self.repo_path, false).await?;
        if !out.success && !out.stderr.contains("not found") {
            tracing::debug!(branch = name, stderr = %out.stderr.trim(), "git branch -D failed");
        }
        Ok(())
    }

    /// Add a worktree for `branch` under the worktree base.
    ///
    /// The label is embedded in the directory name so several worktrees for
    /// the same run never collide. Idempotent: an existing directory is
    /// returned as-is (a resumed run reuses its worktrees).
    pub async fn create_worktree(&self, branch: &str, label: &str) -> Result<PathBuf, GitError> {
        let dir_name = format!("orch_{label}_{}", branch.replace('/', "_"));
        let path = self.worktree_base.join(dir_name);
        if path.exists() {
            return Ok(path);
        }
        let path_str = path.to_string_lossy().to_string();
        run_git(&["worktree", "add", &path_str, branch], &self.repo_path, true).await?;
        Ok(path)
    }

    /// Remove a worktree. Idempotent: a missing directory is a no-op.
    pub async fn remove_worktree(&self, path: &Path) -> Result<(), GitError> {
        if !path.exists() {
            return Ok(());
        }
        let path_str = path.to_string_lossy().to_string();
        let out = run_git(
            &["worktree", "remove", "--force", &path_str],
            &self.repo_path,
            false,
        )
        .await?;
        if !out.success {
            tracing::debug!(path = %path.display(), stderr = %out.stderr.trim(), "git worktree remove failed");
        }
        Ok(())
    }

    /// Merge `branch` into the checkout at `worktree` with `--no-ff`.
    ///
    /// The raw output is returned so the caller can combine it with
    /// [`Self::has_conflicts`] to classify the result.
    pub async fn merge_branch(&self, branch: &str, worktree: &Path) -> Result<GitOutput, GitError> {
        let message = format!("Merge subtask branch {branch}");
        run_git(
            &["merge", "--no-ff", branch, "-m", &message],
            worktree,
            false,
        )
        .await
    }

    /// True if the checkout at `worktree` has unresolved conflict entries.
    pub async fn has_conflicts(&self, worktree: &Path) -> Result<bool, GitError> {
        let out = run_git(
            &["diff", "--name-only", "--diff-filter=U"],
            worktree,
            false,
        )
        .await?;
        Ok(!out.stdout.trim().is_empty())
    }

    /// Abort an in-progress merge at `worktree`. Best-effort.
    pub async fn abort_merge(&self, worktree: &Path) -> Result<(), GitError> {
        let out = run_git(&["merge", "--abort"], worktree, false).await?;
        if !out.success {
            tracing::debug!(stderr = %out.stderr.trim(), "git merge --abort failed");
        }
        Ok(())
    }

    /// Resolve conflicted paths in favour of the incoming branch.
    ///
    /// Used only on throwaway review merges, where the result is discarded.
    pub async fn take_theirs(&self, worktree: &Path) -> Result<(), GitError> {
        let out = run_git(&["checkout", "--theirs", "."], worktree, false).await?;
        if !out.success {
            tracing::debug!(stderr = %out.stderr.trim(), "git checkout --theirs failed");
        }
        Ok(())
    }

    /// Stage everything and commit at `worktree`.
    ///
    /// The commit itself tolerates "nothing to commit".
    pub async fn commit_all(&self, worktree: &Path, message: &str) -> Result<(), GitError> {
        run_git(&["add", "-A"], worktree, true).await?;
        let out = run_git(&["commit", "-m", message], worktree, false).await?;
        if !out.success {
            tracing::debug!(stderr = %out.stderr.trim(), stdout = %out.stdout.trim(), "git commit made no commit");
        }
        Ok(())
    }

    /// Push `branch` to origin with upstream tracking. Best-effort: the
    /// branch still exists locally if the push fails, and a later merge can
    /// proceed from it.
    pub async fn push(&self, branch: &str, cwd: Option<&Path>) -> Result<GitOutput, GitError> {
        let cwd = cwd.unwrap_or(&self.repo_path);
        run_git(&["push", "-u", "origin", branch], cwd, false).await
    }

    /// Pull `branch` from origin in `worktree`. Best-effort.
    pub async fn pull(&self, branch: &str, worktree: &Path) -> Result<(), GitError> {
        let out = run_git(&["pull", "origin", branch], worktree, false).await?;
        if !out.success {
            tracing::debug!(branch, stderr = %out.stderr.trim(), "git pull failed");
        }
        Ok(())
    }

    /// Remove worktree registrations whose directories no longer exist.
    ///
    /// Run once at startup; agents and operators sometimes delete worktree
    /// directories by hand and git keeps the stale registration.
    pub async fn prune_orphaned_worktrees(&self) -> Result<usize, GitError> {
        let out = run_git(&["worktree", "list", "--porcelain"], &self.repo_path, true).await?;
        let mut pruned = 0;
        for path in parse_worktree_paths(&out.stdout) {
            if path == self.repo_path || path.exists() {
                continue;
            }
            tracing::info!(path = %path.display(), "removing orphaned worktree registration");
            let path_str = path.to_string_lossy().to_string();
            let _ = run_git(&["worktree", "remove", "--force", &path_str], &self.repo_path, false)
                .await?;
            pruned += 1;
        }
        if pruned > 0 {
            let _ = run_git(&["worktree", "prune"], &self.repo_path, false).await?;
        }
        Ok(pruned)
    }
}

/// Worktree paths from `git worktree list --porcelain` output.
fn parse_worktree_paths(porcelain: &str) -> Vec<PathBuf> {
    porcelain
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)
        .collect()
}

/// Run a git command in `cwd` with the standard timeout.
///
/// With `check`, a nonzero exit becomes [`GitError::Exit`]; otherwise the
/// captured output is returned for the caller to classify.
async fn run_git(args: &[&str], cwd: &Path, check: bool) -> Result<GitOutput, GitError> {
    let command_label = args.join(" ");
    tracing::trace!(command = %command_label, cwd = %cwd.display(), "running git");

    let fut = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(GIT_TIMEOUT, fut).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            return Err(GitError::Spawn {
                command: command_label,
                source: e,
            });
        }
        Err(_) => {
            return Err(GitError::Timeout {
                command: command_label,
            });
        }
    };

    let result = GitOutput {
        success: output.status.success(),
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };

    if check && !result.success {
        return Err(GitError::Exit {
            command: command_label,
            code: result.code,
            stderr: result.stderr,
        });
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    /// Create a temporary git repository with an initial commit.
    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().to_path_buf();

        let run = |args: &[&str]| {
            let output = StdCommand::new("git")
                .args(args)
                .current_dir(&repo_path)
                .output()
                .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
            assert!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        };

        run(&["init"]);
        run(&["config", "user.email", "test@corral.dev"]);
        run(&["config", "user.name", "Corral Test"]);
        std::fs::write(repo_path.join("README.md"), "# Test repo\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);

        (dir, repo_path)
    }

    async fn driver_for(repo: &Path) -> (TempDir, GitDriver) {
        let base = TempDir::new().unwrap();
        let driver = GitDriver::new(repo, base.path()).await.unwrap();
        (base, driver)
    }

    #[test]
    fn branch_slug_sanitises() {
        assert_eq!(branch_slug("Add OAuth2 support!"), "add-oauth2-support");
        assert_eq!(branch_slug("fix/thing"), "fix-thing");
        assert_eq!(branch_slug("--edge--"), "edge");
    }

    #[test]
    fn parses_worktree_paths_from_porcelain() {
        let porcelain = "\
worktree /home/user/project
HEAD abc123
branch refs/heads/main

worktree /home/user/wt/feature
HEAD def456
branch refs/heads/orch/feature
";
        let paths = parse_worktree_paths(porcelain);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/home/user/project"),
                PathBuf::from("/home/user/wt/feature")
            ]
        );
    }

    #[tokio::test]
    async fn rejects_non_repo() {
        let dir = TempDir::new().unwrap();
        let base = TempDir::new().unwrap();
        let result = GitDriver::new(dir.path(), base.path()).await;
        assert!(matches!(result, Err(GitError::NotARepo(_))));
    }

    #[tokio::test]
    async fn create_branch_and_worktree() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_base, driver) = driver_for(&repo).await;

        driver.create_branch("orch/task-a", None).await.unwrap();
        assert!(driver.branch_exists("orch/task-a").await.unwrap());

        let wt = driver.create_worktree("orch/task-a", "task-a").await.unwrap();
        assert!(wt.exists());
        assert!(wt.join("README.md").exists());

        // Idempotent: a second call returns the same path.
        let again = driver.create_worktree("orch/task-a", "task-a").await.unwrap();
        assert_eq!(wt, again);
    }

    #[tokio::test]
    async fn create_branch_tolerates_existing() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_base, driver) = driver_for(&repo).await;

        driver.create_branch("orch/dup", None).await.unwrap();
        driver.create_branch("orch/dup", None).await.unwrap();
    }

    #[tokio::test]
    async fn remove_worktree_is_idempotent() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_base, driver) = driver_for(&repo).await;

        driver.create_branch("orch/rm", None).await.unwrap();
        let wt = driver.create_worktree("orch/rm", "rm").await.unwrap();
        driver.remove_worktree(&wt).await.unwrap();
        assert!(!wt.exists());
        driver.remove_worktree(&wt).await.unwrap();
    }

    #[tokio::test]
    async fn commit_all_and_clean_merge() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_base, driver) = driver_for(&repo).await;

        driver.create_branch("orch/feature", None).await.unwrap();
        let wt = driver.create_worktree("orch/feature", "feature").await.unwrap();
        std::fs::write(wt.join("feature.txt"), "new feature\n").unwrap();
        driver.commit_all(&wt, "Add feature").await.unwrap();

        // Merge the feature branch into the main checkout.
        let out = driver.merge_branch("orch/feature", &repo).await.unwrap();
        assert!(out.success, "merge failed: {}", out.stderr);
        assert!(!driver.has_conflicts(&repo).await.unwrap());
        assert!(repo.join("feature.txt").exists());
    }

    #[tokio::test]
    async fn commit_all_tolerates_nothing_to_commit() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_base, driver) = driver_for(&repo).await;
        driver.commit_all(&repo, "empty").await.unwrap();
    }

    #[tokio::test]
    async fn conflicting_merge_is_detected_and_abortable() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_base, driver) = driver_for(&repo).await;

        // Branch edits README one way...
        driver.create_branch("orch/conflict", None).await.unwrap();
        let wt = driver.create_worktree("orch/conflict", "conflict").await.unwrap();
        std::fs::write(wt.join("README.md"), "# branch version\n").unwrap();
        driver.commit_all(&wt, "Branch edit").await.unwrap();

        // ...the main checkout edits it another way.
        std::fs::write(repo.join("README.md"), "# main version\n").unwrap();
        driver.commit_all(&repo, "Main edit").await.unwrap();

        let out = driver.merge_branch("orch/conflict", &repo).await.unwrap();
        assert!(!out.success);
        assert!(driver.has_conflicts(&repo).await.unwrap());

        driver.abort_merge(&repo).await.unwrap();
        assert!(!driver.has_conflicts(&repo).await.unwrap());
    }

    #[tokio::test]
    async fn delete_branch_is_idempotent() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_base, driver) = driver_for(&repo).await;

        driver.create_branch("orch/gone", None).await.unwrap();
        driver.delete_branch("orch/gone").await.unwrap();
        assert!(!driver.branch_exists("orch/gone").await.unwrap());
        driver.delete_branch("orch/gone").await.unwrap();
    }

    #[tokio::test]
    async fn prune_removes_orphaned_registrations() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_base, driver) = driver_for(&repo).await;

        driver.create_branch("orch/stale", None).await.unwrap();
        let wt = driver.create_worktree("orch/stale", "stale").await.unwrap();

        // Simulate an operator deleting the directory by hand.
        std::fs::remove_dir_all(&wt).unwrap();

        let pruned = driver.prune_orphaned_worktrees().await.unwrap();
        assert_eq!(pruned, 1);

        // Nothing left to prune on the second pass.
        let pruned = driver.prune_orphaned_worktrees().await.unwrap();
        assert_eq!(pruned, 0);
    }

    #[tokio::test]
    async fn push_without_remote_reports_failure_output() {
        let (_repo_dir, repo) = create_temp_repo();
        let (_base, driver) = driver_for(&repo).await;

        // No origin configured: push fails but does not error out.
        let out = driver.push("master", None).await.unwrap();
        assert!(!out.success);
        assert!(!out.stderr.is_empty());
    }
}
