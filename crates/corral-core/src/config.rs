//! Startup configuration.
//!
//! Every environment variable is read exactly once, here, into a
//! [`Settings`] value that callers pass down explicitly. Nothing below the
//! CLI layer touches the process environment.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// Environment variable naming the local repository the agents work in.
pub const ENV_REPO_PATH: &str = "GIT_REPO_PATH";

/// Fully resolved configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Trello API key.
    pub trello_api_key: String,
    /// Trello API token.
    pub trello_token: String,
    /// Board that holds the trigger and parking lists.
    pub board_id: String,
    /// Trigger list: cards placed here get orchestrated.
    pub orchestrator_list_id: String,
    /// List cards are returned to when no original list is known.
    pub parking_list_id: Option<String>,
    /// Total-workers-spawned ceiling before the human approval gate engages.
    pub worker_limit: u64,

    /// Bitbucket access token; PR creation is skipped when absent.
    pub bitbucket_token: Option<String>,
    pub bitbucket_workspace: Option<String>,
    pub bitbucket_repo_slug: Option<String>,

    /// Path to the main git repository.
    pub repo_path: PathBuf,
    /// Root state directory (default `~/.corral`).
    pub state_dir: PathBuf,
}

impl Settings {
    /// Load settings from the environment (after `.env`, if present).
    ///
    /// Required: `TRELLO_API_KEY`, `TRELLO_TOKEN`, `TRELLO_BOARD_ID`,
    /// `TRELLO_ORCHESTRATOR_LIST_ID`, `GIT_REPO_PATH`.
    /// Optional: `TRELLO_PARKING_LIST_ID`, `CORRAL_AGENT_LIMIT` (default 10),
    /// `BITBUCKET_ACCESS_TOKEN` / `BITBUCKET_WORKSPACE` /
    /// `BITBUCKET_REPO_SLUG`, `CORRAL_STATE_DIR`.
    pub fn from_env() -> Result<Self> {
        // Best-effort .env loading; a missing file is not an error.
        let _ = dotenvy::dotenv();

        let required = |name: &str| -> Result<String> {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("{name} environment variable must be set"))
        };
        let optional = |name: &str| -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        };

        let worker_limit = match optional("CORRAL_AGENT_LIMIT") {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("CORRAL_AGENT_LIMIT is not a number: {raw:?}"))?,
            None => 10,
        };
        if worker_limit == 0 {
            bail!("CORRAL_AGENT_LIMIT must be at least 1");
        }

        let state_dir = match optional("CORRAL_STATE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_state_dir(),
        };

        Ok(Self {
            trello_api_key: required("TRELLO_API_KEY")?,
            trello_token: required("TRELLO_TOKEN")?,
            board_id: required("TRELLO_BOARD_ID")?,
            orchestrator_list_id: required("TRELLO_ORCHESTRATOR_LIST_ID")?,
            parking_list_id: optional("TRELLO_PARKING_LIST_ID"),
            worker_limit,
            bitbucket_token: optional("BITBUCKET_ACCESS_TOKEN"),
            bitbucket_workspace: optional("BITBUCKET_WORKSPACE"),
            bitbucket_repo_slug: optional("BITBUCKET_REPO_SLUG"),
            repo_path: PathBuf::from(required(ENV_REPO_PATH)?),
            state_dir,
        })
    }

    /// Directory holding run state documents.
    pub fn orchestrator_state_dir(&self) -> PathBuf {
        self.state_dir.join("orchestrator")
    }

    /// Base directory for agent worktrees.
    pub fn worktree_base(&self) -> PathBuf {
        self.state_dir.join("worktrees")
    }
}

/// Default state directory: `~/.corral` (or `./.corral` without a home).
fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".corral")
}
