//! Code-host port: the single capability the orchestrator needs from the
//! hosting service -- opening a pull request from the parent branch.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

/// Per-request timeout for the code-host API.
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens a pull request into the repository's default branch and returns
/// the web URL of the created request.
#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn create_pull_request(
        &self,
        source_branch: &str,
        title: &str,
        description: &str,
    ) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Bitbucket implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    #[serde(default)]
    links: PullRequestLinks,
}

#[derive(Debug, Default, Deserialize)]
struct PullRequestLinks {
    #[serde(default)]
    html: Option<HtmlLink>,
}

#[derive(Debug, Deserialize)]
struct HtmlLink {
    #[serde(default)]
    href: String,
}

/// Bitbucket Cloud client implementing [`CodeHost`].
#[derive(Debug, Clone)]
pub struct Bitbucket {
    client: reqwest::Client,
    base_url: String,
    token: String,
    workspace: String,
    repo_slug: String,
}

impl Bitbucket {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.bitbucket.org/2.0";

    pub fn new(
        token: impl Into<String>,
        workspace: impl Into<String>,
        repo_slug: impl Into<String>,
    ) -> Result<Self> {
        Self::with_base_url(token, workspace, repo_slug, Self::DEFAULT_BASE_URL)
    }

    /// Point the client at a different base URL (tests).
    pub fn with_base_url(
        token: impl Into<String>,
        workspace: impl Into<String>,
        repo_slug: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
            workspace: workspace.into(),
            repo_slug: repo_slug.into(),
        })
    }
}

#[async_trait]
impl CodeHost for Bitbucket {
    async fn create_pull_request(
        &self,
        source_branch: &str,
        title: &str,
        description: &str,
    ) -> Result<String> {
        let url = format!(
            "{}/repositories/{}/{}/pullrequests",
            self.base_url, self.workspace, self.repo_slug
        );
        let payload = json!({
            "title": title,
            "source": {"branch": {"name": source_branch}},
            "description": description,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .context("POST pull request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(300).collect();
            bail!("pull request creation returned {status}: {snippet}");
        }

        let created: PullRequestResponse = resp.json().await.context("decoding pull request")?;
        Ok(created
            .links
            .html
            .map(|link| link.href)
            .unwrap_or_default())
    }
}
