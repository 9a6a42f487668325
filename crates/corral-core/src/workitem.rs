//! Work-item port: the narrow Trello capability the orchestrator needs.
//!
//! Eight calls, each with a 30 second wall-clock timeout. The port never
//! retries; transient failures are reported to the caller, which decides
//! whether the operation was best-effort (status comments) or fatal
//! (initial card fetch). Scheduling tolerates one failed poll.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// First line of every comment the orchestrator posts. Comments carrying
/// the marker are skipped when scanning for human input.
pub const BOT_MARKER: &str = "[corral-bot]";

/// Per-request timeout for the work-item API.
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// A card as the orchestrator sees it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Card {
    pub id: String,
    #[serde(rename = "name")]
    pub title: String,
    #[serde(rename = "desc", default)]
    pub description: String,
    #[serde(rename = "idList", default)]
    pub list_id: String,
    #[serde(rename = "idBoard", default)]
    pub board_id: String,
}

/// Attachment metadata; only the summary fields, never the content.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub bytes: Option<u64>,
}

/// A comment on a card, newest first in listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub text: String,
    pub author: Option<String>,
}

impl Comment {
    /// True when the orchestrator itself wrote this comment.
    pub fn is_bot(&self) -> bool {
        self.text.contains(BOT_MARKER)
    }
}

/// The work-item operations the orchestrator depends on.
#[async_trait]
pub trait WorkItemPort: Send + Sync {
    async fn get_card(&self, card_id: &str) -> Result<Card>;
    async fn cards_on_list(&self, list_id: &str) -> Result<Vec<Card>>;
    async fn attachments(&self, card_id: &str) -> Result<Vec<Attachment>>;
    async fn add_comment(&self, card_id: &str, text: &str) -> Result<()>;
    /// Comments on a card, newest first.
    async fn comments(&self, card_id: &str) -> Result<Vec<Comment>>;
    async fn move_card(&self, card_id: &str, list_id: &str) -> Result<()>;
    /// Create a list on a board, returning its id.
    async fn create_list(&self, board_id: &str, name: &str) -> Result<String>;
    /// Create a card on a list, returning its id.
    async fn create_card(&self, list_id: &str, title: &str, body: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Trello implementation
// ---------------------------------------------------------------------------

/// Wire shape of a Trello comment action.
#[derive(Debug, Deserialize)]
struct CommentAction {
    id: String,
    #[serde(default)]
    data: CommentData,
    #[serde(rename = "memberCreator", default)]
    member_creator: Option<MemberCreator>,
}

#[derive(Debug, Default, Deserialize)]
struct CommentData {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct MemberCreator {
    #[serde(rename = "fullName", default)]
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedEntity {
    id: String,
}

/// Trello REST client implementing [`WorkItemPort`].
#[derive(Debug, Clone)]
pub struct TrelloBoard {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    token: String,
}

impl TrelloBoard {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.trello.com/1";

    pub fn new(api_key: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(api_key, token, Self::DEFAULT_BASE_URL)
    }

    /// Point the client at a different base URL (tests).
    pub fn with_base_url(
        api_key: impl Into<String>,
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            token: token.into(),
        })
    }

    fn auth(&self) -> [(&'static str, &str); 2] {
        [("key", self.api_key.as_str()), ("token", self.token.as_str())]
    }
}

#[async_trait]
impl WorkItemPort for TrelloBoard {
    async fn get_card(&self, card_id: &str) -> Result<Card> {
        let url = format!("{}/cards/{card_id}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&self.auth())
            .query(&[("fields", "id,name,desc,idList,idBoard")])
            .send()
            .await
            .with_context(|| format!("GET card {card_id}"))?
            .error_for_status()
            .with_context(|| format!("GET card {card_id}"))?;
        resp.json().await.context("decoding card")
    }

    async fn cards_on_list(&self, list_id: &str) -> Result<Vec<Card>> {
        let url = format!("{}/lists/{list_id}/cards", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&self.auth())
            .query(&[("fields", "id,name,desc,idList,idBoard")])
            .send()
            .await
            .with_context(|| format!("GET cards on list {list_id}"))?
            .error_for_status()
            .with_context(|| format!("GET cards on list {list_id}"))?;
        resp.json().await.context("decoding card list")
    }

    async fn attachments(&self, card_id: &str) -> Result<Vec<Attachment>> {
        let url = format!("{}/cards/{card_id}/attachments", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&self.auth())
            .query(&[("fields", "id,name,url,mimeType,bytes")])
            .send()
            .await
            .with_context(|| format!("GET attachments for {card_id}"))?
            .error_for_status()
            .with_context(|| format!("GET attachments for {card_id}"))?;
        resp.json().await.context("decoding attachments")
    }

    async fn add_comment(&self, card_id: &str, text: &str) -> Result<()> {
        let url = format!("{}/cards/{card_id}/actions/comments", self.base_url);
        self.client
            .post(&url)
            .query(&self.auth())
            .query(&[("text", text)])
            .send()
            .await
            .with_context(|| format!("POST comment on {card_id}"))?
            .error_for_status()
            .with_context(|| format!("POST comment on {card_id}"))?;
        Ok(())
    }

    async fn comments(&self, card_id: &str) -> Result<Vec<Comment>> {
        let url = format!("{}/cards/{card_id}/actions", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&self.auth())
            .query(&[("filter", "commentCard")])
            .send()
            .await
            .with_context(|| format!("GET comments on {card_id}"))?
            .error_for_status()
            .with_context(|| format!("GET comments on {card_id}"))?;
        let actions: Vec<CommentAction> = resp.json().await.context("decoding comments")?;
        Ok(actions.into_iter().map(comment_from_action).collect())
    }

    async fn move_card(&self, card_id: &str, list_id: &str) -> Result<()> {
        let url = format!("{}/cards/{card_id}", self.base_url);
        self.client
            .put(&url)
            .query(&self.auth())
            .query(&[("idList", list_id)])
            .send()
            .await
            .with_context(|| format!("PUT move card {card_id}"))?
            .error_for_status()
            .with_context(|| format!("PUT move card {card_id}"))?;
        Ok(())
    }

    async fn create_list(&self, board_id: &str, name: &str) -> Result<String> {
        let url = format!("{}/boards/{board_id}/lists", self.base_url);
        let resp = self
            .client
            .post(&url)
            .query(&self.auth())
            .query(&[("name", name)])
            .send()
            .await
            .with_context(|| format!("POST list on board {board_id}"))?
            .error_for_status()
            .with_context(|| format!("POST list on board {board_id}"))?;
        let created: CreatedEntity = resp.json().await.context("decoding created list")?;
        Ok(created.id)
    }

    async fn create_card(&self, list_id: &str, title: &str, body: &str) -> Result<String> {
        let url = format!("{}/cards", self.base_url);
        let resp = self
            .client
            .post(&url)
            .query(&self.auth())
            .query(&[("idList", list_id), ("name", title), ("desc", body)])
            .send()
            .await
            .with_context(|| format!("POST card on list {list_id}"))?
            .error_for_status()
            .with_context(|| format!("POST card on list {list_id}"))?;
        let created: CreatedEntity = resp.json().await.context("decoding created card")?;
        Ok(created.id)
    }
}

fn comment_from_action(action: CommentAction) -> Comment {
    Comment {
        id: action.id,
        text: action.data.text,
        author: action.member_creator.and_then(|m| m.full_name),
    }
}
