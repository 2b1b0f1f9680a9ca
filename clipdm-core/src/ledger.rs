use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::LedgerSection;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger store returned {0}")]
    Unavailable(StatusCode),
    #[error("ledger write rejected: version token stale")]
    Conflict,
    #[error("ledger network error: {0}")]
    Network(String),
    #[error("ledger payload encoding: {0}")]
    Encoding(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(error: reqwest::Error) -> Self {
        LedgerError::Network(error.to_string())
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// One line of the append-only usage log. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub user_id: u64,
    pub username: String,
}

impl UsageRecord {
    pub fn new(user_id: u64, username: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            user_id,
            username: username.into(),
        }
    }
}

/// Where usage records end up. The pipeline treats append failures as
/// non-fatal; implementations must not block the user-facing flow on retries.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn append(&self, user_id: u64, username: &str) -> LedgerResult<()>;
}

/// Decode a base64 JSON-array document into records. Any corruption, in the
/// transport encoding or the JSON itself, yields an empty log so the next
/// append heals the document instead of failing.
pub fn decode_document(content: &str) -> Vec<UsageRecord> {
    let stripped: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = match STANDARD.decode(stripped) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "usage log content is not valid base64, starting over");
            return Vec::new();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(records) => records,
        Err(err) => {
            warn!(error = %err, "usage log content is not a valid record array, starting over");
            Vec::new()
        }
    }
}

pub fn encode_document(records: &[UsageRecord]) -> LedgerResult<String> {
    let json = serde_json::to_vec_pretty(records)
        .map_err(|err| LedgerError::Encoding(err.to_string()))?;
    Ok(STANDARD.encode(json))
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    content: String,
    sha: String,
    #[serde(default)]
    encoding: String,
}

#[derive(Debug, Serialize)]
struct ContentsUpdate<'a> {
    message: String,
    content: String,
    sha: &'a str,
    branch: &'a str,
}

/// Append-only usage log stored as a JSON document behind a GitHub-style
/// contents API, updated with read-modify-write optimistic concurrency.
#[derive(Debug, Clone)]
pub struct GithubLedger {
    http: Client,
    api_url: String,
    branch: String,
    token: String,
}

impl GithubLedger {
    pub fn new(section: &LedgerSection, token: impl Into<String>) -> LedgerResult<Self> {
        let http = Client::builder()
            .user_agent("clipdm/0.1")
            .build()
            .map_err(|err| LedgerError::Network(err.to_string()))?;
        Ok(Self {
            http,
            api_url: section.api_url.clone(),
            branch: section.branch.clone(),
            token: token.into(),
        })
    }

    /// Current document plus the version token required to write it back.
    pub async fn fetch_document(&self) -> LedgerResult<(Vec<UsageRecord>, String)> {
        let response = self
            .http
            .get(&self.api_url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github.v3+json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(LedgerError::Unavailable(response.status()));
        }
        let payload: ContentsResponse = response.json().await?;
        if payload.encoding != "base64" {
            return Err(LedgerError::Encoding(format!(
                "unexpected document encoding {:?}",
                payload.encoding
            )));
        }
        Ok((decode_document(&payload.content), payload.sha))
    }
}

#[async_trait]
impl UsageSink for GithubLedger {
    async fn append(&self, user_id: u64, username: &str) -> LedgerResult<()> {
        let (mut records, sha) = self.fetch_document().await?;
        records.push(UsageRecord::new(user_id, username));

        let update = ContentsUpdate {
            message: format!("Log usage by {username} ({user_id})"),
            content: encode_document(&records)?,
            sha: &sha,
            branch: &self.branch,
        };
        let response = self
            .http
            .put(&self.api_url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github.v3+json")
            .json(&update)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            // A racing writer advanced the sha between our GET and PUT.
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => Err(LedgerError::Conflict),
            status => Err(LedgerError::Unavailable(status)),
        }
    }
}
