use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use crate::delivery::Recipient;

use super::error::{PipelineError, PipelineResult};

/// One incoming command invocation. Owned by the pipeline for its lifetime.
#[derive(Debug, Clone)]
pub struct Request {
    pub recipient: Recipient,
    pub url: String,
    pub received_at: DateTime<Utc>,
}

impl Request {
    pub fn new(recipient: Recipient, url: impl Into<String>) -> Self {
        Self {
            recipient,
            url: url.into(),
            received_at: Utc::now(),
        }
    }
}

/// Per-request working directory. Named by the request id, never by media
/// title, so concurrent requests for similarly titled videos cannot collide.
///
/// Every file created under it must be gone before the pipeline returns;
/// `cleanup` is called on every exit path and `Drop` backstops panics.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub async fn create(parent: &Path, request_id: Uuid) -> PipelineResult<Self> {
        let root = parent.join(format!("req_{}", request_id.simple()));
        fs::create_dir_all(&root)
            .await
            .map_err(|source| PipelineError::Io {
                path: root.clone(),
                source,
            })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Remove the directory and everything in it. Idempotent; failures are
    /// logged and swallowed so they never mask the request outcome.
    pub async fn cleanup(&self) {
        if let Err(err) = fs::remove_dir_all(&self.root).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.root.display(), error = %err, "failed to clean working directory");
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Successful outcome handed back to the chat glue.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub request_id: Uuid,
    pub title: String,
    /// Reference to the delivered artifact, as reported by the gateway.
    pub reference: String,
    pub raw_bytes: u64,
    pub delivered_bytes: u64,
    pub transcoded: bool,
    pub completed_at: DateTime<Utc>,
}
