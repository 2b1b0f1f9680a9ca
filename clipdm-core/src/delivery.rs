use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The recipient's direct messages are closed to the sender. Reported to
    /// the requester with guidance, distinct from internal failures.
    #[error("recipient does not accept direct messages")]
    Blocked,
    #[error("delivery failed: {0}")]
    Other(String),
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Who asked for the video and receives the direct message.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub user_id: u64,
    pub username: String,
}

/// Reference to the delivered artifact, e.g. a CDN link the recipient can copy.
#[derive(Debug, Clone)]
pub struct DeliveredArtifact {
    pub reference: String,
}

/// Direct-message delivery collaborator. The chat-SDK implementation lives
/// outside this crate; tests and the CLI use [`FilesystemDelivery`].
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    async fn deliver(&self, recipient: &Recipient, file: &Path)
        -> DeliveryResult<DeliveredArtifact>;
}

/// Delivery gateway that drops the file into a local directory. Useful for
/// operating the pipeline from the command line and for tests.
#[derive(Debug, Clone)]
pub struct FilesystemDelivery {
    out_dir: PathBuf,
}

impl FilesystemDelivery {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

#[async_trait]
impl DeliveryGateway for FilesystemDelivery {
    async fn deliver(
        &self,
        _recipient: &Recipient,
        file: &Path,
    ) -> DeliveryResult<DeliveredArtifact> {
        let name = file
            .file_name()
            .ok_or_else(|| DeliveryError::Other("delivery file has no name".to_string()))?;
        tokio::fs::create_dir_all(&self.out_dir)
            .await
            .map_err(|err| DeliveryError::Other(err.to_string()))?;
        let destination = self.out_dir.join(name);
        tokio::fs::copy(file, &destination)
            .await
            .map_err(|err| DeliveryError::Other(err.to_string()))?;
        Ok(DeliveredArtifact {
            reference: format!("file://{}", destination.display()),
        })
    }
}
