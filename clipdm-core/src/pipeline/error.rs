use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::delivery::DeliveryError;
use crate::source::SourceError;
use crate::transcode::TranscodeError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("url does not match a supported source platform")]
    InvalidSource,
    #[error("rate limited, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("video duration {duration_seconds:.0}s exceeds the {max_seconds:.0}s limit")]
    TooLong {
        duration_seconds: f64,
        max_seconds: f64,
    },
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("transcode failed: {0}")]
    Transcode(String),
    #[error("recipient's direct messages are closed")]
    DeliveryBlocked,
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Actionable message for the requester. Ledger failures never reach here;
    /// they are logged for operators only.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::InvalidSource => {
                "The URL must be a valid YouTube link.".to_string()
            }
            PipelineError::RateLimited { retry_after } => format!(
                "Please wait {} seconds before requesting another video.",
                retry_after.as_secs()
            ),
            PipelineError::TooLong { max_seconds, .. } => format!(
                "Video is too long! Max length allowed is {} minutes.",
                (max_seconds / 60.0).round() as u64
            ),
            PipelineError::DeliveryBlocked => {
                "I can't DM you. Please enable direct messages from server members and try again."
                    .to_string()
            }
            _ => "Something went wrong while processing your video.".to_string(),
        }
    }
}

impl From<SourceError> for PipelineError {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::Unavailable(msg) | SourceError::Extraction(msg) => {
                PipelineError::SourceUnavailable(msg)
            }
            SourceError::Download(msg) => PipelineError::Download(msg),
            SourceError::Spawn { tool, source } => {
                PipelineError::Internal(format!("failed to run {tool}: {source}"))
            }
        }
    }
}

impl From<TranscodeError> for PipelineError {
    fn from(error: TranscodeError) -> Self {
        PipelineError::Transcode(error.to_string())
    }
}

impl From<DeliveryError> for PipelineError {
    fn from(error: DeliveryError) -> Self {
        match error {
            DeliveryError::Blocked => PipelineError::DeliveryBlocked,
            DeliveryError::Other(msg) => PipelineError::Internal(msg),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
