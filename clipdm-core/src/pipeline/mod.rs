mod error;
mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ClipdmConfig;
use crate::cooldown::CooldownMap;
use crate::delivery::DeliveryGateway;
use crate::ledger::UsageSink;
use crate::source::{self, MediaDescriptor, MediaSource};
use crate::transcode::SizeReducer;

pub use error::{PipelineError, PipelineResult};
pub use types::{DeliveryReceipt, Request, Workspace};

/// End-to-end flow for one `/video` request: validate, rate-limit, probe,
/// fetch, fit the byte budget, deliver, log usage, clean up.
///
/// One instance serves all requests; per-request state lives in [`Request`]
/// and [`Workspace`]. The cooldown map is the only state shared between
/// concurrent requests from the same user.
pub struct Pipeline {
    media_source: Arc<dyn MediaSource>,
    reducer: Arc<dyn SizeReducer>,
    delivery: Arc<dyn DeliveryGateway>,
    usage_sink: Option<Arc<dyn UsageSink>>,
    cooldown: CooldownMap,
    max_file_bytes: u64,
    max_duration_seconds: f64,
    filename_prefix: String,
    work_dir: PathBuf,
}

impl Pipeline {
    pub fn new(
        config: &ClipdmConfig,
        media_source: Arc<dyn MediaSource>,
        reducer: Arc<dyn SizeReducer>,
        delivery: Arc<dyn DeliveryGateway>,
    ) -> Self {
        Self {
            media_source,
            reducer,
            delivery,
            usage_sink: None,
            cooldown: CooldownMap::new(Duration::from_secs(config.limits.cooldown_seconds)),
            max_file_bytes: config.limits.max_file_bytes,
            max_duration_seconds: config.limits.max_duration_seconds,
            filename_prefix: config.delivery.filename_prefix.clone(),
            work_dir: PathBuf::from(&config.paths.work_dir),
        }
    }

    /// Usage logging is optional wiring; without a sink the pipeline skips the
    /// ledger step entirely.
    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    pub async fn handle(&self, request: Request) -> PipelineResult<DeliveryReceipt> {
        // Shape check precedes all network and process activity.
        if !source::is_supported_url(&request.url) {
            return Err(PipelineError::InvalidSource);
        }

        self.cooldown
            .try_acquire(request.recipient.user_id)
            .map_err(|retry_after| PipelineError::RateLimited { retry_after })?;

        let descriptor = self.media_source.probe(&request.url).await?;
        if let Some(duration) = descriptor.duration_seconds {
            if duration > self.max_duration_seconds {
                return Err(PipelineError::TooLong {
                    duration_seconds: duration,
                    max_seconds: self.max_duration_seconds,
                });
            }
        }

        let request_id = Uuid::new_v4();
        let workspace = Workspace::create(&self.work_dir, request_id).await?;
        // Everything from fetch through ledger runs under the workspace guard;
        // cleanup happens on every exit path before the outcome propagates.
        let outcome = self
            .run_acquired(&request, &descriptor, request_id, &workspace)
            .await;
        workspace.cleanup().await;
        outcome
    }

    async fn run_acquired(
        &self,
        request: &Request,
        descriptor: &MediaDescriptor,
        request_id: Uuid,
        workspace: &Workspace,
    ) -> PipelineResult<DeliveryReceipt> {
        let raw_path = workspace.file(&format!("raw_{}.mp4", request_id.simple()));
        let raw_bytes = self.media_source.fetch(&request.url, &raw_path).await?;

        let title = source::sanitize_title(&descriptor.title);
        let final_path =
            workspace.file(&format!("{} '{}'.mp4", self.filename_prefix, title));

        let transcoded = if raw_bytes > self.max_file_bytes {
            info!(
                request_id = %request_id,
                raw_bytes,
                budget = self.max_file_bytes,
                "download exceeds byte budget, re-encoding"
            );
            self.reducer
                .shrink(&raw_path, &final_path, self.max_file_bytes)
                .await?;
            true
        } else {
            fs::rename(&raw_path, &final_path)
                .await
                .map_err(|source| PipelineError::Io {
                    path: final_path.clone(),
                    source,
                })?;
            false
        };

        let delivered_bytes = fs::metadata(&final_path)
            .await
            .map_err(|source| PipelineError::Io {
                path: final_path.clone(),
                source,
            })?
            .len();

        let artifact = self
            .delivery
            .deliver(&request.recipient, &final_path)
            .await?;

        // Best effort only: ledger trouble is an operator concern, never a
        // user-facing failure.
        if let Some(sink) = &self.usage_sink {
            if let Err(err) = sink
                .append(request.recipient.user_id, &request.recipient.username)
                .await
            {
                warn!(
                    user_id = request.recipient.user_id,
                    error = %err,
                    "usage ledger append failed"
                );
            }
        }

        info!(
            request_id = %request_id,
            user_id = request.recipient.user_id,
            transcoded,
            delivered_bytes,
            "video delivered"
        );

        Ok(DeliveryReceipt {
            request_id,
            title,
            reference: artifact.reference,
            raw_bytes,
            delivered_bytes,
            transcoded,
            completed_at: chrono::Utc::now(),
        })
    }
}
