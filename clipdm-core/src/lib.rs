pub mod config;
pub mod cooldown;
pub mod delivery;
pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod source;
pub mod transcode;

pub use config::{load_clipdm_config, ClipdmConfig};
pub use cooldown::CooldownMap;
pub use delivery::{
    DeliveredArtifact, DeliveryError, DeliveryGateway, FilesystemDelivery, Recipient,
};
pub use error::{ConfigError, Result};
pub use ledger::{GithubLedger, LedgerError, UsageRecord, UsageSink};
pub use pipeline::{DeliveryReceipt, Pipeline, PipelineError, PipelineResult, Request};
pub use source::{MediaDescriptor, MediaSource, SourceError, YtDlpSource};
pub use transcode::{BitratePlan, SizeReducer, TranscodeError, TranscodeReport, Transcoder};
