use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;

use clipdm_core::delivery::{FilesystemDelivery, Recipient};
use clipdm_core::ledger::{GithubLedger, UsageRecord};
use clipdm_core::pipeline::{DeliveryReceipt, Pipeline, Request};
use clipdm_core::source::{MediaDescriptor, MediaSource, YtDlpSource};
use clipdm_core::transcode::{SizeReducer, TranscodeReport, Transcoder};
use clipdm_core::{load_clipdm_config, ClipdmConfig};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] clipdm_core::ConfigError),
    #[error("{0}")]
    Pipeline(#[from] clipdm_core::PipelineError),
    #[error("source error: {0}")]
    Source(#[from] clipdm_core::SourceError),
    #[error("transcode error: {0}")]
    Transcode(#[from] clipdm_core::TranscodeError),
    #[error("ledger error: {0}")]
    Ledger(#[from] clipdm_core::LedgerError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "clipdm command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main clipdm.toml
    #[arg(long, default_value = "configs/clipdm.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Probe a source URL for metadata without downloading
    Probe(ProbeArgs),
    /// Run the full request pipeline, delivering into a local directory
    Run(RunArgs),
    /// Re-encode a local file to fit a byte budget
    Transcode(TranscodeArgs),
    /// Usage-ledger operations
    #[command(subcommand)]
    Ledger(LedgerCommands),
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    pub url: String,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    pub url: String,
    /// Requester id used for rate limiting and the usage ledger
    #[arg(long, default_value_t = 0)]
    pub user_id: u64,
    /// Requester display name recorded in the usage ledger
    #[arg(long, default_value = "operator")]
    pub username: String,
    /// Directory receiving the delivered file
    #[arg(long, default_value = "delivered")]
    pub out_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct TranscodeArgs {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Byte budget for the output file
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    pub target_bytes: u64,
}

#[derive(Subcommand, Debug)]
pub enum LedgerCommands {
    /// Fetch and print the usage log
    Show,
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_clipdm_config(&cli.config)?;

    match &cli.command {
        Commands::Probe(args) => {
            let source = YtDlpSource::new(config.tools.ytdlp_bin.clone());
            let descriptor = source.probe(&args.url).await?;
            render(&ProbeReport::new(&args.url, descriptor), cli.format)?;
        }
        Commands::Run(args) => {
            let receipt = run_pipeline(&config, args).await?;
            render(&RunReport::from(receipt), cli.format)?;
        }
        Commands::Transcode(args) => {
            let transcoder = Transcoder::new(&config.tools, config.transcode.clone());
            let report = transcoder
                .shrink(&args.input, &args.output, args.target_bytes)
                .await?;
            render(&TranscodeView::from(report), cli.format)?;
        }
        Commands::Ledger(LedgerCommands::Show) => {
            let token = config.ledger.token()?;
            let ledger = GithubLedger::new(&config.ledger, token)?;
            let (records, sha) = ledger.fetch_document().await?;
            render(&LedgerView { sha, records }, cli.format)?;
        }
    }

    Ok(())
}

async fn run_pipeline(config: &ClipdmConfig, args: &RunArgs) -> Result<DeliveryReceipt> {
    let source = Arc::new(YtDlpSource::new(config.tools.ytdlp_bin.clone()));
    let reducer = Arc::new(Transcoder::new(&config.tools, config.transcode.clone()));
    let delivery = Arc::new(FilesystemDelivery::new(&args.out_dir));

    let mut pipeline = Pipeline::new(config, source, reducer, delivery);
    match config.ledger.token() {
        Ok(token) => {
            pipeline = pipeline.with_usage_sink(Arc::new(GithubLedger::new(&config.ledger, token)?));
        }
        Err(err) => {
            eprintln!("warning: {err}; usage logging disabled");
        }
    }

    let recipient = Recipient {
        user_id: args.user_id,
        username: args.username.clone(),
    };
    match pipeline.handle(Request::new(recipient, args.url.clone())).await {
        Ok(receipt) => Ok(receipt),
        Err(err) => {
            eprintln!("{}", err.user_message());
            Err(err.into())
        }
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub url: String,
    pub title: String,
    pub duration_seconds: Option<f64>,
}

impl ProbeReport {
    fn new(url: &str, descriptor: MediaDescriptor) -> Self {
        Self {
            url: url.to_string(),
            title: descriptor.title,
            duration_seconds: descriptor.duration_seconds,
        }
    }
}

impl DisplayFallback for ProbeReport {
    fn display(&self) -> String {
        let duration = self
            .duration_seconds
            .map(|d| format!("{d:.0}s"))
            .unwrap_or_else(|| "unknown".to_string());
        format!("{} | duration={}", self.title, duration)
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub request_id: String,
    pub title: String,
    pub reference: String,
    pub raw_bytes: u64,
    pub delivered_bytes: u64,
    pub transcoded: bool,
}

impl From<DeliveryReceipt> for RunReport {
    fn from(receipt: DeliveryReceipt) -> Self {
        Self {
            request_id: receipt.request_id.to_string(),
            title: receipt.title,
            reference: receipt.reference,
            raw_bytes: receipt.raw_bytes,
            delivered_bytes: receipt.delivered_bytes,
            transcoded: receipt.transcoded,
        }
    }
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let how = if self.transcoded { "re-encoded" } else { "passthrough" };
        format!(
            "delivered '{}' ({} bytes, {how})\n{}",
            self.title, self.delivered_bytes, self.reference
        )
    }
}

#[derive(Debug, Serialize)]
pub struct TranscodeView {
    pub output: String,
    pub video_kbps: u32,
    pub audio_kbps: u32,
    pub duration_seconds: f64,
    pub duration_probed: bool,
}

impl From<TranscodeReport> for TranscodeView {
    fn from(report: TranscodeReport) -> Self {
        Self {
            output: report.output.display().to_string(),
            video_kbps: report.plan.video_kbps,
            audio_kbps: report.plan.audio_kbps,
            duration_seconds: report.duration_seconds,
            duration_probed: report.duration_probed,
        }
    }
}

impl DisplayFallback for TranscodeView {
    fn display(&self) -> String {
        format!(
            "{} | video={}k audio={}k over {:.1}s{}",
            self.output,
            self.video_kbps,
            self.audio_kbps,
            self.duration_seconds,
            if self.duration_probed {
                ""
            } else {
                " (fallback duration)"
            }
        )
    }
}

#[derive(Debug, Serialize)]
pub struct LedgerView {
    pub sha: String,
    pub records: Vec<UsageRecord>,
}

impl DisplayFallback for LedgerView {
    fn display(&self) -> String {
        if self.records.is_empty() {
            return format!("usage log empty (sha {})", self.sha);
        }
        let mut lines = vec![format!("{} records (sha {})", self.records.len(), self.sha)];
        for record in &self.records {
            lines.push(format!(
                "{} | {} ({})",
                record.timestamp.to_rfc3339(),
                record.username,
                record.user_id
            ));
        }
        lines.join("\n")
    }
}
