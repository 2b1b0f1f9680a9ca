use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use clipdm_core::config::{
    ClipdmConfig, DeliverySection, LedgerSection, LimitsSection, PathsSection, ToolsSection,
    TranscodeSection,
};
use clipdm_core::delivery::{
    DeliveredArtifact, DeliveryError, DeliveryGateway, DeliveryResult, Recipient,
};
use clipdm_core::ledger::{LedgerError, LedgerResult, UsageSink};
use clipdm_core::pipeline::{Pipeline, PipelineError, Request};
use clipdm_core::source::{MediaDescriptor, MediaSource, SourceResult};
use clipdm_core::transcode::{BitratePlan, SizeReducer, TranscodeReport, TranscodeResult};

struct ScriptedSource {
    title: String,
    duration_seconds: Option<f64>,
    payload_bytes: usize,
    probes: AtomicUsize,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    fn new(title: &str, duration_seconds: Option<f64>, payload_bytes: usize) -> Self {
        Self {
            title: title.to_string(),
            duration_seconds,
            payload_bytes,
            probes: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MediaSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn probe(&self, _url: &str) -> SourceResult<MediaDescriptor> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(MediaDescriptor {
            title: self.title.clone(),
            duration_seconds: self.duration_seconds,
        })
    }

    async fn fetch(&self, _url: &str, destination: &Path) -> SourceResult<u64> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(destination, vec![0u8; self.payload_bytes])
            .await
            .expect("scripted fetch writes");
        Ok(self.payload_bytes as u64)
    }
}

struct StubReducer {
    output_bytes: u64,
    calls: AtomicUsize,
}

impl StubReducer {
    fn new(output_bytes: u64) -> Self {
        Self {
            output_bytes,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SizeReducer for StubReducer {
    async fn shrink(
        &self,
        input: &Path,
        output: &Path,
        target_bytes: u64,
    ) -> TranscodeResult<TranscodeReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(input.exists(), "shrink input must exist");
        assert_ne!(input, output, "shrink must produce a distinct artifact");
        tokio::fs::write(output, vec![1u8; self.output_bytes as usize])
            .await
            .expect("stub reducer writes");
        Ok(TranscodeReport {
            output: output.to_path_buf(),
            plan: BitratePlan::compute(target_bytes, 60.0, 128, 100),
            duration_seconds: 60.0,
            duration_probed: true,
        })
    }
}

struct CollectingDelivery {
    out_dir: PathBuf,
    blocked: bool,
    delivered: Mutex<Vec<PathBuf>>,
}

impl CollectingDelivery {
    fn new(out_dir: PathBuf) -> Self {
        Self {
            out_dir,
            blocked: false,
            delivered: Mutex::new(Vec::new()),
        }
    }

    fn blocked(out_dir: PathBuf) -> Self {
        Self {
            blocked: true,
            ..Self::new(out_dir)
        }
    }
}

#[async_trait]
impl DeliveryGateway for CollectingDelivery {
    async fn deliver(
        &self,
        _recipient: &Recipient,
        file: &Path,
    ) -> DeliveryResult<DeliveredArtifact> {
        if self.blocked {
            return Err(DeliveryError::Blocked);
        }
        std::fs::create_dir_all(&self.out_dir).expect("delivery dir");
        let destination = self.out_dir.join(file.file_name().expect("delivery file name"));
        std::fs::copy(file, &destination).expect("delivery copy");
        self.delivered
            .lock()
            .unwrap()
            .push(destination.clone());
        Ok(DeliveredArtifact {
            reference: format!("file://{}", destination.display()),
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    fail: bool,
    appended: Mutex<Vec<(u64, String)>>,
}

#[async_trait]
impl UsageSink for RecordingSink {
    async fn append(&self, user_id: u64, username: &str) -> LedgerResult<()> {
        if self.fail {
            return Err(LedgerError::Conflict);
        }
        self.appended
            .lock()
            .unwrap()
            .push((user_id, username.to_string()));
        Ok(())
    }
}

fn test_config(base: &Path, max_file_bytes: u64) -> ClipdmConfig {
    ClipdmConfig {
        limits: LimitsSection {
            max_file_bytes,
            max_duration_seconds: 1500.0,
            cooldown_seconds: 120,
        },
        paths: PathsSection {
            work_dir: base.join("work").to_string_lossy().to_string(),
        },
        tools: ToolsSection {
            ytdlp_bin: "yt-dlp".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        },
        transcode: TranscodeSection {
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate_kbps: 128,
            min_video_bitrate_kbps: 100,
            fallback_duration_seconds: 60.0,
        },
        delivery: DeliverySection {
            filename_prefix: "Made with clipdm".to_string(),
        },
        ledger: LedgerSection {
            api_url: "https://api.github.com/repos/acme/logs/contents/logs.json".to_string(),
            branch: "main".to_string(),
            token_env: "CLIPDM_LEDGER_TOKEN".to_string(),
        },
    }
}

struct Harness {
    _base: TempDir,
    pipeline: Pipeline,
    source: Arc<ScriptedSource>,
    reducer: Arc<StubReducer>,
    sink: Arc<RecordingSink>,
    work_dir: PathBuf,
    out_dir: PathBuf,
}

fn build_harness(
    source: ScriptedSource,
    reducer: StubReducer,
    max_file_bytes: u64,
    blocked_delivery: bool,
) -> Harness {
    let base = TempDir::new().unwrap();
    let config = test_config(base.path(), max_file_bytes);
    let work_dir = PathBuf::from(&config.paths.work_dir);
    let out_dir = base.path().join("delivered");

    let source = Arc::new(source);
    let reducer = Arc::new(reducer);
    let sink = Arc::new(RecordingSink::default());
    let delivery = if blocked_delivery {
        Arc::new(CollectingDelivery::blocked(out_dir.clone()))
    } else {
        Arc::new(CollectingDelivery::new(out_dir.clone()))
    };

    let pipeline = Pipeline::new(&config, source.clone(), reducer.clone(), delivery)
        .with_usage_sink(sink.clone());

    Harness {
        _base: base,
        pipeline,
        source,
        reducer,
        sink,
        work_dir,
        out_dir,
    }
}

fn requester(user_id: u64) -> Recipient {
    Recipient {
        user_id,
        username: format!("tester-{user_id}"),
    }
}

fn assert_no_working_files(work_dir: &Path) {
    if work_dir.exists() {
        let leftovers: Vec<_> = std::fs::read_dir(work_dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert!(leftovers.is_empty(), "working files left behind: {leftovers:?}");
    }
}

const GOOD_URL: &str = "https://www.youtube.com/watch?v=abc123";

#[tokio::test]
async fn under_budget_download_is_renamed_not_reencoded() {
    let harness = build_harness(
        ScriptedSource::new("Short Clip", Some(600.0), 512),
        StubReducer::new(256),
        1024,
        false,
    );

    let receipt = harness
        .pipeline
        .handle(Request::new(requester(1), GOOD_URL))
        .await
        .unwrap();

    assert!(!receipt.transcoded);
    assert_eq!(receipt.raw_bytes, 512);
    assert_eq!(receipt.delivered_bytes, 512);
    assert_eq!(harness.reducer.calls.load(Ordering::SeqCst), 0);
    assert!(harness.out_dir.join("Made with clipdm 'Short Clip'.mp4").exists());
    assert_no_working_files(&harness.work_dir);
}

#[tokio::test]
async fn over_budget_download_is_reencoded() {
    let harness = build_harness(
        ScriptedSource::new("Long Clip", Some(1200.0), 4096),
        StubReducer::new(900),
        1024,
        false,
    );

    let receipt = harness
        .pipeline
        .handle(Request::new(requester(1), GOOD_URL))
        .await
        .unwrap();

    assert!(receipt.transcoded);
    assert_eq!(receipt.raw_bytes, 4096);
    assert_eq!(receipt.delivered_bytes, 900);
    assert_eq!(harness.reducer.calls.load(Ordering::SeqCst), 1);
    assert!(harness.out_dir.join("Made with clipdm 'Long Clip'.mp4").exists());
    assert_no_working_files(&harness.work_dir);
}

#[tokio::test]
async fn delivery_filename_uses_sanitized_title() {
    let harness = build_harness(
        ScriptedSource::new("AC/DC - Thunderstruck", Some(300.0), 512),
        StubReducer::new(256),
        1024,
        false,
    );

    let receipt = harness
        .pipeline
        .handle(Request::new(requester(1), GOOD_URL))
        .await
        .unwrap();

    assert_eq!(receipt.title, "AC_DC - Thunderstruck");
    assert!(harness
        .out_dir
        .join("Made with clipdm 'AC_DC - Thunderstruck'.mp4")
        .exists());
}

#[tokio::test]
async fn invalid_url_never_reaches_the_source() {
    let harness = build_harness(
        ScriptedSource::new("Clip", Some(60.0), 512),
        StubReducer::new(256),
        1024,
        false,
    );

    let err = harness
        .pipeline
        .handle(Request::new(requester(1), "https://vimeo.com/12345"))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::InvalidSource));
    assert_eq!(harness.source.probes.load(Ordering::SeqCst), 0);
    assert_eq!(harness.source.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn over_length_video_is_rejected_before_download() {
    let harness = build_harness(
        ScriptedSource::new("Feature Film", Some(2000.0), 512),
        StubReducer::new(256),
        1024,
        false,
    );

    let err = harness
        .pipeline
        .handle(Request::new(requester(1), GOOD_URL))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::TooLong { .. }));
    assert_eq!(harness.source.probes.load(Ordering::SeqCst), 1);
    assert_eq!(harness.source.fetches.load(Ordering::SeqCst), 0);
    assert_no_working_files(&harness.work_dir);
}

#[tokio::test]
async fn second_request_within_cooldown_is_rejected() {
    let harness = build_harness(
        ScriptedSource::new("Clip", Some(60.0), 512),
        StubReducer::new(256),
        1024,
        false,
    );

    harness
        .pipeline
        .handle(Request::new(requester(1), GOOD_URL))
        .await
        .unwrap();
    let err = harness
        .pipeline
        .handle(Request::new(requester(1), GOOD_URL))
        .await
        .unwrap_err();

    match err {
        PipelineError::RateLimited { retry_after } => {
            assert!(retry_after.as_secs() <= 120);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    // The rejected request never touched the source.
    assert_eq!(harness.source.fetches.load(Ordering::SeqCst), 1);

    // Another user's bucket is unaffected.
    harness
        .pipeline
        .handle(Request::new(requester(2), GOOD_URL))
        .await
        .unwrap();
}

#[tokio::test]
async fn blocked_delivery_reports_and_cleans_up() {
    let harness = build_harness(
        ScriptedSource::new("Clip", Some(60.0), 512),
        StubReducer::new(256),
        1024,
        true,
    );

    let err = harness
        .pipeline
        .handle(Request::new(requester(1), GOOD_URL))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::DeliveryBlocked));
    assert!(err.user_message().contains("DM"));
    assert_no_working_files(&harness.work_dir);
    // Usage is only recorded for delivered videos.
    assert!(harness.sink.appended.lock().unwrap().is_empty());
}

#[tokio::test]
async fn ledger_failure_does_not_fail_the_request() {
    let harness = build_harness(
        ScriptedSource::new("Clip", Some(60.0), 512),
        StubReducer::new(256),
        1024,
        false,
    );
    // Rebuild with a failing sink.
    let base = TempDir::new().unwrap();
    let config = test_config(base.path(), 1024);
    let failing = Arc::new(RecordingSink {
        fail: true,
        appended: Mutex::new(Vec::new()),
    });
    let pipeline = Pipeline::new(
        &config,
        harness.source.clone(),
        harness.reducer.clone(),
        Arc::new(CollectingDelivery::new(base.path().join("delivered"))),
    )
    .with_usage_sink(failing.clone());

    let receipt = pipeline
        .handle(Request::new(requester(9), GOOD_URL))
        .await
        .unwrap();
    assert!(!receipt.transcoded);
    assert!(failing.appended.lock().unwrap().is_empty());
}

#[tokio::test]
async fn successful_delivery_records_usage() {
    let harness = build_harness(
        ScriptedSource::new("Clip", Some(60.0), 512),
        StubReducer::new(256),
        1024,
        false,
    );

    harness
        .pipeline
        .handle(Request::new(requester(42), GOOD_URL))
        .await
        .unwrap();

    let appended = harness.sink.appended.lock().unwrap();
    assert_eq!(appended.as_slice(), &[(42, "tester-42".to_string())]);
}

#[tokio::test]
async fn missing_duration_is_not_rejected() {
    // A probe without duration cannot be length-checked; the download decides.
    let harness = build_harness(
        ScriptedSource::new("Mystery", None, 512),
        StubReducer::new(256),
        1024,
        false,
    );

    let receipt = harness
        .pipeline
        .handle(Request::new(requester(1), GOOD_URL))
        .await
        .unwrap();
    assert!(!receipt.transcoded);
}
