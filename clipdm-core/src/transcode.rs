use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{ToolsSection, TranscodeSection};

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
    #[error("encode pass {pass} exited with {status}: {stderr}")]
    Encoder {
        pass: u8,
        status: ExitStatus,
        stderr: String,
    },
    #[error("encoder produced no usable output at {0}")]
    EmptyOutput(PathBuf),
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;

/// Bitrate allocation for a size-targeted encode. Computed once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitratePlan {
    pub video_kbps: u32,
    pub audio_kbps: u32,
}

impl BitratePlan {
    /// Split the byte budget over the clip duration, reserving a fixed audio
    /// bitrate and flooring the video bitrate to avoid degenerate encodes.
    pub fn compute(
        target_bytes: u64,
        duration_seconds: f64,
        audio_kbps: u32,
        min_video_kbps: u32,
    ) -> Self {
        let total_kbps = (target_bytes as f64 * 8.0 / duration_seconds) / 1000.0;
        let video = total_kbps - audio_kbps as f64;
        let video_kbps = if video < min_video_kbps as f64 {
            min_video_kbps
        } else {
            video as u32
        };
        Self {
            video_kbps,
            audio_kbps,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscodeReport {
    pub output: PathBuf,
    pub plan: BitratePlan,
    pub duration_seconds: f64,
    /// False when the duration probe failed and the fallback was used; the
    /// result may then overshoot the budget.
    pub duration_probed: bool,
}

/// Shrinks a media file under a byte budget. The pipeline depends on this
/// seam rather than on ffmpeg directly.
#[async_trait]
pub trait SizeReducer: Send + Sync {
    async fn shrink(
        &self,
        input: &Path,
        output: &Path,
        target_bytes: u64,
    ) -> TranscodeResult<TranscodeReport>;
}

/// Two-pass constant-bitrate-target encoder over the ffmpeg/ffprobe binaries.
#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    section: TranscodeSection,
}

impl Transcoder {
    pub fn new(tools: &ToolsSection, section: TranscodeSection) -> Self {
        Self {
            ffmpeg_bin: tools.ffmpeg_bin.clone(),
            ffprobe_bin: tools.ffprobe_bin.clone(),
            section,
        }
    }

    /// Lightweight duration probe. Any failure yields `None`; the caller falls
    /// back to a default rather than aborting.
    async fn probe_duration(&self, input: &Path) -> Option<f64> {
        let output = Command::new(&self.ffprobe_bin)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(input)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_duration(&String::from_utf8_lossy(&output.stdout))
    }

    async fn run_pass(
        &self,
        pass: u8,
        input: &Path,
        plan: &BitratePlan,
        passlog: &Path,
        sink: &Path,
    ) -> TranscodeResult<()> {
        let mut command = Command::new(&self.ffmpeg_bin);
        command
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args(["-c:v", &self.section.video_codec])
            .args(["-b:v", &format!("{}k", plan.video_kbps)])
            .args(["-pass", &pass.to_string()])
            .arg("-passlogfile")
            .arg(passlog);
        if pass == 1 {
            // Analysis only: no audio, stats to the passlog, output discarded.
            command.args(["-an", "-f", "mp4"]);
        } else {
            command
                .args(["-c:a", &self.section.audio_codec])
                .args(["-b:a", &format!("{}k", plan.audio_kbps)]);
        }
        command.arg(sink);

        let output = command
            .output()
            .await
            .map_err(|source| TranscodeError::Spawn {
                tool: self.ffmpeg_bin.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(TranscodeError::Encoder {
                pass,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .chars()
                    .take(500)
                    .collect(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SizeReducer for Transcoder {
    async fn shrink(
        &self,
        input: &Path,
        output: &Path,
        target_bytes: u64,
    ) -> TranscodeResult<TranscodeReport> {
        let probed = self.probe_duration(input).await;
        if probed.is_none() {
            warn!(
                input = %input.display(),
                fallback = self.section.fallback_duration_seconds,
                "duration probe failed, using fallback duration; output may overshoot the budget"
            );
        }
        let duration = probed.unwrap_or(self.section.fallback_duration_seconds);
        let plan = BitratePlan::compute(
            target_bytes,
            duration,
            self.section.audio_bitrate_kbps,
            self.section.min_video_bitrate_kbps,
        );
        debug!(
            video_kbps = plan.video_kbps,
            audio_kbps = plan.audio_kbps,
            duration,
            "starting two-pass encode"
        );

        // Passlog name is request-unique so concurrent encodes sharing a
        // working directory cannot clobber each other's stats.
        let log_dir = output
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let passlog = log_dir.join(format!("ffmpeg2pass_{}", Uuid::new_v4().simple()));

        let result = async {
            self.run_pass(1, input, &plan, &passlog, Path::new(null_sink()))
                .await?;
            self.run_pass(2, input, &plan, &passlog, output).await
        }
        .await;
        remove_passlog(&passlog).await;
        result?;

        match tokio::fs::metadata(output).await {
            Ok(metadata) if metadata.len() > 0 => Ok(TranscodeReport {
                output: output.to_path_buf(),
                plan,
                duration_seconds: duration,
                duration_probed: probed.is_some(),
            }),
            _ => Err(TranscodeError::EmptyOutput(output.to_path_buf())),
        }
    }
}

fn null_sink() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}

fn parse_duration(raw: &str) -> Option<f64> {
    let duration: f64 = raw.trim().parse().ok()?;
    if duration.is_finite() && duration > 0.0 {
        Some(duration)
    } else {
        None
    }
}

/// Delete pass-1 analysis artifacts. Absent files are not an error; this may
/// run after a failed encode that never wrote them.
async fn remove_passlog(passlog: &Path) {
    for suffix in [".log", ".log.mbtree"] {
        let mut name = passlog.as_os_str().to_os_string();
        name.push(suffix);
        let path = PathBuf::from(name);
        if let Err(err) = tokio::fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to remove passlog artifact");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_matches_reference_arithmetic() {
        // 8 MiB over 30s: (8*1024*1024*8/30)/1000 - 128 = 2236.96 - 128 ≈ 2108.
        let plan = BitratePlan::compute(8 * 1024 * 1024, 30.0, 128, 100);
        assert_eq!(plan.audio_kbps, 128);
        assert_eq!(plan.video_kbps, 2108);
    }

    #[test]
    fn plan_floors_degenerate_bitrates() {
        // 8 MiB over five minutes leaves ~96 kbps for video after the audio
        // reservation, which the floor lifts back to 100.
        let plan = BitratePlan::compute(8 * 1024 * 1024, 300.0, 128, 100);
        assert_eq!(plan.video_kbps, 100);

        // A tiny budget over an hour would go negative without the floor.
        let plan = BitratePlan::compute(1024, 3600.0, 128, 100);
        assert_eq!(plan.video_kbps, 100);
    }

    #[test]
    fn plan_keeps_bitrates_above_floor_for_short_clips() {
        let plan = BitratePlan::compute(8 * 1024 * 1024, 10.0, 128, 100);
        assert!(plan.video_kbps > 1000);
    }

    #[test]
    fn duration_parse_accepts_ffprobe_output() {
        assert_eq!(parse_duration("300.512000\n"), Some(300.512));
        assert_eq!(parse_duration("  42  "), Some(42.0));
    }

    #[test]
    fn duration_parse_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("N/A"), None);
        assert_eq!(parse_duration("-3"), None);
        assert_eq!(parse_duration("inf"), None);
    }

    #[tokio::test]
    async fn passlog_removal_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let passlog = dir.path().join("ffmpeg2pass_test");
        std::fs::write(dir.path().join("ffmpeg2pass_test.log"), b"stats").unwrap();
        std::fs::write(dir.path().join("ffmpeg2pass_test.log.mbtree"), b"tree").unwrap();

        remove_passlog(&passlog).await;
        assert!(!dir.path().join("ffmpeg2pass_test.log").exists());
        assert!(!dir.path().join("ffmpeg2pass_test.log.mbtree").exists());

        // Second removal of already-absent artifacts is a no-op.
        remove_passlog(&passlog).await;
    }
}
