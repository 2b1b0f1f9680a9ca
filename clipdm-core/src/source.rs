use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("metadata extraction failed: {0}")]
    Extraction(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Probe result: enough to enforce limits and name the delivery file,
/// obtained without downloading media content.
#[derive(Debug, Clone)]
pub struct MediaDescriptor {
    pub title: String,
    pub duration_seconds: Option<f64>,
}

/// A video-hosting platform the bot can pull from. Implementations must keep
/// `probe` metadata-only; `fetch` writes exactly one file at `destination`.
#[async_trait]
pub trait MediaSource: Send + Sync {
    fn name(&self) -> &str;

    async fn probe(&self, url: &str) -> SourceResult<MediaDescriptor>;

    /// Download the full media and return its size in bytes.
    async fn fetch(&self, url: &str, destination: &Path) -> SourceResult<u64>;
}

/// Accepted source-URL shape. Checked before any network activity.
pub fn is_supported_url(url: &str) -> bool {
    let pattern = regex::Regex::new(r"^(https?://)?(www\.)?(youtube\.com|youtu\.be)/")
        .expect("source url pattern is valid");
    pattern.is_match(url)
}

/// Strip path separators and control characters from a probed title so it can
/// become a filename component. Falls back to "video" for empty titles.
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "video".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Media source backed by the yt-dlp extractor.
#[derive(Debug, Clone)]
pub struct YtDlpSource {
    bin: String,
}

#[derive(Debug, Deserialize)]
struct YtDlpMetadata {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
}

impl YtDlpSource {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl MediaSource for YtDlpSource {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn probe(&self, url: &str) -> SourceResult<MediaDescriptor> {
        debug!(url, "probing source metadata");
        let output = Command::new(&self.bin)
            .args(["--dump-json", "--skip-download", "--no-playlist", url])
            .output()
            .await
            .map_err(|source| SourceError::Spawn {
                tool: self.bin.clone(),
                source,
            })?;
        if !output.status.success() {
            let stderr = stderr_snippet(&output.stderr);
            if stderr.contains("Unsupported URL") || stderr.contains("is not a valid URL") {
                return Err(SourceError::Unavailable(stderr));
            }
            return Err(SourceError::Extraction(stderr));
        }
        parse_metadata(&output.stdout)
    }

    async fn fetch(&self, url: &str, destination: &Path) -> SourceResult<u64> {
        debug!(url, destination = %destination.display(), "downloading media");
        let output = Command::new(&self.bin)
            .arg("-f")
            .arg("mp4")
            .arg("-o")
            .arg(destination)
            .arg("--no-playlist")
            .arg("--quiet")
            .arg(url)
            .output()
            .await
            .map_err(|source| SourceError::Spawn {
                tool: self.bin.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(SourceError::Download(stderr_snippet(&output.stderr)));
        }
        let metadata = tokio::fs::metadata(destination).await.map_err(|_| {
            SourceError::Download("downloader reported success but wrote no file".to_string())
        })?;
        Ok(metadata.len())
    }
}

fn parse_metadata(stdout: &[u8]) -> SourceResult<MediaDescriptor> {
    let metadata: YtDlpMetadata = serde_json::from_slice(stdout)
        .map_err(|err| SourceError::Extraction(format!("unexpected metadata payload: {err}")))?;
    Ok(MediaDescriptor {
        title: metadata.title.unwrap_or_else(|| "video".to_string()),
        duration_seconds: metadata.duration,
    })
}

fn stderr_snippet(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let mut end = trimmed.len().min(500);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_youtube_urls() {
        assert!(is_supported_url("https://www.youtube.com/watch?v=abc123"));
        assert!(is_supported_url("https://youtu.be/abc123"));
        assert!(is_supported_url("http://youtube.com/watch?v=abc123"));
        assert!(is_supported_url("youtube.com/watch?v=abc123"));
    }

    #[test]
    fn rejects_other_urls() {
        assert!(!is_supported_url("https://vimeo.com/12345"));
        assert!(!is_supported_url("https://example.com/youtube.com/"));
        assert!(!is_supported_url("not a url"));
        assert!(!is_supported_url(""));
    }

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_title("AC/DC - Thunderstruck"), "AC_DC - Thunderstruck");
        assert_eq!(sanitize_title("a\\b/c"), "a_b_c");
    }

    #[test]
    fn sanitize_falls_back_for_empty_titles() {
        assert_eq!(sanitize_title(""), "video");
        assert_eq!(sanitize_title("   "), "video");
    }

    #[test]
    fn metadata_parses_title_and_duration() {
        let payload = br#"{"title": "Some Clip", "duration": 300.5, "id": "x"}"#;
        let descriptor = parse_metadata(payload).unwrap();
        assert_eq!(descriptor.title, "Some Clip");
        assert_eq!(descriptor.duration_seconds, Some(300.5));
    }

    #[test]
    fn metadata_tolerates_missing_fields() {
        let descriptor = parse_metadata(br#"{"id": "x"}"#).unwrap();
        assert_eq!(descriptor.title, "video");
        assert!(descriptor.duration_seconds.is_none());
    }

    #[test]
    fn metadata_rejects_non_json() {
        assert!(parse_metadata(b"not json").is_err());
    }
}
