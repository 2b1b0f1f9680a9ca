use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ClipdmConfig {
    pub limits: LimitsSection,
    pub paths: PathsSection,
    pub tools: ToolsSection,
    pub transcode: TranscodeSection,
    pub delivery: DeliverySection,
    pub ledger: LedgerSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    /// Byte budget for the delivered file.
    pub max_file_bytes: u64,
    /// Requests for media longer than this are rejected before download.
    pub max_duration_seconds: f64,
    /// One request per user per window.
    pub cooldown_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    /// Root for per-request working directories.
    pub work_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    pub ytdlp_bin: String,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeSection {
    pub video_codec: String,
    pub audio_codec: String,
    pub audio_bitrate_kbps: u32,
    pub min_video_bitrate_kbps: u32,
    pub fallback_duration_seconds: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySection {
    /// Prepended to the sanitized title when naming the delivered file.
    pub filename_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerSection {
    pub api_url: String,
    pub branch: String,
    /// Name of the environment variable holding the bearer token.
    pub token_env: String,
}

impl LedgerSection {
    pub fn token(&self) -> Result<String> {
        std::env::var(&self.token_env)
            .map_err(|_| ConfigError::MissingToken(self.token_env.clone()))
    }
}

pub fn load_clipdm_config<P: AsRef<Path>>(path: P) -> Result<ClipdmConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
