//! Configuration structures and loading logic.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{AudioFormat, Quality};

/// Main configuration structure. Every section may be omitted from the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub downloads: DownloadsConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub progress: ProgressConfig,

    #[serde(default)]
    pub extractor: ExtractorConfig,
}

/// Where files go and how many transfers run at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadsConfig {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Upper bound on concurrently running transfers; the rest wait in line.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Quality used when the caller does not ask for one.
    #[serde(default = "default_quality")]
    pub quality: Quality,

    /// Format used for audio downloads when the caller does not ask for one.
    #[serde(default = "default_audio_format")]
    pub audio_format: AudioFormat,
}

/// HTTP transfer behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Attempts per run before a task is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles for each one after.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Idle time allowed between two received chunks.
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,

    /// Bytes per second shared by all transfers, 0 for unlimited.
    #[serde(default)]
    pub speed_limit: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Weight of the newest sample in the smoothed speed, in (0, 1].
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,
}

/// Settings for the yt-dlp backed extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: String,

    #[serde(default = "default_extractor_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub proxy: Option<String>,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            max_concurrent: default_max_concurrent(),
            quality: default_quality(),
            audio_format: default_audio_format(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            connect_timeout_secs: default_timeout_secs(),
            read_timeout_secs: default_timeout_secs(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            speed_limit: 0,
            user_agent: default_user_agent(),
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            smoothing: default_smoothing(),
        }
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: default_ytdlp_path(),
            timeout_secs: default_extractor_timeout_secs(),
            proxy: None,
        }
    }
}

fn default_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("YouTubeDownloader-Downloads")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_quality() -> Quality {
    Quality::Best
}

fn default_audio_format() -> AudioFormat {
    AudioFormat::M4a
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_checkpoint_interval_ms() -> u64 {
    1_000
}

fn default_user_agent() -> String {
    concat!("tubegrab/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_sample_interval_ms() -> u64 {
    500
}

fn default_smoothing() -> f64 {
    0.3
}

fn default_ytdlp_path() -> String {
    "yt-dlp".to_string()
}

fn default_extractor_timeout_secs() -> u64 {
    60
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.downloads.max_concurrent == 0 {
            return Err(Error::Config("downloads.max_concurrent must be at least 1".into()));
        }
        if self.transfer.max_attempts == 0 {
            return Err(Error::Config("transfer.max_attempts must be at least 1".into()));
        }
        if self.progress.sample_interval_ms == 0 {
            return Err(Error::Config("progress.sample_interval_ms must be positive".into()));
        }
        if !(self.progress.smoothing > 0.0 && self.progress.smoothing <= 1.0) {
            return Err(Error::Config("progress.smoothing must be in (0, 1]".into()));
        }
        Ok(())
    }
}

impl DownloadsConfig {
    /// Audio-only quality in `format`, or in the configured format when none is given.
    pub fn audio_quality(&self, format: Option<AudioFormat>) -> Quality {
        Quality::Audio(format.unwrap_or(self.audio_format))
    }
}

impl TransferConfig {
    /// Delay before attempt `attempt + 1`, given `attempt` attempts already failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self.retry_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

impl ProgressConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VideoQuality;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.downloads.max_concurrent, 3);
        assert_eq!(config.transfer.max_attempts, 3);
        assert_eq!(config.downloads.quality, Quality::Best);
        assert!(config.downloads.directory.ends_with("YouTubeDownloader-Downloads"));
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml(
            r#"
            [downloads]
            directory = "/srv/media"
            max_concurrent = 5
            quality = "720p"
            audio_format = "mp3"

            [transfer]
            max_attempts = 5
            speed_limit = 1048576

            [progress]
            sample_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.downloads.directory, PathBuf::from("/srv/media"));
        assert_eq!(config.downloads.quality, Quality::Video(VideoQuality::P720));
        assert_eq!(config.downloads.audio_format, AudioFormat::Mp3);
        assert_eq!(config.transfer.speed_limit, 1_048_576);
        assert_eq!(config.progress.sample_interval(), Duration::from_millis(250));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            Config::from_toml("[downloads]\nmax_concurrent = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[progress]\nsmoothing = 1.5"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_toml("[downloads]\nquality = \"999p\""),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn audio_format_uses_its_label() {
        let config = Config::from_toml("[downloads]\naudio_format = \"m4a\"").unwrap();
        assert_eq!(config.downloads.audio_format, AudioFormat::M4a);

        let written = toml::to_string(&Config::default()).unwrap();
        assert!(written.contains("audio_format = \"m4a\""), "{written}");
        let reread = Config::from_toml(&written).unwrap();
        assert_eq!(reread.downloads.audio_format, AudioFormat::M4a);
    }

    #[test]
    fn bare_audio_request_uses_configured_format() {
        let config = Config::from_toml("[downloads]\naudio_format = \"opus\"").unwrap();
        assert_eq!(config.downloads.audio_quality(None), Quality::Audio(AudioFormat::Opus));
        assert_eq!(
            config.downloads.audio_quality(Some(AudioFormat::Wav)),
            Quality::Audio(AudioFormat::Wav)
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let transfer = TransferConfig {
            retry_backoff_ms: 100,
            max_backoff_ms: 350,
            ..Default::default()
        };
        assert_eq!(transfer.backoff(1), Duration::from_millis(100));
        assert_eq!(transfer.backoff(2), Duration::from_millis(200));
        assert_eq!(transfer.backoff(3), Duration::from_millis(350));
    }
}
