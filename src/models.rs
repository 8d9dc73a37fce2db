// src/models.rs

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, FailureReason};

/// Unique identifier of a task, assigned in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Standard video resolutions, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VideoQuality {
    P144,
    P240,
    P360,
    P480,
    P720,
    P1080,
    P1440,
    P2160,
}

impl VideoQuality {
    pub const ALL: [VideoQuality; 8] = [
        VideoQuality::P144,
        VideoQuality::P240,
        VideoQuality::P360,
        VideoQuality::P480,
        VideoQuality::P720,
        VideoQuality::P1080,
        VideoQuality::P1440,
        VideoQuality::P2160,
    ];

    pub fn height(self) -> u32 {
        match self {
            VideoQuality::P144 => 144,
            VideoQuality::P240 => 240,
            VideoQuality::P360 => 360,
            VideoQuality::P480 => 480,
            VideoQuality::P720 => 720,
            VideoQuality::P1080 => 1080,
            VideoQuality::P1440 => 1440,
            VideoQuality::P2160 => 2160,
        }
    }

    /// Highest standard quality not above `height`; anything below 144 lines is 144p.
    pub fn from_height(height: u32) -> Self {
        Self::ALL
            .iter()
            .rev()
            .copied()
            .find(|q| q.height() <= height)
            .unwrap_or(VideoQuality::P144)
    }
}

impl fmt::Display for VideoQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}p", self.height())
    }
}

impl FromStr for VideoQuality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_end_matches(['p', 'P']);
        let height: u32 = digits
            .parse()
            .map_err(|_| Error::Config(format!("unknown video quality '{s}'")))?;
        Self::ALL
            .iter()
            .copied()
            .find(|q| q.height() == height)
            .ok_or_else(|| Error::Config(format!("unknown video quality '{s}'")))
    }
}

/// Audio container/codec choices offered for audio-only downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    #[serde(alias = "aac")]
    M4a,
    Wav,
    Opus,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Wav => "wav",
            AudioFormat::Opus => "opus",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for AudioFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(AudioFormat::Mp3),
            "m4a" | "aac" => Ok(AudioFormat::M4a),
            "wav" => Ok(AudioFormat::Wav),
            "opus" => Ok(AudioFormat::Opus),
            other => Err(Error::Config(format!("unknown audio format '{other}'"))),
        }
    }
}

/// What a rendition carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RenditionKind {
    Video(VideoQuality),
    Audio(AudioFormat),
}

impl fmt::Display for RenditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenditionKind::Video(q) => write!(f, "video {q}"),
            RenditionKind::Audio(a) => write!(f, "audio {a}"),
        }
    }
}

/// The quality a user asks for. Serialized as its label ("best", "720p", "mp3").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Quality {
    /// Highest video rendition available.
    Best,
    Video(VideoQuality),
    Audio(AudioFormat),
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Best => f.write_str("best"),
            Quality::Video(q) => write!(f, "{q}"),
            Quality::Audio(a) => write!(f, "audio/{a}"),
        }
    }
}

impl FromStr for Quality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("best") {
            return Ok(Quality::Best);
        }
        if let Some(format) = trimmed.strip_prefix("audio/") {
            return format.parse().map(Quality::Audio);
        }
        trimmed
            .parse::<VideoQuality>()
            .map(Quality::Video)
            .or_else(|_| trimmed.parse::<AudioFormat>().map(Quality::Audio))
    }
}

impl TryFrom<String> for Quality {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Quality> for String {
    fn from(quality: Quality) -> Self {
        match quality {
            Quality::Audio(format) => format.to_string(),
            other => other.to_string(),
        }
    }
}

/// A concrete encoded version of a media item, as resolved by an extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rendition {
    pub kind: RenditionKind,
    /// File extension of the container (mp4, webm, m4a, ...).
    pub container: String,
    pub codec: Option<String>,
    pub approx_size: Option<u64>,
    pub bitrate_kbps: Option<f32>,
    /// Direct media URL.
    pub locator: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub sha256: Option<String>,
}

impl Rendition {
    pub fn new(kind: RenditionKind, container: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            kind,
            container: container.into(),
            codec: None,
            approx_size: None,
            bitrate_kbps: None,
            locator: locator.into(),
            expires_at: None,
            sha256: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Active,
    Paused,
    Completed,
    Cancelled,
    Failed { reason: FailureReason, attempts: u32 },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed { .. }
        )
    }

    /// Legal edges of the task lifecycle. Resume and retry go back through `Pending`
    /// so that admission stays FIFO.
    pub fn can_become(&self, next: &TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Active | Paused | Cancelled)
                | (Active, Paused | Completed | Cancelled | Failed { .. })
                | (Paused, Pending | Active | Cancelled)
                | (Failed { .. }, Pending | Active | Cancelled)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Cancelled => "cancelled",
            TaskState::Failed { .. } => "failed",
        }
    }
}

/// A single download, owned by the task registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Page URL the rendition was resolved from; used again when it expires.
    pub source_url: String,
    pub rendition: Rendition,
    pub path: PathBuf,
    pub state: TaskState,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    /// Attempts made in the current run.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId, source_url: String, rendition: Rendition, path: PathBuf) -> Self {
        let total_bytes = rendition.approx_size;
        Self {
            id,
            source_url,
            rendition,
            path,
            state: TaskState::Pending,
            bytes_downloaded: 0,
            total_bytes,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    pub fn partial_path(&self) -> PathBuf {
        partial_path_for(&self.path)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        checkpoint_path_for(&self.path)
    }
}

/// Where the bytes of an unfinished download live, e.g. `clip.mp4.part`.
pub fn partial_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Sidecar checkpoint beside the partial file, e.g. `clip.mp4.part.json`.
pub fn checkpoint_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part.json");
    PathBuf::from(name)
}

/// Point-in-time progress of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub task_id: TaskId,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    /// Smoothed transfer rate in bytes per second.
    pub speed: f64,
    /// Omitted when the total is unknown or nothing is moving.
    pub eta: Option<Duration>,
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> Option<f64> {
        match self.bytes_total {
            Some(total) if total > 0 => Some(self.bytes_done as f64 * 100.0 / total as f64),
            _ => None,
        }
    }
}

/// State transition published to event subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,
}
