// Extractor backed by the yt-dlp binary
//
// Runs `yt-dlp --dump-single-json --flat-playlist` and maps its format list onto
// renditions. Only formats fetchable with a plain ranged GET are kept: progressive
// video (audio and video in one file) and audio-only streams.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{validate_url, Extractor, MediaInfo};
use crate::config::ExtractorConfig;
use crate::error::{Error, Result};
use crate::models::{AudioFormat, Rendition, RenditionKind, VideoQuality};

pub struct YtDlpExtractor {
    program: String,
    timeout: Duration,
    proxy: Option<String>,
}

impl YtDlpExtractor {
    pub fn new(config: &ExtractorConfig) -> Self {
        Self {
            program: config.ytdlp_path.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            proxy: config.proxy.clone(),
        }
    }

    fn build_args(&self, url: &str) -> Vec<String> {
        let mut args = vec![
            "--dump-single-json".to_string(),
            "--flat-playlist".to_string(),
            "--no-warnings".to_string(),
            "--socket-timeout".to_string(),
            "30".to_string(),
        ];
        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        args.push(url.to_string());
        args
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn resolve(&self, url: &str) -> Result<MediaInfo> {
        validate_url(url)?;
        let args = self.build_args(url);
        debug!(program = %self.program, ?args, "running extractor");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| Error::Extraction(format!("{} timed out after {:?}", self.program, self.timeout)))?
            .map_err(|e| Error::Extraction(format!("failed to start {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(url, status = ?output.status.code(), "extractor failed");
            return Err(classify_failure(url, &stderr));
        }
        parse_info(&output.stdout)
    }
}

fn classify_failure(url: &str, stderr: &str) -> Error {
    if stderr.contains("Unsupported URL") {
        return Error::UnsupportedUrl(url.to_string());
    }
    let message = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("extractor exited with an error")
        .trim()
        .to_string();
    Error::Extraction(message)
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
    entries: Option<Vec<Option<RawEntry>>>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    url: Option<String>,
    ext: Option<String>,
    protocol: Option<String>,
    height: Option<u32>,
    vcodec: Option<String>,
    acodec: Option<String>,
    filesize: Option<u64>,
    filesize_approx: Option<f64>,
    tbr: Option<f64>,
    abr: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    id: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
}

/// Map yt-dlp's JSON onto a `MediaInfo`.
pub(crate) fn parse_info(stdout: &[u8]) -> Result<MediaInfo> {
    let raw: RawInfo = serde_json::from_slice(stdout)
        .map_err(|e| Error::Extraction(format!("invalid extractor output: {e}")))?;

    let entries = raw.entries.map(|entries| {
        entries
            .into_iter()
            .flatten()
            .filter_map(entry_url)
            .collect::<Vec<_>>()
    });
    let renditions = raw.formats.into_iter().filter_map(to_rendition).collect();

    Ok(MediaInfo {
        title: raw.title.unwrap_or_else(|| "Unknown".to_string()),
        renditions,
        entries,
    })
}

fn entry_url(entry: RawEntry) -> Option<String> {
    let is_web = |u: &String| u.starts_with("http://") || u.starts_with("https://");
    entry
        .webpage_url
        .filter(is_web)
        .or(entry.url.filter(is_web))
        .or_else(|| entry.id.map(|id| format!("https://www.youtube.com/watch?v={id}")))
}

fn to_rendition(format: RawFormat) -> Option<Rendition> {
    let locator = format.url?;
    if !matches!(format.protocol.as_deref(), None | Some("http") | Some("https")) {
        return None;
    }
    let has = |codec: &Option<String>| codec.as_deref().is_some_and(|c| c != "none" && !c.is_empty());
    let has_video = has(&format.vcodec);
    let has_audio = has(&format.acodec);
    let ext = format.ext.clone().unwrap_or_default();

    let (kind, codec, bitrate) = if has_video && has_audio {
        let quality = VideoQuality::from_height(format.height?);
        (RenditionKind::Video(quality), format.vcodec, format.tbr)
    } else if has_audio {
        let audio = audio_format(&ext, format.acodec.as_deref())?;
        (RenditionKind::Audio(audio), format.acodec, format.abr.or(format.tbr))
    } else {
        return None;
    };

    let expires_at = expiry_of(&locator);
    Some(Rendition {
        kind,
        container: ext,
        codec,
        approx_size: format.filesize.or(format.filesize_approx.map(|s| s as u64)),
        bitrate_kbps: bitrate.map(|b| b as f32),
        locator,
        expires_at,
        sha256: None,
    })
}

fn audio_format(ext: &str, acodec: Option<&str>) -> Option<AudioFormat> {
    match ext {
        "m4a" | "mp4" => Some(AudioFormat::M4a),
        "mp3" => Some(AudioFormat::Mp3),
        "wav" => Some(AudioFormat::Wav),
        "opus" | "webm" | "ogg" if acodec.is_some_and(|c| c.starts_with("opus")) => {
            Some(AudioFormat::Opus)
        }
        "opus" => Some(AudioFormat::Opus),
        _ => None,
    }
}

/// Media hosts sign locators with an `expire=<unix seconds>` parameter.
fn expiry_of(locator: &str) -> Option<DateTime<Utc>> {
    let parsed = url::Url::parse(locator).ok()?;
    let secs = parsed
        .query_pairs()
        .find(|(key, _)| key == "expire")
        .and_then(|(_, value)| value.parse::<i64>().ok())?;
    DateTime::from_timestamp(secs, 0)
}
