// Extraction adapter boundary
//
// An extractor turns a page URL into the renditions it offers, or into the
// entry URLs of a playlist. Everything protocol-specific lives behind it.

mod ytdlp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::Rendition;

pub use ytdlp::YtDlpExtractor;

/// What a URL resolved to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub title: String,
    pub renditions: Vec<Rendition>,
    /// Entry page URLs when the URL names a playlist.
    pub entries: Option<Vec<String>>,
}

impl MediaInfo {
    pub fn is_playlist(&self) -> bool {
        self.entries.is_some()
    }
}

/// Source of renditions for page URLs.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Name of the extractor (for logging)
    fn name(&self) -> &'static str;

    /// Fails with `UnsupportedUrl` or `Extraction`.
    async fn resolve(&self, url: &str) -> Result<MediaInfo>;
}

/// Rejects anything that is not an absolute http(s) URL before a backend sees it.
pub fn validate_url(raw: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(raw.trim()).map_err(|_| Error::UnsupportedUrl(raw.to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(Error::UnsupportedUrl(raw.to_string())),
    }
}
