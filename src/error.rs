// src/error.rs

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Quality, TaskId};

/// Errors surfaced by the download manager and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported url: {0}")]
    UnsupportedUrl(String),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("rendition locator has expired")]
    RenditionExpired,
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected http status {0}")]
    HttpStatus(u16),
    #[error("disk write error: {0}")]
    DiskWrite(#[from] std::io::Error),
    #[error("path {0} is already owned by another task")]
    PathInUse(PathBuf),
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("no rendition matches {0}")]
    NoMatchingRendition(Quality),
    #[error("task {id} cannot do that while {state}")]
    InvalidState { id: TaskId, state: &'static str },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Error::HttpStatus(status.as_u16()),
            None => Error::Network(err.to_string()),
        }
    }
}

/// Reason code recorded on a task that ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    NetworkError,
    HttpStatusError,
    RenditionExpired,
    DiskWriteError,
    IntegrityError,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            FailureReason::NetworkError => "NetworkError",
            FailureReason::HttpStatusError => "HttpStatusError",
            FailureReason::RenditionExpired => "RenditionExpired",
            FailureReason::DiskWriteError => "DiskWriteError",
            FailureReason::IntegrityError => "IntegrityError",
        };
        f.write_str(code)
    }
}

impl Error {
    /// Reason code for errors that can terminate a transfer.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Error::Network(_) => Some(FailureReason::NetworkError),
            Error::HttpStatus(_) => Some(FailureReason::HttpStatusError),
            Error::RenditionExpired => Some(FailureReason::RenditionExpired),
            Error::DiskWrite(_) => Some(FailureReason::DiskWriteError),
            Error::Integrity { .. } => Some(FailureReason::IntegrityError),
            _ => None,
        }
    }

    /// Whether another attempt may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::RenditionExpired => true,
            Error::HttpStatus(code) => matches!(code, 408 | 429 | 500..=599),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses_are_retryable() {
        assert!(Error::HttpStatus(503).is_retryable());
        assert!(Error::HttpStatus(429).is_retryable());
        assert!(!Error::HttpStatus(404).is_retryable());
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(!Error::PathInUse(PathBuf::from("a")).is_retryable());
    }

    #[test]
    fn failure_reasons_map_to_codes() {
        assert_eq!(
            Error::HttpStatus(500).failure_reason(),
            Some(FailureReason::HttpStatusError)
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "full");
        assert_eq!(
            Error::DiskWrite(io).failure_reason(),
            Some(FailureReason::DiskWriteError)
        );
        assert_eq!(Error::NotFound(TaskId(1)).failure_reason(), None);
        assert_eq!(FailureReason::NetworkError.to_string(), "NetworkError");
    }
}
