//! Download manager for video and audio renditions.
//!
//! A [`DownloadManager`](manager::DownloadManager) resolves page URLs through an
//! [`Extractor`](extractor::Extractor), registers one task per download and runs
//! them in a bounded worker pool. Transfers stream to a `.part` file with ranged
//! requests, checkpoint their offset beside it, and can be paused, resumed and
//! cancelled while progress is published as a stream of snapshots.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod extractor;
pub mod integrity;
pub mod limiter;
pub mod logging;
pub mod manager;
pub mod models;
pub mod naming;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod selector;
pub mod transfer;

pub use error::{Error, FailureReason, Result};

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, FailureReason, Result};
    pub use crate::extractor::{Extractor, MediaInfo, YtDlpExtractor};
    pub use crate::manager::{DownloadManager, PlaylistItem, PlaylistReport};
    pub use crate::models::{
        AudioFormat, ProgressSnapshot, Quality, Rendition, RenditionKind, Task, TaskEvent, TaskId,
        TaskState, VideoQuality,
    };
    pub use crate::progress::{format_eta, format_size};
}
