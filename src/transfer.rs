use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::TransferConfig;
use crate::error::{Error, FailureReason, Result};
use crate::extractor::Extractor;
use crate::integrity::verify_sha256;
use crate::limiter::SpeedLimiter;
use crate::models::{Task, TaskId, TaskState};
use crate::registry::TaskRegistry;
use crate::selector;

/// Why a transfer was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Pause,
    Cancel,
}

/// Cooperative stop request, honored at the next chunk boundary.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    cancel: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.token.cancel();
    }

    pub fn cancel(&self) {
        // Flag first, so whoever sees the token fired also sees the kind.
        self.cancel.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn requested(&self) -> Option<StopKind> {
        if !self.token.is_cancelled() {
            None
        } else if self.cancel.load(Ordering::SeqCst) {
            Some(StopKind::Cancel)
        } else {
            Some(StopKind::Pause)
        }
    }

    async fn stopped(&self) -> StopKind {
        self.token.cancelled().await;
        self.requested().unwrap_or(StopKind::Pause)
    }
}

/// How a run of the engine ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Paused,
    Cancelled,
    Failed { reason: FailureReason, attempts: u32 },
}

/// A response body positioned for writing at `offset`.
struct Body {
    response: Response,
    offset: u64,
    /// Leading body bytes that are already on disk.
    skip: u64,
    total: Option<u64>,
}

enum AttemptEnd {
    Finished,
    Stopped(StopKind),
}

/// Streams renditions to disk with ranged requests, retries and checkpoints.
pub struct TransferEngine {
    client: Client,
    registry: Arc<TaskRegistry>,
    extractor: Arc<dyn Extractor>,
    limiter: SpeedLimiter,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(
        config: TransferConfig,
        registry: Arc<TaskRegistry>,
        extractor: Arc<dyn Extractor>,
        limiter: SpeedLimiter,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            registry,
            extractor,
            limiter,
            config,
        })
    }

    /// Runs a `Pending` task until it completes, stops or runs out of attempts.
    pub async fn run(&self, id: TaskId, signal: &StopSignal) -> Result<TransferOutcome> {
        self.registry
            .transition_with(id, TaskState::Active, |task| task.attempts = 0)
            .await?;
        info!(task_id = %id, "transfer started");

        let mut attempt = 0u32;
        loop {
            if let Some(kind) = signal.requested() {
                return self.stop(id, kind).await;
            }

            attempt += 1;
            self.registry.update(id, |task| task.attempts = attempt).await?;

            let error = match self.attempt(id, signal).await {
                Ok(AttemptEnd::Finished) => return self.finish(id, attempt).await,
                Ok(AttemptEnd::Stopped(kind)) => return self.stop(id, kind).await,
                Err(error) => error,
            };

            let reason = error.failure_reason().unwrap_or(FailureReason::DiskWriteError);
            self.save_checkpoint(id).await;

            if !error.is_retryable() || attempt >= self.config.max_attempts {
                warn!(task_id = %id, attempt, %error, %reason, "transfer failed");
                return self.fail(id, reason, attempt).await;
            }

            let delay = self.config.backoff(attempt);
            warn!(task_id = %id, attempt, %error, ?delay, "attempt failed, retrying");
            tokio::select! {
                kind = signal.stopped() => return self.stop(id, kind).await,
                _ = tokio::time::sleep(delay) => {}
            }

            if matches!(error, Error::RenditionExpired) {
                let resolved = tokio::select! {
                    kind = signal.stopped() => return self.stop(id, kind).await,
                    resolved = self.reresolve(id) => resolved,
                };
                if let Err(e) = resolved {
                    warn!(task_id = %id, error = %e, "re-resolution failed");
                }
            }
        }
    }

    /// One ranged request, streamed to the partial file.
    async fn attempt(&self, id: TaskId, signal: &StopSignal) -> Result<AttemptEnd> {
        let task = self.registry.get(id).await?;
        if task.rendition.is_expired_at(Utc::now()) {
            return Err(Error::RenditionExpired);
        }

        let part = task.partial_path();
        if let Some(parent) = part.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&part)
            .await?;

        // The counter only ever covers flushed bytes, so the file can be longer
        // (a torn chunk) but never shorter unless something else touched it.
        let on_disk = file.metadata().await?.len();
        let offset = task.bytes_downloaded.min(on_disk);
        file.set_len(offset).await?;

        let response = tokio::select! {
            kind = signal.stopped() => return Ok(AttemptEnd::Stopped(kind)),
            response = self.request(&task, offset) => response?,
        };

        let status = response.status();
        let mut skip = 0;
        let total = match status {
            StatusCode::PARTIAL_CONTENT => {
                let range = content_range(&response);
                if let Some(start) = range.as_deref().and_then(parse_content_range_start) {
                    if start != offset {
                        return Err(Error::Network(format!(
                            "server resumed at byte {start} instead of {offset}"
                        )));
                    }
                }
                range
                    .as_deref()
                    .and_then(parse_content_range_total)
                    .or_else(|| content_length(&response).map(|len| offset + len))
            }
            StatusCode::OK => {
                if offset > 0 {
                    // Full body despite the range: drop what is already on disk.
                    warn!(task_id = %id, offset, "server ignored range, skipping confirmed prefix");
                    skip = offset;
                }
                content_length(&response)
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 && task.total_bytes == Some(offset) => {
                debug!(task_id = %id, "nothing left to fetch");
                return Ok(AttemptEnd::Finished);
            }
            StatusCode::FORBIDDEN | StatusCode::GONE => return Err(Error::RenditionExpired),
            other => return Err(Error::HttpStatus(other.as_u16())),
        };

        self.registry
            .update(id, |t| {
                t.bytes_downloaded = offset;
                if total.is_some() {
                    t.total_bytes = total;
                }
            })
            .await?;
        self.save_checkpoint(id).await;
        debug!(task_id = %id, offset, ?total, %status, "streaming");

        file.seek(SeekFrom::Start(offset)).await?;
        let body = Body { response, offset, skip, total };
        let streamed = self.stream_body(id, body, &mut file, signal).await;
        let flushed = file.flush().await;
        drop(file);
        let end = streamed?;
        flushed?;
        Ok(end)
    }

    async fn request(&self, task: &Task, offset: u64) -> Result<Response> {
        let mut request = self.client.get(&task.rendition.locator);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        Ok(request.send().await?)
    }

    async fn stream_body(
        &self,
        id: TaskId,
        body: Body,
        file: &mut File,
        signal: &StopSignal,
    ) -> Result<AttemptEnd> {
        let read_timeout = Duration::from_secs(self.config.read_timeout_secs);
        let checkpoint_every = self.config.checkpoint_interval();
        let mut last_checkpoint = Instant::now();
        let mut downloaded = body.offset;
        let mut skip = body.skip;
        let body_total = body.total;
        let mut stream = body.response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                kind = signal.stopped() => return Ok(AttemptEnd::Stopped(kind)),
                next = tokio::time::timeout(read_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => return Err(Error::Network("read timed out".into())),
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };
            let chunk = if skip > 0 {
                let dropped = skip.min(chunk.len() as u64);
                skip -= dropped;
                chunk.slice(dropped as usize..)
            } else {
                chunk
            };
            if chunk.is_empty() {
                continue;
            }

            self.limiter.acquire(chunk.len() as u64).await;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            self.registry
                .update(id, |t| t.bytes_downloaded = downloaded)
                .await?;

            if last_checkpoint.elapsed() >= checkpoint_every {
                file.flush().await?;
                self.save_checkpoint(id).await;
                last_checkpoint = Instant::now();
            }
        }

        match body_total {
            Some(expected) if downloaded < expected => Err(Error::Network(format!(
                "connection closed at {downloaded} of {expected} bytes"
            ))),
            _ => Ok(AttemptEnd::Finished),
        }
    }

    async fn finish(&self, id: TaskId, attempts: u32) -> Result<TransferOutcome> {
        let task = self.registry.get(id).await?;
        let part = task.partial_path();

        if let Some(expected) = task.rendition.sha256.as_deref() {
            if let Err(e) = verify_sha256(&part, expected).await {
                warn!(task_id = %id, error = %e, "integrity check failed");
                discard_partial(&task).await;
                let reason = FailureReason::IntegrityError;
                self.registry
                    .transition_with(id, TaskState::Failed { reason, attempts }, |t| {
                        t.bytes_downloaded = 0;
                    })
                    .await?;
                return Ok(TransferOutcome::Failed { reason, attempts });
            }
        }

        if let Err(e) = tokio::fs::rename(&part, &task.path).await {
            warn!(task_id = %id, error = %e, "could not move finished file into place");
            return self.fail(id, FailureReason::DiskWriteError, attempts).await;
        }
        Checkpoint::remove(&task.path).await;

        self.registry
            .transition_with(id, TaskState::Completed, |t| {
                t.total_bytes = Some(t.total_bytes.unwrap_or(t.bytes_downloaded));
            })
            .await?;
        info!(task_id = %id, path = %task.path.display(), attempts, "transfer completed");
        Ok(TransferOutcome::Completed)
    }

    async fn stop(&self, id: TaskId, kind: StopKind) -> Result<TransferOutcome> {
        match kind {
            StopKind::Pause => {
                self.save_checkpoint(id).await;
                self.registry.transition(id, TaskState::Paused).await?;
                info!(task_id = %id, "transfer paused");
                Ok(TransferOutcome::Paused)
            }
            StopKind::Cancel => {
                let task = self.registry.get(id).await?;
                discard_partial(&task).await;
                self.registry.transition(id, TaskState::Cancelled).await?;
                info!(task_id = %id, "transfer cancelled");
                Ok(TransferOutcome::Cancelled)
            }
        }
    }

    async fn fail(&self, id: TaskId, reason: FailureReason, attempts: u32) -> Result<TransferOutcome> {
        self.registry
            .transition(id, TaskState::Failed { reason, attempts })
            .await?;
        Ok(TransferOutcome::Failed { reason, attempts })
    }

    /// Fetches a fresh locator for the task's rendition from its source page.
    async fn reresolve(&self, id: TaskId) -> Result<()> {
        let task = self.registry.get(id).await?;
        info!(task_id = %id, extractor = self.extractor.name(), "re-resolving expired rendition");
        let info = self.extractor.resolve(&task.source_url).await?;
        let fresh = selector::rematch(&task.rendition, &info.renditions)
            .ok_or(Error::RenditionExpired)?;
        self.registry.update(id, |t| t.rendition = fresh).await?;
        self.save_checkpoint(id).await;
        Ok(())
    }

    async fn save_checkpoint(&self, id: TaskId) {
        let task = match self.registry.get(id).await {
            Ok(task) => task,
            Err(_) => return,
        };
        if let Err(e) = Checkpoint::from_task(&task).save().await {
            warn!(task_id = %id, error = %e, "checkpoint not saved");
        }
    }
}

/// Deletes the partial file and its checkpoint; a cancelled task leaves nothing behind.
pub async fn discard_partial(task: &Task) {
    let part = task.partial_path();
    if let Err(e) = tokio::fs::remove_file(&part).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(task_id = %task.id, path = %part.display(), error = %e, "could not delete partial file");
        }
    }
    Checkpoint::remove(&task.path).await;
}

fn content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

fn content_range(response: &Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Total size from `Content-Range: bytes a-b/total`; `*` means unknown.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

/// First byte `a` of `Content-Range: bytes a-b/total`.
fn parse_content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    range.split_once('-').and_then(|(start, _)| start.parse().ok())
}
