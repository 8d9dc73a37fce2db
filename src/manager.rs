// src/manager.rs

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::extractor::{validate_url, Extractor};
use crate::limiter::SpeedLimiter;
use crate::models::{ProgressSnapshot, Quality, Rendition, Task, TaskEvent, TaskId, TaskState};
use crate::naming;
use crate::progress::ProgressReporter;
use crate::queue::AdmissionQueue;
use crate::registry::TaskRegistry;
use crate::selector;
use crate::transfer::{discard_partial, StopSignal, TransferEngine};

const PLAYLIST_BUFFER: usize = 16;

/// Outcome of one playlist entry.
#[derive(Debug)]
pub enum PlaylistItem {
    Queued(TaskId),
    /// `index` is the 1-based position in the playlist.
    Failed { index: usize, url: String, error: Error },
    /// The target file already exists.
    Skipped { index: usize, url: String, path: PathBuf },
}

/// Everything a playlist submission produced, gathered from its stream.
#[derive(Debug, Default)]
pub struct PlaylistReport {
    pub queued: Vec<TaskId>,
    pub failed: Vec<(usize, String, Error)>,
    pub skipped: Vec<(usize, String, PathBuf)>,
}

impl PlaylistReport {
    pub async fn collect(mut items: BoxStream<'_, PlaylistItem>) -> Self {
        let mut report = Self::default();
        while let Some(item) = items.next().await {
            match item {
                PlaylistItem::Queued(id) => report.queued.push(id),
                PlaylistItem::Failed { index, url, error } => report.failed.push((index, url, error)),
                PlaylistItem::Skipped { index, url, path } => report.skipped.push((index, url, path)),
            }
        }
        report
    }
}

#[derive(Clone, Default)]
struct ActiveTransfer {
    signal: StopSignal,
    /// Fired by the worker once the task's final state is recorded.
    done: CancellationToken,
}

#[derive(Default)]
struct Scheduler {
    queue: AdmissionQueue,
    active: HashMap<TaskId, ActiveTransfer>,
}

/// The central component: resolves requests into tasks, admits them into a
/// bounded worker pool in FIFO order, and routes pause/resume/cancel to the
/// worker that owns each task.
pub struct DownloadManager {
    config: Config,
    registry: Arc<TaskRegistry>,
    extractor: Arc<dyn Extractor>,
    engine: Arc<TransferEngine>,
    limiter: SpeedLimiter,
    progress: ProgressReporter,
    scheduler: Mutex<Scheduler>,
    wake: Notify,
    shutdown: CancellationToken,
}

impl DownloadManager {
    /// Builds the manager and starts its dispatcher. Must be called from
    /// within a tokio runtime.
    pub fn new(config: Config, extractor: Arc<dyn Extractor>) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = Arc::new(TaskRegistry::new());
        let limiter = SpeedLimiter::new(config.transfer.speed_limit);
        let engine = TransferEngine::new(
            config.transfer.clone(),
            registry.clone(),
            extractor.clone(),
            limiter.clone(),
        )?;
        let progress = ProgressReporter::new(registry.clone(), &config.progress);

        let manager = Arc::new(Self {
            config,
            registry,
            extractor,
            engine: Arc::new(engine),
            limiter,
            progress,
            scheduler: Mutex::new(Scheduler::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(manager.clone().run());
        info!(
            max_concurrent = manager.config.downloads.max_concurrent,
            directory = %manager.config.downloads.directory.display(),
            "download manager started"
        );
        Ok(manager)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers a task for an already resolved rendition and queues it.
    pub async fn enqueue(&self, url: String, rendition: Rendition, path: PathBuf) -> Result<TaskId> {
        let mut scheduler = self.scheduler.lock().await;
        let id = self.registry.create(url, rendition, path).await?;
        scheduler.queue.push(id);
        drop(scheduler);

        self.wake.notify_one();
        Ok(id)
    }

    /// Resolves `url`, picks the rendition closest to `quality` and queues it.
    pub async fn submit_single(&self, url: &str, quality: Quality) -> Result<TaskId> {
        validate_url(url)?;
        let info = self.extractor.resolve(url).await?;
        let rendition = selector::select(&info.renditions, quality)?;
        let path = naming::target_path(&self.config.downloads.directory, &info.title, &rendition);
        info!(url, %quality, chosen = ?rendition.kind, path = %path.display(), "submitting download");
        self.enqueue(url.to_string(), rendition, path).await
    }

    /// Resolves the playlist's entry list, then resolves and queues entries one
    /// by one in the background. Downloads start while later entries are still
    /// being resolved; a failing entry is reported and the rest carry on.
    /// Dropping the stream stops resolution of the remaining entries.
    pub async fn submit_playlist(
        self: &Arc<Self>,
        url: &str,
        quality: Quality,
    ) -> Result<BoxStream<'static, PlaylistItem>> {
        validate_url(url)?;
        let info = self.extractor.resolve(url).await?;
        let entries = info.entries.unwrap_or_else(|| vec![url.to_string()]);
        info!(url, entries = entries.len(), "submitting playlist");

        let (tx, rx) = mpsc::channel(PLAYLIST_BUFFER);
        let manager = self.clone();
        tokio::spawn(async move {
            for (index, entry) in entries.into_iter().enumerate() {
                if manager.shutdown.is_cancelled() {
                    break;
                }
                let item = manager.playlist_entry(index + 1, entry, quality).await;
                if tx.send(item).await.is_err() {
                    debug!("playlist consumer went away, stopping");
                    break;
                }
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
        .boxed())
    }

    async fn playlist_entry(&self, index: usize, url: String, quality: Quality) -> PlaylistItem {
        let resolved = async {
            let info = self.extractor.resolve(&url).await?;
            let rendition = selector::select(&info.renditions, quality)?;
            Ok::<_, Error>((info.title, rendition))
        }
        .await;

        let (title, rendition) = match resolved {
            Ok(found) => found,
            Err(error) => {
                warn!(index, url = %url, %error, "playlist entry failed");
                return PlaylistItem::Failed { index, url, error };
            }
        };

        let path = naming::target_path(&self.config.downloads.directory, &title, &rendition);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            info!(index, url = %url, path = %path.display(), "already downloaded, skipping");
            return PlaylistItem::Skipped { index, url, path };
        }

        match self.enqueue(url.clone(), rendition, path).await {
            Ok(id) => PlaylistItem::Queued(id),
            Err(error) => {
                warn!(index, url = %url, %error, "playlist entry failed");
                PlaylistItem::Failed { index, url, error }
            }
        }
    }

    /// Stops the task at its next chunk boundary with its progress checkpointed.
    /// A queued task leaves the queue. Returns once the task is no longer moving.
    pub async fn pause(&self, id: TaskId) -> Result<()> {
        loop {
            let mut scheduler = self.scheduler.lock().await;
            if let Some(transfer) = scheduler.active.get(&id).cloned() {
                drop(scheduler);
                debug!(task_id = %id, "pause requested");
                transfer.signal.pause();
                transfer.done.cancelled().await;
                continue;
            }

            let task = self.registry.get(id).await?;
            return match task.state {
                TaskState::Pending => {
                    scheduler.queue.remove(id);
                    self.registry.transition(id, TaskState::Paused).await?;
                    info!(task_id = %id, "queued task paused");
                    Ok(())
                }
                TaskState::Paused => Ok(()),
                state => Err(Error::InvalidState { id, state: state.name() }),
            };
        }
    }

    /// Puts a paused task back in the admission queue. It continues from its
    /// last confirmed offset.
    pub async fn resume(&self, id: TaskId) -> Result<()> {
        let mut scheduler = self.scheduler.lock().await;
        let task = self.registry.get(id).await?;
        if task.state != TaskState::Paused {
            return Err(Error::InvalidState { id, state: task.state.name() });
        }
        self.registry.transition(id, TaskState::Pending).await?;
        scheduler.queue.push(id);
        drop(scheduler);

        info!(task_id = %id, offset = task.bytes_downloaded, "task resumed");
        self.wake.notify_one();
        Ok(())
    }

    /// Queues a failed task again with a fresh attempt budget.
    pub async fn retry(&self, id: TaskId) -> Result<()> {
        let mut scheduler = self.scheduler.lock().await;
        let task = self.registry.get(id).await?;
        if !matches!(task.state, TaskState::Failed { .. }) {
            return Err(Error::InvalidState { id, state: task.state.name() });
        }
        self.registry
            .transition_with(id, TaskState::Pending, |t| t.attempts = 0)
            .await?;
        scheduler.queue.push(id);
        drop(scheduler);

        info!(task_id = %id, "task retried");
        self.wake.notify_one();
        Ok(())
    }

    /// Stops the task, deletes its partial file and checkpoint, and forgets it.
    /// The task cannot be resumed afterwards.
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        loop {
            let mut scheduler = self.scheduler.lock().await;
            if let Some(transfer) = scheduler.active.get(&id).cloned() {
                drop(scheduler);
                debug!(task_id = %id, "cancel requested");
                transfer.signal.cancel();
                transfer.done.cancelled().await;
                continue;
            }

            // Queued, paused and failed tasks have no worker to clean up after them.
            let task = self.registry.get(id).await?;
            match task.state {
                TaskState::Cancelled => {}
                TaskState::Pending | TaskState::Paused | TaskState::Failed { .. } => {
                    scheduler.queue.remove(id);
                    discard_partial(&task).await;
                    self.registry.transition(id, TaskState::Cancelled).await?;
                    info!(task_id = %id, "task cancelled");
                }
                state => return Err(Error::InvalidState { id, state: state.name() }),
            }
            self.registry.remove(id).await?;
            return Ok(());
        }
    }

    pub async fn pause_all(&self) {
        // Queued tasks first, so freed slots are not refilled from the queue.
        let tasks = self.registry.list().await;
        let queued = tasks.iter().filter(|t| t.state == TaskState::Pending);
        let active = tasks.iter().filter(|t| t.state == TaskState::Active);
        for task in queued.chain(active) {
            if let Err(e) = self.pause(task.id).await {
                warn!(task_id = %task.id, error = %e, "pause failed");
            }
        }
    }

    pub async fn resume_all(&self) {
        for task in self.registry.list().await {
            if task.state == TaskState::Paused {
                if let Err(e) = self.resume(task.id).await {
                    warn!(task_id = %task.id, error = %e, "resume failed");
                }
            }
        }
    }

    /// Drops a finished task from the registry. Live tasks must be cancelled instead.
    pub async fn remove(&self, id: TaskId) -> Result<Task> {
        let task = self.registry.get(id).await?;
        if !task.state.is_terminal() {
            return Err(Error::InvalidState { id, state: task.state.name() });
        }
        self.registry.remove(id).await
    }

    pub async fn get(&self, id: TaskId) -> Result<Task> {
        self.registry.get(id).await
    }

    pub async fn list(&self) -> Vec<Task> {
        self.registry.list().await
    }

    /// Waits until the task reaches a terminal state and returns it.
    pub async fn wait(&self, id: TaskId) -> Result<Task> {
        let mut rx = self.registry.watch(id).await?;
        let finished = rx
            .wait_for(|task| task.state.is_terminal())
            .await
            .map(|task| Task::clone(&task));
        match finished {
            Ok(task) => Ok(task),
            // Removed from the registry; the last value is its final state.
            Err(_) => Ok(rx.borrow().clone()),
        }
    }

    pub async fn subscribe_progress(&self, id: TaskId) -> Result<BoxStream<'static, ProgressSnapshot>> {
        self.progress.subscribe(id).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.registry.subscribe_events()
    }

    /// Changes the global bandwidth cap in bytes per second; 0 lifts it.
    pub async fn set_speed_limit(&self, bytes_per_sec: u64) {
        self.limiter.set_rate(bytes_per_sec).await;
        info!(bytes_per_sec, "speed limit changed");
    }

    /// Registers every checkpoint found in the download directory as a paused
    /// task at its saved offset.
    pub async fn recover(&self) -> Result<Vec<TaskId>> {
        let dir = &self.config.downloads.directory;
        let mut recovered = Vec::new();
        for checkpoint in Checkpoint::scan(dir).await? {
            let restored = self
                .registry
                .restore(
                    checkpoint.source_url,
                    checkpoint.rendition,
                    checkpoint.path.clone(),
                    checkpoint.bytes_downloaded,
                    checkpoint.total_bytes,
                )
                .await;
            match restored {
                Ok(id) => {
                    info!(task_id = %id, path = %checkpoint.path.display(), offset = checkpoint.bytes_downloaded, "recovered task");
                    recovered.push(id);
                }
                Err(e) => warn!(path = %checkpoint.path.display(), error = %e, "checkpoint not recovered"),
            }
        }
        Ok(recovered)
    }

    /// Stops admitting work and pauses every running transfer.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let running: Vec<_> = {
            let scheduler = self.scheduler.lock().await;
            scheduler.active.values().cloned().collect()
        };
        for transfer in &running {
            transfer.signal.pause();
        }
        for transfer in running {
            transfer.done.cancelled().await;
        }
        info!("download manager stopped");
    }

    async fn run(self: Arc<Self>) {
        loop {
            self.dispatch().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
            }
        }
        debug!("dispatcher stopped");
    }

    /// Fills free worker slots from the head of the queue.
    async fn dispatch(self: &Arc<Self>) {
        let mut scheduler = self.scheduler.lock().await;
        let Scheduler { queue, active } = &mut *scheduler;
        while active.len() < self.config.downloads.max_concurrent && !self.shutdown.is_cancelled() {
            // A task whose previous worker is still winding down waits its turn.
            let Some(id) = queue.pop_ready(|id| !active.contains_key(&id)) else {
                break;
            };
            match self.registry.get(id).await {
                Ok(task) if task.state == TaskState::Pending => {}
                _ => continue,
            }

            let transfer = ActiveTransfer::default();
            active.insert(id, transfer.clone());
            debug!(task_id = %id, active = active.len(), queued = queue.len(), "admitting task");
            tokio::spawn(self.clone().work(id, transfer));
        }
    }

    async fn work(self: Arc<Self>, id: TaskId, transfer: ActiveTransfer) {
        match self.engine.run(id, &transfer.signal).await {
            Ok(outcome) => debug!(task_id = %id, ?outcome, "worker finished"),
            Err(e) => error!(task_id = %id, error = %e, "worker stopped"),
        }
        self.scheduler.lock().await.active.remove(&id);
        transfer.done.cancel();
        self.wake.notify_one();
    }
}
