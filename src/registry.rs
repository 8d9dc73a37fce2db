// src/registry.rs

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{Rendition, Task, TaskEvent, TaskId, TaskState};

const EVENT_CAPACITY: usize = 256;

/// The single owner of task state.
///
/// Each task lives in a `watch` channel: mutations go through `send_modify`, so
/// they are serialized and every reader sees a whole `Task`, never a half update.
pub struct TaskRegistry {
    inner: RwLock<RegistryInner>,
    next_id: AtomicU64,
    events: broadcast::Sender<TaskEvent>,
}

#[derive(Default)]
struct RegistryInner {
    // Ids are handed out in increasing order, so key order is insertion order.
    tasks: BTreeMap<TaskId, watch::Sender<Task>>,
    paths: HashMap<PathBuf, TaskId>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Registers a new `Pending` task. Fails with `PathInUse` if another task owns `path`.
    pub async fn create(&self, url: String, rendition: Rendition, path: PathBuf) -> Result<TaskId> {
        self.insert_with(url, rendition, path, |_| {}).await
    }

    /// Registers a task recovered from a checkpoint, `Paused` at its confirmed offset.
    pub async fn restore(
        &self,
        url: String,
        rendition: Rendition,
        path: PathBuf,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    ) -> Result<TaskId> {
        self.insert_with(url, rendition, path, |task| {
            task.state = TaskState::Paused;
            task.bytes_downloaded = bytes_downloaded;
            task.total_bytes = total_bytes.or(task.total_bytes);
        })
        .await
    }

    async fn insert_with(
        &self,
        url: String,
        rendition: Rendition,
        path: PathBuf,
        init: impl FnOnce(&mut Task),
    ) -> Result<TaskId> {
        let mut inner = self.inner.write().await;
        if inner.paths.contains_key(&path) {
            return Err(Error::PathInUse(path));
        }
        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut task = Task::new(id, url, rendition, path.clone());
        init(&mut task);
        let state = task.state;
        let (tx, _) = watch::channel(task);
        inner.tasks.insert(id, tx);
        inner.paths.insert(path, id);
        drop(inner);

        debug!(task_id = %id, state = state.name(), "task registered");
        self.publish(id, state);
        Ok(id)
    }

    pub async fn get(&self, id: TaskId) -> Result<Task> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(&id)
            .map(|tx| tx.borrow().clone())
            .ok_or(Error::NotFound(id))
    }

    /// Snapshot of every task in creation order.
    pub async fn list(&self) -> Vec<Task> {
        let inner = self.inner.read().await;
        inner.tasks.values().map(|tx| tx.borrow().clone()).collect()
    }

    /// Drops the task and releases its path. Progress subscribers see their stream end.
    pub async fn remove(&self, id: TaskId) -> Result<Task> {
        let mut inner = self.inner.write().await;
        let tx = inner.tasks.remove(&id).ok_or(Error::NotFound(id))?;
        let task = tx.borrow().clone();
        inner.paths.remove(&task.path);
        debug!(task_id = %id, "task removed");
        Ok(task)
    }

    /// Applies `f` to the task as one serialized mutation.
    pub async fn update<R>(&self, id: TaskId, f: impl FnOnce(&mut Task) -> R) -> Result<R> {
        let inner = self.inner.read().await;
        let tx = inner.tasks.get(&id).ok_or(Error::NotFound(id))?;
        let mut out = None;
        tx.send_modify(|task| out = Some(f(task)));
        out.ok_or(Error::NotFound(id))
    }

    /// Moves the task to `next`, rejecting edges the lifecycle does not allow.
    pub async fn transition(&self, id: TaskId, next: TaskState) -> Result<()> {
        self.transition_with(id, next, |_| {}).await
    }

    /// Like `transition`, also applying `f` within the same mutation.
    pub async fn transition_with(
        &self,
        id: TaskId,
        next: TaskState,
        f: impl FnOnce(&mut Task),
    ) -> Result<()> {
        let inner = self.inner.read().await;
        let tx = inner.tasks.get(&id).ok_or(Error::NotFound(id))?;
        let mut outcome = Ok(());
        tx.send_if_modified(|task| {
            if !task.state.can_become(&next) {
                outcome = Err(Error::InvalidState {
                    id,
                    state: task.state.name(),
                });
                return false;
            }
            task.state = next;
            f(task);
            true
        });
        drop(inner);

        if outcome.is_ok() {
            debug!(task_id = %id, state = next.name(), "task transition");
            self.publish(id, next);
        }
        outcome
    }

    pub async fn watch(&self, id: TaskId) -> Result<watch::Receiver<Task>> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(&id)
            .map(|tx| tx.subscribe())
            .ok_or(Error::NotFound(id))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn publish(&self, task_id: TaskId, state: TaskState) {
        // No subscribers is fine.
        let _ = self.events.send(TaskEvent {
            task_id,
            state,
            timestamp: Utc::now(),
        });
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::models::{RenditionKind, VideoQuality};

    fn rendition() -> Rendition {
        Rendition::new(
            RenditionKind::Video(VideoQuality::P720),
            "mp4",
            "http://media.invalid/v.mp4",
        )
    }

    #[tokio::test]
    async fn create_then_get_and_list_in_insertion_order() {
        let registry = TaskRegistry::new();
        let a = registry
            .create("u1".into(), rendition(), PathBuf::from("/d/a.mp4"))
            .await
            .unwrap();
        let b = registry
            .create("u2".into(), rendition(), PathBuf::from("/d/b.mp4"))
            .await
            .unwrap();

        assert_eq!(registry.get(a).await.unwrap().state, TaskState::Pending);
        let ids: Vec<_> = registry.list().await.into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[tokio::test]
    async fn duplicate_path_is_rejected_until_removed() {
        let registry = TaskRegistry::new();
        let path = PathBuf::from("/d/same.mp4");
        let id = registry.create("u".into(), rendition(), path.clone()).await.unwrap();

        let err = registry
            .create("u".into(), rendition(), path.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PathInUse(p) if p == path));

        registry.remove(id).await.unwrap();
        assert!(registry.create("u".into(), rendition(), path).await.is_ok());
    }

    #[tokio::test]
    async fn remove_missing_task_is_not_found() {
        let registry = TaskRegistry::new();
        assert!(matches!(
            registry.remove(TaskId(42)).await,
            Err(Error::NotFound(TaskId(42)))
        ));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_and_not_published() {
        let registry = TaskRegistry::new();
        let id = registry
            .create("u".into(), rendition(), PathBuf::from("/d/x.mp4"))
            .await
            .unwrap();
        let mut events = registry.subscribe_events();

        let err = registry.transition(id, TaskState::Completed).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { state: "pending", .. }));

        registry.transition(id, TaskState::Active).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.task_id, id);
        assert_eq!(event.state, TaskState::Active);
    }

    #[tokio::test]
    async fn watchers_observe_whole_updates() {
        let registry = TaskRegistry::new();
        let id = registry
            .create("u".into(), rendition(), PathBuf::from("/d/w.mp4"))
            .await
            .unwrap();
        let mut rx = registry.watch(id).await.unwrap();

        registry
            .transition_with(id, TaskState::Active, |t| {
                t.bytes_downloaded = 10;
                t.total_bytes = Some(100);
            })
            .await
            .unwrap();
        rx.changed().await.unwrap();
        let seen = rx.borrow().clone();
        assert_eq!(seen.state, TaskState::Active);
        assert_eq!(seen.bytes_downloaded, 10);

        registry
            .transition(
                id,
                TaskState::Failed {
                    reason: FailureReason::NetworkError,
                    attempts: 3,
                },
            )
            .await
            .unwrap();
        registry.remove(id).await.unwrap();
        rx.changed().await.unwrap();
        // Sender dropped with the entry.
        assert!(rx.changed().await.is_err());
    }

    #[tokio::test]
    async fn restored_tasks_start_paused() {
        let registry = TaskRegistry::new();
        let id = registry
            .restore("u".into(), rendition(), PathBuf::from("/d/r.mp4"), 512, Some(1024))
            .await
            .unwrap();
        let task = registry.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Paused);
        assert_eq!(task.bytes_downloaded, 512);
        assert_eq!(task.total_bytes, Some(1024));
    }
}
