// src/progress.rs

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::ProgressConfig;
use crate::error::Result;
use crate::models::{ProgressSnapshot, Task, TaskId, TaskState};
use crate::registry::TaskRegistry;

/// Turns the registry's byte counters into per-task snapshot streams.
///
/// Each subscription samples its task on a fixed interval and smooths the
/// transfer rate with an exponentially weighted average. Subscribers never
/// touch the transfer itself, so any number of them can attach.
#[derive(Clone)]
pub struct ProgressReporter {
    registry: Arc<TaskRegistry>,
    interval: Duration,
    smoothing: f64,
}

impl ProgressReporter {
    pub fn new(registry: Arc<TaskRegistry>, config: &ProgressConfig) -> Self {
        Self {
            registry,
            interval: config.sample_interval(),
            smoothing: config.smoothing,
        }
    }

    /// Snapshots for `id` until it reaches a terminal state (that snapshot is
    /// the last one) or leaves the registry.
    pub async fn subscribe(&self, id: TaskId) -> Result<BoxStream<'static, ProgressSnapshot>> {
        let rx = self.registry.watch(id).await?;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let sampler = Sampler {
            rx,
            ticker,
            smoothing: self.smoothing,
            speed: None,
            last_sample: None,
            last_emitted: None,
            finished: false,
        };
        Ok(stream::unfold(sampler, |mut s| async move {
            let snapshot = s.next_snapshot().await?;
            Some((snapshot, s))
        })
        .boxed())
    }
}

struct Sampler {
    rx: watch::Receiver<Task>,
    ticker: Interval,
    smoothing: f64,
    speed: Option<f64>,
    last_sample: Option<(Instant, u64)>,
    last_emitted: Option<(u64, TaskState)>,
    finished: bool,
}

impl Sampler {
    async fn next_snapshot(&mut self) -> Option<ProgressSnapshot> {
        if self.finished {
            return None;
        }
        loop {
            self.ticker.tick().await;
            let closed = self.rx.has_changed().is_err();
            let task = self.rx.borrow_and_update().clone();

            let sample = self.sample(&task);
            // Emitted bytes never go down, even if a sample raced a reset.
            let floor = self.last_emitted.map_or(0, |(bytes, _)| bytes);
            let bytes_done = task.bytes_downloaded.max(floor);

            if task.state.is_terminal() {
                self.finished = true;
                return Some(snapshot(&task, bytes_done, sample));
            }
            if closed {
                return None;
            }
            // Active tasks report every tick so a stall shows as falling speed.
            let changed = self.last_emitted != Some((bytes_done, task.state));
            if changed || task.state == TaskState::Active {
                self.last_emitted = Some((bytes_done, task.state));
                return Some(snapshot(&task, bytes_done, sample));
            }
        }
    }

    fn sample(&mut self, task: &Task) -> Sample {
        let now = Instant::now();
        let bytes = task.bytes_downloaded;
        let previous = self.last_sample.replace((now, bytes));

        if task.state != TaskState::Active {
            self.speed = None;
            return Sample::idle();
        }
        let Some((at, before)) = previous else {
            return Sample::idle();
        };
        let elapsed = now.duration_since(at).as_secs_f64();
        if elapsed <= 0.0 {
            return Sample {
                speed: self.speed.unwrap_or(0.0),
                moving: true,
            };
        }

        let moved = bytes.saturating_sub(before);
        let instant = moved as f64 / elapsed;
        let mut smoothed = match self.speed {
            None => instant,
            Some(prev) => self.smoothing.mul_add(instant, (1.0 - self.smoothing) * prev),
        };
        if smoothed < 1.0 {
            smoothed = 0.0;
        }
        self.speed = Some(smoothed);
        Sample {
            speed: smoothed,
            moving: moved > 0,
        }
    }
}

/// Smoothed rate at one tick, and whether any bytes arrived since the last one.
#[derive(Clone, Copy)]
struct Sample {
    speed: f64,
    moving: bool,
}

impl Sample {
    fn idle() -> Self {
        Self {
            speed: 0.0,
            moving: false,
        }
    }
}

fn snapshot(task: &Task, bytes_done: u64, sample: Sample) -> ProgressSnapshot {
    // No arrival estimate while stalled; the decaying speed would promise one.
    let eta_speed = if sample.moving { sample.speed } else { 0.0 };
    ProgressSnapshot {
        task_id: task.id,
        bytes_done,
        bytes_total: task.total_bytes,
        speed: sample.speed,
        eta: eta(bytes_done, task.total_bytes, eta_speed),
        state: task.state,
        timestamp: Utc::now(),
    }
}

/// `(total - done) / speed`; unknown without a total or while nothing moves.
pub fn eta(done: u64, total: Option<u64>, speed: f64) -> Option<Duration> {
    let total = total?;
    if done >= total {
        return Some(Duration::ZERO);
    }
    if speed <= 0.0 || !speed.is_finite() {
        return None;
    }
    Some(Duration::from_secs_f64((total - done) as f64 / speed))
}

#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(d) => {
            let secs = d.as_secs();
            format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
        None => "--:--:--".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::error::FailureReason;
    use crate::models::{AudioFormat, Rendition, RenditionKind};

    fn reporter(registry: Arc<TaskRegistry>) -> ProgressReporter {
        let config = ProgressConfig {
            sample_interval_ms: 20,
            smoothing: 0.5,
        };
        ProgressReporter::new(registry, &config)
    }

    async fn task(registry: &TaskRegistry) -> TaskId {
        let rendition = Rendition::new(RenditionKind::Audio(AudioFormat::Opus), "webm", "http://m/a");
        registry
            .create("http://page/a".into(), rendition, PathBuf::from("/tmp/a.webm"))
            .await
            .unwrap()
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(format_size(2 * 1024u64.pow(4)), "2.00 TB");
    }

    #[test]
    fn eta_formatting() {
        assert_eq!(format_eta(Some(Duration::from_secs(3725))), "01:02:05"); // 1h 2m 5s
        assert_eq!(format_eta(None), "--:--:--");
    }

    #[test]
    fn eta_needs_total_and_speed() {
        assert_eq!(eta(50, Some(150), 10.0), Some(Duration::from_secs(10)));
        assert_eq!(eta(50, None, 10.0), None);
        assert_eq!(eta(50, Some(150), 0.0), None);
        assert_eq!(eta(150, Some(150), 0.0), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn stream_follows_counters_and_ends_on_terminal_state() {
        let registry = Arc::new(TaskRegistry::new());
        let id = task(&registry).await;
        let mut snapshots = reporter(registry.clone()).subscribe(id).await.unwrap();

        let first = snapshots.next().await.unwrap();
        assert_eq!(first.state, TaskState::Pending);
        assert_eq!(first.bytes_done, 0);

        registry
            .transition_with(id, TaskState::Active, |t| {
                t.bytes_downloaded = 100;
                t.total_bytes = Some(1000);
            })
            .await
            .unwrap();
        let active = snapshots.next().await.unwrap();
        assert_eq!(active.state, TaskState::Active);
        assert_eq!(active.bytes_done, 100);

        registry.update(id, |t| t.bytes_downloaded = 600).await.unwrap();
        let moving = snapshots.next().await.unwrap();
        assert_eq!(moving.bytes_done, 600);
        assert!(moving.speed > 0.0);
        assert!(moving.eta.is_some());

        registry
            .transition(
                id,
                TaskState::Failed {
                    reason: FailureReason::NetworkError,
                    attempts: 1,
                },
            )
            .await
            .unwrap();
        let last = snapshots.next().await.unwrap();
        assert!(last.state.is_terminal());
        assert!(snapshots.next().await.is_none());
    }

    #[tokio::test]
    async fn stalled_transfer_keeps_reporting_with_falling_speed() {
        let registry = Arc::new(TaskRegistry::new());
        let id = task(&registry).await;
        let mut snapshots = reporter(registry.clone()).subscribe(id).await.unwrap();
        snapshots.next().await.unwrap();

        registry
            .transition_with(id, TaskState::Active, |t| {
                t.bytes_downloaded = 100;
                t.total_bytes = Some(1_000_000);
            })
            .await
            .unwrap();
        snapshots.next().await.unwrap();
        registry.update(id, |t| t.bytes_downloaded = 5000).await.unwrap();
        let moving = snapshots.next().await.unwrap();
        assert!(moving.speed > 0.0);
        assert!(moving.eta.is_some());

        let mut previous = moving.speed;
        for _ in 0..3 {
            let stalled = tokio::time::timeout(Duration::from_millis(200), snapshots.next())
                .await
                .expect("no snapshot while stalled")
                .unwrap();
            assert_eq!(stalled.bytes_done, 5000);
            assert_eq!(stalled.state, TaskState::Active);
            assert!(stalled.speed < previous || stalled.speed == 0.0);
            assert_eq!(stalled.eta, None);
            previous = stalled.speed;
        }
    }

    #[tokio::test]
    async fn stream_ends_when_task_is_dropped() {
        let registry = Arc::new(TaskRegistry::new());
        let id = task(&registry).await;
        let mut snapshots = reporter(registry.clone()).subscribe(id).await.unwrap();
        snapshots.next().await.unwrap();

        registry.remove(id).await.unwrap();
        assert!(snapshots.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_task_cannot_be_watched() {
        let registry = Arc::new(TaskRegistry::new());
        assert!(reporter(registry).subscribe(TaskId(9)).await.is_err());
    }
}
