#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path as UrlPath, State};
use axum::http::header::{CONTENT_RANGE, RANGE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use tubegrab::prelude::*;

/// How the media server answers one file.
#[derive(Clone, Default)]
pub struct Route {
    pub body: Vec<u8>,
    /// Answer with this status instead of the body.
    pub status: Option<u16>,
    /// Statuses for the first requests, one each, before the body is served.
    pub fail_first: Vec<u16>,
    /// Always send the whole body with 200.
    pub ignore_range: bool,
    /// Answer ranged requests with 206 for the whole body, starting at byte 0.
    pub misplaced_range: bool,
}

#[derive(Default)]
struct ServerState {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<(String, Option<String>)>>,
}

/// Local HTTP server standing in for a media host. Honours `Range: bytes=N-`.
pub struct MediaServer {
    pub base: String,
    state: Arc<ServerState>,
}

impl MediaServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/media/{name}", get(serve))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{addr}"),
            state,
        }
    }

    /// Serves `body` at `/media/<name>` and returns its URL.
    pub fn file(&self, name: &str, body: Vec<u8>) -> String {
        self.route(
            name,
            Route {
                body,
                ..Route::default()
            },
        )
    }

    pub fn route(&self, name: &str, route: Route) -> String {
        self.state.routes.lock().unwrap().insert(name.to_string(), route);
        format!("{}/media/{name}", self.base)
    }

    /// `Range` headers received for `name`, in arrival order.
    pub fn ranges(&self, name: &str) -> Vec<Option<String>> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, range)| range.clone())
            .collect()
    }
}

async fn serve(
    State(state): State<Arc<ServerState>>,
    UrlPath(name): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.requests.lock().unwrap().push((name.clone(), range.clone()));

    let route = {
        let mut routes = state.routes.lock().unwrap();
        let Some(route) = routes.get_mut(&name) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        if !route.fail_first.is_empty() {
            let status = route.fail_first.remove(0);
            return StatusCode::from_u16(status).unwrap().into_response();
        }
        route.clone()
    };
    if let Some(status) = route.status {
        return StatusCode::from_u16(status).unwrap().into_response();
    }

    let len = route.body.len();
    if route.misplaced_range && range.is_some() {
        return (
            StatusCode::PARTIAL_CONTENT,
            [(CONTENT_RANGE, format!("bytes 0-{}/{len}", len - 1))],
            route.body,
        )
            .into_response();
    }
    let start = range
        .filter(|_| !route.ignore_range)
        .and_then(|r| r.strip_prefix("bytes=")?.strip_suffix('-')?.parse::<usize>().ok());
    match start {
        Some(start) if start < len => (
            StatusCode::PARTIAL_CONTENT,
            [(CONTENT_RANGE, format!("bytes {start}-{}/{len}", len - 1))],
            route.body[start..].to_vec(),
        )
            .into_response(),
        Some(_) => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        None => (StatusCode::OK, route.body).into_response(),
    }
}

type Answer = (std::result::Result<MediaInfo, String>, Duration);

/// Extractor answering from a script instead of the network. Each page URL
/// has a list of answers; the last one repeats.
#[derive(Default)]
pub struct ScriptedExtractor {
    pages: Mutex<HashMap<String, VecDeque<Answer>>>,
    calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn page(&self, url: &str, info: MediaInfo) {
        self.push(url, (Ok(info), Duration::ZERO));
    }

    /// Like `page`, but the answer takes `delay` to arrive.
    pub fn slow_page(&self, url: &str, info: MediaInfo, delay: Duration) {
        self.push(url, (Ok(info), delay));
    }

    pub fn fail(&self, url: &str, message: &str) {
        self.push(url, (Err(message.to_string()), Duration::ZERO));
    }

    fn push(&self, url: &str, answer: Answer) {
        self.pages
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(answer);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn resolve(&self, url: &str) -> Result<MediaInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (answer, delay) = {
            let mut pages = self.pages.lock().unwrap();
            let answers = pages
                .get_mut(url)
                .ok_or_else(|| Error::UnsupportedUrl(url.to_string()))?;
            if answers.len() > 1 {
                answers.pop_front().unwrap()
            } else {
                answers.front().cloned().unwrap()
            }
        };
        tokio::time::sleep(delay).await;
        answer.map_err(Error::Extraction)
    }
}

pub fn video(quality: VideoQuality, locator: &str, size: usize) -> Rendition {
    let mut rendition = Rendition::new(RenditionKind::Video(quality), "mp4", locator);
    rendition.approx_size = Some(size as u64);
    rendition
}

pub fn media(title: &str, renditions: Vec<Rendition>) -> MediaInfo {
    MediaInfo {
        title: title.to_string(),
        renditions,
        entries: None,
    }
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Settings that keep tests quick: short backoff, frequent samples.
pub fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.downloads.directory = dir.to_path_buf();
    config.downloads.max_concurrent = 2;
    config.transfer.retry_backoff_ms = 10;
    config.transfer.max_backoff_ms = 50;
    config.transfer.checkpoint_interval_ms = 50;
    config.transfer.connect_timeout_secs = 5;
    config.transfer.read_timeout_secs = 5;
    config.progress.sample_interval_ms = 20;
    config
}

/// Polls the task until `done` holds, panicking after ten seconds.
pub async fn wait_until(
    manager: &DownloadManager,
    id: TaskId,
    done: impl Fn(&Task) -> bool,
) -> Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let task = manager.get(id).await.unwrap();
        if done(&task) {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on task {id}, last state {:?}",
            task.state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn finished(manager: &DownloadManager, id: TaskId) -> Task {
    tokio::time::timeout(Duration::from_secs(10), manager.wait(id))
        .await
        .expect("task did not finish in time")
        .unwrap()
}
