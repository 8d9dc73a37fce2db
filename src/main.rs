// src/main.rs

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use tracing::{error, info, warn};

use tubegrab::logging;
use tubegrab::prelude::*;

/// Download a video, its audio track, or a whole playlist.
#[derive(Debug, Parser)]
#[command(name = "tubegrab", version, about)]
struct Args {
    /// Page URL of a video or playlist
    url: String,

    /// Download audio only. Without `=FORMAT` the configured format is used
    /// (mp3, m4a, wav, opus)
    #[arg(long, value_name = "FORMAT", num_args = 0..=1, require_equals = true)]
    audio: Option<Option<AudioFormat>>,

    /// Preferred video quality (best, 1080p, 720p, ...)
    #[arg(long, short)]
    quality: Option<Quality>,

    /// Treat the URL as a playlist and queue every entry
    #[arg(long)]
    playlist: bool,

    /// Configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Download directory, overriding the configuration
    #[arg(long, short)]
    directory: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.verbose);

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let default_path = dirs::config_dir().map(|dir| dir.join("tubegrab").join("config.toml"));
    let mut config = match (&args.config, default_path) {
        (Some(path), _) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        (None, Some(path)) if path.exists() => Config::load(&path)?,
        _ => Config::default(),
    };
    if let Some(dir) = &args.directory {
        config.downloads.directory = dir.clone();
    }
    if let Some(quality) = args.quality {
        config.downloads.quality = quality;
    }
    Ok(config)
}

/// Returns whether every task completed.
async fn run(args: Args) -> Result<bool> {
    let config = load_config(&args)?;
    let quality = match args.audio {
        Some(format) => config.downloads.audio_quality(format),
        None => config.downloads.quality,
    };

    let extractor = Arc::new(YtDlpExtractor::new(&config.extractor));
    let manager = DownloadManager::new(config, extractor)?;

    let mut ids = manager.recover().await?;
    if !ids.is_empty() {
        info!(count = ids.len(), "resuming interrupted downloads");
        manager.resume_all().await;
    }

    let mut failed = 0usize;
    if args.playlist {
        let mut items = manager.submit_playlist(&args.url, quality).await?;
        while let Some(item) = items.next().await {
            match item {
                PlaylistItem::Queued(id) => {
                    watch_progress(&manager, id).await;
                    ids.push(id);
                }
                PlaylistItem::Skipped { index, path, .. } => {
                    info!(index, path = %path.display(), "skipped, already downloaded");
                }
                PlaylistItem::Failed { index, url, error } => {
                    if owned_by_recovered_task(&error) {
                        info!(index, url = %url, "already being downloaded by a recovered task");
                    } else {
                        warn!(index, url = %url, %error, "entry not queued");
                        failed += 1;
                    }
                }
            }
        }
    } else {
        match manager.submit_single(&args.url, quality).await {
            Ok(id) => {
                watch_progress(&manager, id).await;
                ids.push(id);
            }
            Err(e) if owned_by_recovered_task(&e) => {
                info!(error = %e, "already being downloaded by a recovered task");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let wait_all = async {
        let mut results = Vec::with_capacity(ids.len());
        for id in &ids {
            results.push(manager.wait(*id).await);
        }
        results
    };

    let results = tokio::select! {
        results = wait_all => results,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, pausing transfers");
            manager.shutdown().await;
            return Ok(false);
        }
    };

    for result in results {
        let task = result?;
        match task.state {
            TaskState::Completed => info!(
                task_id = %task.id,
                path = %task.path.display(),
                size = %format_size(task.bytes_downloaded),
                "done"
            ),
            state => {
                error!(task_id = %task.id, url = %task.source_url, ?state, "download did not complete");
                failed += 1;
            }
        }
    }
    manager.shutdown().await;
    Ok(failed == 0)
}

/// A recovered task already writes this file; its own result decides the exit code.
fn owned_by_recovered_task(error: &Error) -> bool {
    matches!(error, Error::PathInUse(_))
}

async fn watch_progress(manager: &DownloadManager, id: TaskId) {
    let mut snapshots = match manager.subscribe_progress(id).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(task_id = %id, error = %e, "no progress for task");
            return;
        }
    };
    tokio::spawn(async move {
        while let Some(s) = snapshots.next().await {
            let percent = s.percent().map_or_else(|| "?".to_string(), |p| format!("{p:.1}%"));
            info!(
                task_id = %s.task_id,
                state = s.state.name(),
                progress = %percent,
                done = %format_size(s.bytes_done),
                speed = %format!("{}/s", format_size(s.speed as u64)),
                eta = %format_eta(s.eta),
                "progress"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn path_owned_by_recovered_task_is_not_a_failure() {
        assert!(owned_by_recovered_task(&Error::PathInUse(PathBuf::from("/dl/a.mp4"))));
        assert!(!owned_by_recovered_task(&Error::Extraction("private video".into())));
    }

    #[test]
    fn bare_audio_flag_takes_no_value() {
        let args = Args::try_parse_from(["tubegrab", "--audio", "https://video.example/watch?v=a"]).unwrap();
        assert_eq!(args.audio, Some(None));
        assert_eq!(args.url, "https://video.example/watch?v=a");

        let args = Args::try_parse_from(["tubegrab", "--audio=mp3", "https://video.example/watch?v=a"]).unwrap();
        assert_eq!(args.audio, Some(Some(AudioFormat::Mp3)));
    }
}
