// src/checkpoint.rs

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{checkpoint_path_for, Rendition, Task};

/// Persistent progress record kept beside a partial file, so a transfer can
/// resume after a restart without re-reading what is already on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_url: String,
    pub path: PathBuf,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub rendition: Rendition,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn from_task(task: &Task) -> Self {
        Self {
            source_url: task.source_url.clone(),
            path: task.path.clone(),
            bytes_downloaded: task.bytes_downloaded,
            total_bytes: task.total_bytes,
            rendition: task.rendition.clone(),
            saved_at: Utc::now(),
        }
    }

    pub fn sidecar_path(&self) -> PathBuf {
        checkpoint_path_for(&self.path)
    }

    /// Writes the record next to the partial file. The write goes through a
    /// temporary file and a rename so readers never see a torn record.
    pub async fn save(&self) -> Result<()> {
        let sidecar = self.sidecar_path();
        let mut tmp = sidecar.clone().into_os_string();
        tmp.push(".tmp");
        let data = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &sidecar).await?;
        debug!(path = %sidecar.display(), bytes = self.bytes_downloaded, "checkpoint saved");
        Ok(())
    }

    /// Loads the checkpoint for `target`, if one exists.
    pub async fn load(target: &Path) -> Result<Option<Self>> {
        Self::load_sidecar(&checkpoint_path_for(target)).await
    }

    pub async fn load_sidecar(sidecar: &Path) -> Result<Option<Self>> {
        match tokio::fs::read(sidecar).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove(target: &Path) {
        let sidecar = checkpoint_path_for(target);
        if let Err(e) = tokio::fs::remove_file(&sidecar).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %sidecar.display(), error = %e, "could not delete checkpoint");
            }
        }
    }

    /// Every checkpoint found directly inside `dir`. Unreadable records are skipped.
    pub async fn scan(dir: &Path) -> Result<Vec<Self>> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_sidecar = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".part.json"));
            if !is_sidecar {
                continue;
            }
            match Self::load_sidecar(&path).await {
                Ok(Some(checkpoint)) => found.push(checkpoint),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint"),
            }
        }
        found.sort_by_key(|c| c.saved_at);
        Ok(found)
    }
}
