// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Background stats-file writer.
//!
//! Producers hand over the latest document and return immediately; a single
//! writer task persists whatever is newest when it gets to it. Intermediate
//! documents may be skipped (last write wins), but [`StatsWriter::finish`]
//! only returns once the final submitted document is on disk.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct StatsWriter {
    path: PathBuf,
    latest: watch::Sender<Option<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl StatsWriter {
    /// Start a writer task for `path`. Must be called inside a Tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (latest, mut rx) = watch::channel(None::<Vec<u8>>);
        let task_path = path.clone();

        let task = tokio::spawn(async move {
            // Yields every unseen value, including one sent just before the
            // sender was dropped.
            while rx.changed().await.is_ok() {
                let data = rx.borrow_and_update().clone();
                if let Some(data) = data {
                    write_atomic(&task_path, &data).await;
                }
            }
        });

        Self { path, latest, task }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue `value` as the next document. Never blocks on disk.
    pub fn submit<T: Serialize>(&self, value: &T) {
        match serde_json::to_vec_pretty(value) {
            Ok(data) => {
                self.latest.send_replace(Some(data));
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to serialize stats");
            }
        }
    }

    /// Flush the last submitted document and stop the writer.
    pub async fn finish(self) {
        let Self { path, latest, task } = self;
        drop(latest);
        if let Err(e) = task.await {
            tracing::error!(path = %path.display(), error = %e, "Stats writer task failed");
        }
    }
}

/// Write through a sibling temp file so readers never see a partial document.
async fn write_atomic(path: &Path, data: &[u8]) {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    match write_then_rename(&tmp, path, data).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Wrote stats"),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to write stats file");
            let _ = tokio::fs::remove_file(&tmp).await;
        }
    }
}

async fn write_then_rename(tmp: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(tmp, data).await?;
    tokio::fs::rename(tmp, path).await
}
