//! Hand-off of queue changes from other processes.
//!
//! Only one process holds the [`StoreLock`](super::StoreLock) and owns the
//! queue. Other processes post [`QueueRequest`]s into `<store>.inbox/`, one
//! JSON file each, and the owner applies them in posting order. Files are
//! written under a temporary name and renamed into place, so the owner never
//! reads half a request.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::QueueError;
use super::job::JobId;
use super::manager::QueueManager;
use super::spec::MuxSpec;
use super::store::StoreError;

const REQUEST_EXT: &str = "json";

/// A change to the queue, applied by whichever process owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueueRequest {
    Submit { spec: MuxSpec },
    Cancel { job_id: JobId },
    Remove { job_id: JobId },
    ClearCompleted,
}

impl QueueRequest {
    /// Carry out the request on `manager`, returning a one-line summary.
    pub async fn apply(self, manager: &QueueManager) -> Result<String, QueueError> {
        match self {
            Self::Submit { spec } => manager.submit(spec).await,
            Self::Cancel { job_id } => {
                manager.cancel(&job_id).await?;
                Ok(format!("canceled {}", job_id))
            }
            Self::Remove { job_id } => {
                manager.remove(&job_id).await?;
                Ok(format!("removed {}", job_id))
            }
            Self::ClearCompleted => {
                let removed = manager.clear_completed().await?;
                Ok(format!("removed {} job(s)", removed.len()))
            }
        }
    }
}

/// Directory of pending [`QueueRequest`]s next to a queue store.
#[derive(Debug, Clone)]
pub struct Inbox {
    dir: PathBuf,
}

impl Inbox {
    /// The inbox belonging to the store at `store_path`.
    pub fn for_store(store_path: &Path) -> Self {
        let mut name = store_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "queue.json".into());
        name.push(".inbox");
        Self {
            dir: store_path.with_file_name(name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queue `request` for the owning process. Returns the request id.
    pub async fn post(&self, request: &QueueRequest) -> Result<String, StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error("creating inbox", &self.dir, e))?;

        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let id = format!("{:020}-{}", nanos, uuid::Uuid::new_v4().simple());
        let path = self.dir.join(format!("{}.{}", id, REQUEST_EXT));
        let temp_path = self.dir.join(format!(".{}.tmp", id));

        let json = serde_json::to_vec(request)?;
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| io_error("creating", &temp_path, e))?;
        file.write_all(&json)
            .await
            .map_err(|e| io_error("writing", &temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("syncing", &temp_path, e))?;
        drop(file);

        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| io_error("posting", &path, e))?;

        debug!(request_id = %id, "Request posted to inbox");
        Ok(id)
    }

    /// Remove and return every posted request, oldest first.
    ///
    /// Unreadable requests are renamed to `*.bad` and skipped.
    pub async fn take(&self) -> Result<Vec<(String, QueueRequest)>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("listing inbox", &self.dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("listing inbox", &self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(REQUEST_EXT) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut requests = Vec::with_capacity(paths.len());
        for path in paths {
            let id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();

            let parsed = match tokio::fs::read(&path).await {
                Ok(raw) => serde_json::from_slice::<QueueRequest>(&raw),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read inbox request");
                    continue;
                }
            };

            match parsed {
                Ok(request) => {
                    tokio::fs::remove_file(&path)
                        .await
                        .map_err(|e| io_error("removing", &path, e))?;
                    requests.push((id, request));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding malformed inbox request");
                    let bad = path.with_extension("bad");
                    tokio::fs::rename(&path, &bad)
                        .await
                        .map_err(|e| io_error("setting aside", &path, e))?;
                }
            }
        }
        Ok(requests)
    }

    /// Apply every posted request to `manager`. Returns how many were taken.
    ///
    /// A request the manager rejects is logged and dropped.
    pub async fn apply(&self, manager: &QueueManager) -> Result<usize, StoreError> {
        let requests = self.take().await?;
        let count = requests.len();

        for (id, request) in requests {
            match request.apply(manager).await {
                Ok(summary) => info!(request_id = %id, result = %summary, "Applied inbox request"),
                Err(e) => warn!(request_id = %id, error = %e, "Inbox request rejected"),
            }
        }
        Ok(count)
    }
}

fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}
