//! Durable storage of the whole queue.
//!
//! [`QueueStore`] is the persistence backend (load everything / save
//! everything). [`DurableStore`] wraps a backend and applies start-up
//! recovery: jobs left `processing` by a dead process become `failed`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::job::{Job, JobStatus};

/// Bump when the on-disk job format changes incompatibly.
pub const STORE_VERSION: u32 = 1;

/// Error recorded on jobs that were mid-flight when the process died.
pub const INTERRUPTED_ERROR: &str = "interrupted by restart";

/// Attempts made to take a busy store lock.
const LOCK_ATTEMPTS: u32 = 5;

/// Pause between attempts to take a busy store lock.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Persistence errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error while {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue store has format version {found}, expected {expected}", expected = STORE_VERSION)]
    IncompatibleVersion { found: u64 },

    #[error("{0}")]
    Unavailable(String),
}

impl StoreError {
    fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Backend that persists the full, ordered job list.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Load every job in queue order.
    ///
    /// Never modifies what is stored.
    async fn load_all(&self) -> Result<Vec<Job>, StoreError>;

    /// Set aside stored data with an incompatible format version so a fresh
    /// queue can replace it.
    async fn discard_incompatible(&self, _found: u64) -> Result<(), StoreError> {
        Ok(())
    }

    /// Replace the stored queue with `jobs`.
    ///
    /// Must be atomic: after a crash either the old or the new list is visible.
    async fn save_all(&self, jobs: &[Job]) -> Result<(), StoreError>;
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    version: u32,
    jobs: &'a [Job],
}

#[derive(Deserialize)]
struct StoreFile {
    jobs: Vec<Job>,
}

/// Stores the queue as a single JSON document, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "queue.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn backup_path(&self, version: u64) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "queue.json".into());
        name.push(format!(".v{}.bak", version));
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl QueueStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<Job>, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No queue file yet, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(StoreError::io("reading", &self.path, e)),
        };

        let value: serde_json::Value = serde_json::from_slice(&raw)?;
        let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0);

        if version != u64::from(STORE_VERSION) {
            return Err(StoreError::IncompatibleVersion { found: version });
        }

        let file: StoreFile = serde_json::from_value(value)?;
        Ok(file.jobs)
    }

    async fn discard_incompatible(&self, found: u64) -> Result<(), StoreError> {
        let backup = self.backup_path(found);
        warn!(
            found = found,
            expected = STORE_VERSION,
            backup = %backup.display(),
            "Queue file version mismatch, discarding incompatible jobs"
        );
        tokio::fs::copy(&self.path, &backup)
            .await
            .map_err(|e| StoreError::io("backing up", &backup, e))?;
        Ok(())
    }

    async fn save_all(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(&StoreFileRef {
            version: STORE_VERSION,
            jobs,
        })?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io("creating directory", parent, e))?;
        }

        // Write atomically using a temp file
        let temp_path = self.temp_path();
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| StoreError::io("creating", &temp_path, e))?;
        file.write_all(&json)
            .await
            .map_err(|e| StoreError::io("writing", &temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io("syncing", &temp_path, e))?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| StoreError::io("replacing", &self.path, e))?;

        debug!(path = %self.path.display(), jobs = jobs.len(), "Queue persisted");
        Ok(())
    }
}

/// Keeps the queue in memory only. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: parking_lot::Mutex<Vec<Job>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, as if a previous process had saved `jobs`.
    pub fn with_jobs(jobs: Vec<Job>) -> Self {
        Self {
            jobs: parking_lot::Mutex::new(jobs),
        }
    }

    /// Snapshot of what is currently stored.
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.snapshot())
    }

    async fn save_all(&self, jobs: &[Job]) -> Result<(), StoreError> {
        *self.jobs.lock() = jobs.to_vec();
        Ok(())
    }
}

/// Queue persistence with start-up recovery.
#[derive(Clone)]
pub struct DurableStore {
    backend: Arc<dyn QueueStore>,
}

impl DurableStore {
    pub fn new(backend: Arc<dyn QueueStore>) -> Self {
        Self { backend }
    }

    /// Rehydrate the queue.
    ///
    /// Jobs found `processing` belonged to a process that is gone; they are
    /// marked `failed` and the recovered list is written back before returning.
    /// A store in an incompatible format is backed up and replaced by an empty queue.
    pub async fn load(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = match self.backend.load_all().await {
            Ok(jobs) => jobs,
            Err(StoreError::IncompatibleVersion { found }) => {
                self.backend.discard_incompatible(found).await?;
                self.backend.save_all(&[]).await?;
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mut recovered = 0usize;
        for job in &mut jobs {
            match job.status {
                JobStatus::Processing => {
                    warn!(job_id = %job.id, "Job was processing at shutdown, marking failed");
                    job.mark_failed(INTERRUPTED_ERROR);
                    recovered += 1;
                }
                JobStatus::Pending => job.progress = 0.0,
                _ => {}
            }
        }

        if recovered > 0 {
            self.backend.save_all(&jobs).await?;
        }

        info!(
            jobs = jobs.len(),
            recovered = recovered,
            "Queue loaded from store"
        );
        Ok(jobs)
    }

    /// Persist the full queue.
    pub async fn save(&self, jobs: &[Job]) -> Result<(), StoreError> {
        self.backend.save_all(jobs).await
    }
}

/// Exclusive advisory lock on `<store>.lock`, held while a process owns the queue.
///
/// The OS drops the lock when the process dies, so a crash never leaves it stuck.
#[derive(Debug)]
pub struct StoreLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl StoreLock {
    /// Take the lock for the store at `store_path`, failing if another process holds it.
    ///
    /// [`StoreLock::is_held`] briefly takes the lock itself, so a busy lock is
    /// retried a few times before giving up.
    pub async fn acquire(store_path: &Path) -> Result<Self, StoreError> {
        use fs2::FileExt;

        let path = lock_path(store_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::io("creating store directory", parent, e))?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io("opening lock file", &path, e))?;

        let mut attempt = 1;
        while file.try_lock_exclusive().is_err() {
            if attempt >= LOCK_ATTEMPTS {
                return Err(StoreError::Unavailable(format!(
                    "queue store {} is in use by another muxq process",
                    store_path.display()
                )));
            }
            attempt += 1;
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }

        debug!(path = %path.display(), "Store lock acquired");
        Ok(Self { _file: file, path })
    }

    /// Whether some other process currently holds the lock.
    ///
    /// The check holds the lock for an instant, which [`StoreLock::acquire`] rides out.
    pub fn is_held(store_path: &Path) -> bool {
        use fs2::FileExt;

        match std::fs::File::open(lock_path(store_path)) {
            Ok(file) => file.try_lock_exclusive().is_err(),
            Err(_) => false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_path(store_path: &Path) -> PathBuf {
    let mut name = store_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "queue.json".into());
    name.push(".lock");
    store_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::spec::MuxSpec;
    use tempfile::TempDir;

    fn job(output: &str) -> Job {
        Job::new(MuxSpec::new(output).with_video("a.mp4"))
    }

    #[tokio::test]
    async fn test_json_store_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("queue.json"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_preserves_order() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("queue.json"));

        let jobs = vec![job("1.mp4"), job("2.mp4"), job("3.mp4")];
        store.save_all(&jobs).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|j| j.id.as_str()).collect();
        let expected: Vec<_> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, expected);
        assert!(!store.temp_path().exists(), "temp file must be renamed away");
    }

    #[tokio::test]
    async fn test_json_store_version_mismatch_is_reported_without_writing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, r#"{"version": 0, "jobs": [{"legacy": true}]}"#).unwrap();

        let err = JsonFileStore::new(&path).load_all().await.unwrap_err();
        assert!(matches!(err, StoreError::IncompatibleVersion { found: 0 }));
        assert!(!dir.path().join("queue.json.v0.bak").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_durable_load_backs_up_incompatible_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        let legacy = r#"{"version": 0, "jobs": [{"legacy": true}]}"#;
        std::fs::write(&path, legacy).unwrap();

        let backend = Arc::new(JsonFileStore::new(&path));
        let jobs = DurableStore::new(backend.clone()).load().await.unwrap();
        assert!(jobs.is_empty());

        let backup = dir.path().join("queue.json.v0.bak");
        assert_eq!(std::fs::read_to_string(backup).unwrap(), legacy);
        assert!(backend.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = JsonFileStore::new(&path).load_all().await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_load_marks_processing_jobs_failed() {
        let mut running = job("1.mp4");
        running.mark_processing();
        running.progress = 37.0;
        let pending = job("2.mp4");
        let mut done = job("3.mp4");
        done.mark_processing();
        done.mark_completed();

        let backend = Arc::new(MemoryStore::with_jobs(vec![
            running.clone(),
            pending.clone(),
            done.clone(),
        ]));
        let store = DurableStore::new(backend.clone());

        let jobs = store.load().await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].error.as_deref(), Some(INTERRUPTED_ERROR));
        assert!(jobs[0].completed_at.is_some());
        assert_eq!(jobs[1], pending);
        assert_eq!(jobs[2], done);

        // The recovery itself is durable.
        assert_eq!(backend.snapshot()[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_store_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("queue.json");
        assert!(!StoreLock::is_held(&store_path));

        let lock = StoreLock::acquire(&store_path).await.unwrap();
        assert_eq!(lock.path(), dir.path().join("queue.json.lock"));
        assert!(StoreLock::is_held(&store_path));
        assert!(matches!(
            StoreLock::acquire(&store_path).await,
            Err(StoreError::Unavailable(_))
        ));

        drop(lock);
        assert!(!StoreLock::is_held(&store_path));
        StoreLock::acquire(&store_path).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_waits_out_a_brief_holder() {
        use fs2::FileExt;

        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("queue.json");
        drop(StoreLock::acquire(&store_path).await.unwrap());

        // Stand-in for a concurrent `is_held` check.
        let checker = std::fs::File::open(lock_path(&store_path)).unwrap();
        checker.try_lock_exclusive().unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            FileExt::unlock(&checker).unwrap();
        });

        let lock = StoreLock::acquire(&store_path).await.unwrap();
        release.await.unwrap();
        assert!(lock.path().exists());
    }
}
