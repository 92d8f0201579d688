//! Job queue: records, persistence, live events, and the manager tying them together.

pub mod events;
pub mod inbox;
pub mod job;
pub mod manager;
pub mod spec;
pub mod store;

pub use events::{DEFAULT_EVENT_BUFFER, EventHub, QueueEvent, RecvError, Subscription};
pub use inbox::{Inbox, QueueRequest};
pub use job::{Job, JobId, JobStatus};
pub use manager::{QueueConfig, QueueManager, QueueStatus};
pub use spec::{AudioTrack, MuxSpec, SubtitleTrack, VideoTrack};
pub use store::{
    DurableStore, INTERRUPTED_ERROR, JsonFileStore, MemoryStore, QueueStore, STORE_VERSION,
    StoreError, StoreLock,
};

use thiserror::Error;

/// Errors returned by [`QueueManager`] operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The submitted spec was rejected; nothing was stored.
    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Pending and processing jobs must be canceled before removal.
    #[error("Job {job_id} is {status} and cannot be removed; cancel it first")]
    JobNotRemovable { job_id: JobId, status: JobStatus },

    /// The change could not be written, so it was not applied.
    #[error("Failed to persist queue: {0}")]
    Persistence(#[from] StoreError),

    #[error("Job {0} did not stop within the cancel timeout")]
    CancelTimedOut(JobId),
}
