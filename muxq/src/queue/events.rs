//! Live queue updates.
//!
//! Every subscriber first receives an [`QueueEvent::Init`] snapshot and then
//! each later event in the order the queue manager produced it. Buffers are
//! bounded per subscriber: a subscriber that falls behind is cut off with
//! [`RecvError::Lagged`] and has to subscribe again for a fresh snapshot.
//! Publishing never waits on subscribers.

use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

use super::job::{Job, JobId};
use super::manager::QueueStatus;

/// Default per-subscriber buffer.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Events broadcast by the queue manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Full state, sent once to each new subscriber.
    Init {
        jobs: Vec<Job>,
        status: QueueStatus,
    },
    /// A job was submitted.
    JobAdded { job: Job },
    /// A job moved to another status.
    JobStatusChanged { job: Job },
    /// The processing job made progress.
    JobProgress {
        job_id: JobId,
        progress: f64,
        message: String,
    },
    /// Jobs were deleted by `remove` or `clear_completed`.
    JobsRemoved { job_ids: Vec<JobId> },
    /// The running flag flipped.
    QueueState { status: QueueStatus },
    /// The queue is running and nothing is left to dispatch.
    QueueDrained,
}

impl QueueEvent {
    /// Short event name, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::JobAdded { .. } => "job_added",
            Self::JobStatusChanged { .. } => "job_status_changed",
            Self::JobProgress { .. } => "job_progress",
            Self::JobsRemoved { .. } => "jobs_removed",
            Self::QueueState { .. } => "queue_state",
            Self::QueueDrained => "queue_drained",
        }
    }
}

/// Why a subscription stopped delivering events.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// The subscriber fell behind and `skipped` events were dropped.
    /// The subscription is finished; subscribe again to resynchronise.
    #[error("subscriber lagged behind by {skipped} events")]
    Lagged { skipped: u64 },
    /// The hub is gone, or the subscription already ended.
    #[error("event hub closed")]
    Closed,
}

/// Fan-out hub for [`QueueEvent`]s.
pub struct EventHub {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventHub {
    /// Create a hub whose subscribers may buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: QueueEvent) {
        // Ignore the SendError, it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Register a subscriber whose first event is `snapshot`.
    ///
    /// The caller must make sure no event is published between taking the
    /// snapshot and this call, otherwise the subscriber misses it.
    pub fn subscribe(&self, snapshot: QueueEvent) -> Subscription {
        Subscription {
            init: Some(snapshot),
            rx: Some(self.sender.subscribe()),
        }
    }

    /// Number of live subscribers. Dropped subscriptions are not counted.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

/// One observer's view of the event stream.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    init: Option<QueueEvent>,
    rx: Option<broadcast::Receiver<QueueEvent>>,
}

impl Subscription {
    /// Receive the next event.
    pub async fn recv(&mut self) -> Result<QueueEvent, RecvError> {
        if let Some(init) = self.init.take() {
            return Ok(init);
        }

        let Some(rx) = self.rx.as_mut() else {
            return Err(RecvError::Closed);
        };

        match rx.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Queue subscriber lagged, dropping it");
                self.rx = None;
                Err(RecvError::Lagged { skipped })
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.rx = None;
                Err(RecvError::Closed)
            }
        }
    }

    /// Turn the subscription into a stream that ends when it is closed or cut off.
    pub fn into_stream(self) -> impl Stream<Item = Result<QueueEvent, RecvError>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut sub = state?;
            match sub.recv().await {
                Ok(event) => Some((Ok(event), Some(sub))),
                Err(RecvError::Closed) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
