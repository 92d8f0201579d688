//! Queue manager: owns the job list and drives the execution worker.
//!
//! All reads and writes of queue state go through one `tokio::sync::Mutex`.
//! Each mutation is persisted while the lock is held, and events are
//! published under the same lock. That gives subscribers a single total
//! order, and a fresh [`Subscription`] a snapshot that lines up with the
//! first event it receives.
//!
//! Only the background dispatcher task calls [`MuxExecutor::run`], and it
//! handles one job at a time.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::QueueError;
use super::events::{DEFAULT_EVENT_BUFFER, EventHub, QueueEvent, Subscription};
use super::job::{Job, JobId, JobStatus};
use super::spec::MuxSpec;
use super::store::{DurableStore, StoreError};
use crate::executor::{ExecutionError, MuxExecutor, ProgressReporter, ProgressUpdate};

/// Progress updates buffered between the worker and the manager.
const PROGRESS_BUFFER: usize = 64;

/// Extra time `cancel` waits on top of the worker's grace period.
const CANCEL_SLACK: Duration = Duration::from_secs(2);

/// Queue summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub running: bool,
    /// Jobs still `pending`.
    pub queued_count: usize,
    pub total_count: usize,
}

/// Queue manager settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Per-subscriber event buffer.
    pub event_buffer: usize,
    /// Grace period the worker gives the tool before killing it.
    pub cancel_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_EVENT_BUFFER,
            cancel_grace: Duration::from_secs(3),
        }
    }
}

/// How a dispatched run ended, as seen by a waiting `cancel`.
#[derive(Debug, Clone)]
enum RunOutcome {
    Finished(JobStatus),
    PersistFailed(String),
}

/// The job currently handed to the worker.
struct ActiveRun {
    job_id: JobId,
    cancel: CancellationToken,
    done: watch::Receiver<Option<RunOutcome>>,
}

/// Dispatcher-side handle for the job it claimed.
struct Claim {
    job_id: JobId,
    spec: MuxSpec,
    cancel: CancellationToken,
    done: watch::Sender<Option<RunOutcome>>,
}

struct QueueState {
    jobs: Vec<Job>,
    running: bool,
    current: Option<ActiveRun>,
}

impl QueueState {
    fn position(&self, job_id: &str) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == job_id)
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            running: self.running,
            queued_count: self.count(JobStatus::Pending),
            total_count: self.jobs.len(),
        }
    }

    fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}

/// Serializes every change to the queue and runs jobs one after another.
pub struct QueueManager {
    state: Mutex<QueueState>,
    store: DurableStore,
    executor: Arc<dyn MuxExecutor>,
    hub: EventHub,
    config: QueueConfig,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    dispatcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    /// Rehydrate the queue from `store` and start the dispatcher task.
    ///
    /// The queue comes up stopped; call [`QueueManager::start`] to begin dispatching.
    pub async fn open(
        store: DurableStore,
        executor: Arc<dyn MuxExecutor>,
        config: QueueConfig,
    ) -> Result<Arc<Self>, QueueError> {
        let jobs = store.load().await?;

        let manager = Arc::new(Self {
            state: Mutex::new(QueueState {
                jobs,
                running: false,
                current: None,
            }),
            store,
            executor,
            hub: EventHub::new(config.event_buffer),
            config,
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            dispatcher: parking_lot::Mutex::new(None),
        });

        let handle = tokio::spawn(run_dispatcher(
            Arc::downgrade(&manager),
            manager.wake.clone(),
            manager.shutdown.clone(),
        ));
        *manager.dispatcher.lock() = Some(handle);

        info!(executor = manager.executor.name(), "Queue manager started");
        Ok(manager)
    }

    /// Validate and enqueue a new job.
    pub async fn submit(&self, spec: MuxSpec) -> Result<JobId, QueueError> {
        spec.validate().map_err(QueueError::InvalidSpec)?;

        let mut state = self.state.lock().await;
        let job = Job::new(spec);
        let job_id = job.id.clone();
        state.jobs.push(job.clone());

        if let Err(e) = self.store.save(&state.jobs).await {
            state.jobs.pop();
            return Err(e.into());
        }

        info!(job_id = %job_id, output = %job.spec.output.display(), "Job submitted");
        self.hub.publish(QueueEvent::JobAdded { job });

        if state.running {
            self.wake.notify_one();
        }
        Ok(job_id)
    }

    /// Snapshot of every job in queue order.
    pub async fn list(&self) -> Vec<Job> {
        self.state.lock().await.jobs.clone()
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        let state = self.state.lock().await;
        state.position(job_id).map(|idx| state.jobs[idx].clone())
    }

    pub async fn status(&self) -> QueueStatus {
        self.state.lock().await.status()
    }

    /// Delete a job in a terminal state.
    pub async fn remove(&self, job_id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let idx = state
            .position(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        let status = state.jobs[idx].status;
        if !status.is_terminal() {
            return Err(QueueError::JobNotRemovable {
                job_id: job_id.to_string(),
                status,
            });
        }

        let removed = state.jobs.remove(idx);
        if let Err(e) = self.store.save(&state.jobs).await {
            state.jobs.insert(idx, removed);
            return Err(e.into());
        }

        info!(job_id = %job_id, "Job removed");
        self.hub.publish(QueueEvent::JobsRemoved {
            job_ids: vec![removed.id],
        });
        Ok(())
    }

    /// Remove every `completed` and `failed` job in one write.
    ///
    /// Returns the removed ids.
    pub async fn clear_completed(&self) -> Result<Vec<JobId>, QueueError> {
        let mut state = self.state.lock().await;

        let removed: Vec<JobId> = state
            .jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Completed | JobStatus::Failed))
            .map(|j| j.id.clone())
            .collect();
        if removed.is_empty() {
            return Ok(removed);
        }

        let previous = state.jobs.clone();
        state
            .jobs
            .retain(|j| !matches!(j.status, JobStatus::Completed | JobStatus::Failed));

        if let Err(e) = self.store.save(&state.jobs).await {
            state.jobs = previous;
            return Err(e.into());
        }

        info!(count = removed.len(), "Cleared finished jobs");
        self.hub.publish(QueueEvent::JobsRemoved {
            job_ids: removed.clone(),
        });
        Ok(removed)
    }

    /// Cancel a job.
    ///
    /// Pending jobs are canceled right away. For the processing job this
    /// signals the worker and waits until it confirms the tool is gone.
    /// Already-terminal jobs are left alone.
    pub async fn cancel(&self, job_id: &str) -> Result<(), QueueError> {
        let mut done = {
            let mut state = self.state.lock().await;
            let idx = state
                .position(job_id)
                .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

            match state.jobs[idx].status {
                status if status.is_terminal() => {
                    debug!(job_id = %job_id, %status, "Cancel ignored, job already finished");
                    return Ok(());
                }
                JobStatus::Processing => {
                    let active = state
                        .current
                        .as_ref()
                        .filter(|run| run.job_id == job_id)
                        .map(|run| (run.cancel.clone(), run.done.clone()));
                    match active {
                        Some((token, done)) => {
                            info!(job_id = %job_id, "Canceling running job");
                            token.cancel();
                            done
                        }
                        // Left processing by a result that could not be saved; no worker owns it.
                        None => return self.cancel_in_place(&mut state, idx).await,
                    }
                }
                _ => return self.cancel_in_place(&mut state, idx).await,
            }
        };

        let limit = self.config.cancel_grace + CANCEL_SLACK;
        let outcome = match tokio::time::timeout(limit, done.wait_for(Option::is_some)).await {
            Ok(Ok(outcome)) => (*outcome).clone(),
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(job_id = %job_id, "Worker did not confirm cancellation in time");
                return Err(QueueError::CancelTimedOut(job_id.to_string()));
            }
        };

        match outcome {
            Some(RunOutcome::PersistFailed(msg)) => {
                Err(QueueError::Persistence(StoreError::Unavailable(msg)))
            }
            Some(RunOutcome::Finished(status)) => {
                debug!(job_id = %job_id, %status, "Cancel confirmed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn cancel_in_place(
        &self,
        state: &mut QueueState,
        idx: usize,
    ) -> Result<(), QueueError> {
        let previous = state.jobs[idx].clone();
        state.jobs[idx].mark_canceled();

        if let Err(e) = self.store.save(&state.jobs).await {
            state.jobs[idx] = previous;
            return Err(e.into());
        }

        info!(job_id = %state.jobs[idx].id, "Job canceled");
        self.hub.publish(QueueEvent::JobStatusChanged {
            job: state.jobs[idx].clone(),
        });
        Ok(())
    }

    /// Begin dispatching pending jobs.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if state.running {
            return;
        }
        state.running = true;
        info!(queued = state.count(JobStatus::Pending), "Queue started");
        self.hub.publish(QueueEvent::QueueState {
            status: state.status(),
        });
        self.wake.notify_one();
    }

    /// Stop dispatching. The processing job, if any, runs to completion.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.running {
            return;
        }
        state.running = false;
        info!("Queue stopped");
        self.hub.publish(QueueEvent::QueueState {
            status: state.status(),
        });
    }

    /// Subscribe to live updates, starting with an `init` snapshot.
    pub async fn subscribe(&self) -> Subscription {
        let state = self.state.lock().await;
        let snapshot = QueueEvent::Init {
            jobs: state.jobs.clone(),
            status: state.status(),
        };
        self.hub.subscribe(snapshot)
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    /// Stop dispatching, cancel the running job and wait for the dispatcher to exit.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.shutdown.cancel();

        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "Dispatcher task failed");
        }
        info!("Queue manager shut down");
    }

    /// Run pending jobs until the queue is stopped or empty.
    async fn dispatch_pending(&self) {
        while !self.shutdown.is_cancelled() {
            let Some(claim) = self.claim_next().await else {
                return;
            };
            let result = self.execute(&claim).await;
            self.finish(claim, result).await;
        }
    }

    /// Mark the oldest pending job as processing.
    async fn claim_next(&self) -> Option<Claim> {
        let mut state = self.state.lock().await;
        if !state.running || state.current.is_some() {
            return None;
        }
        if state.jobs.iter().any(|j| j.status == JobStatus::Processing) {
            warn!("A job is still marked processing, not dispatching");
            return None;
        }

        let idx = state
            .jobs
            .iter()
            .position(|j| j.status == JobStatus::Pending)?;
        let previous = state.jobs[idx].clone();
        state.jobs[idx].mark_processing();

        if let Err(e) = self.store.save(&state.jobs).await {
            error!(job_id = %previous.id, error = %e, "Failed to persist job start, stopping queue");
            state.jobs[idx] = previous;
            self.halt(&mut state);
            return None;
        }

        let job = &state.jobs[idx];
        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(None);
        let claim = Claim {
            job_id: job.id.clone(),
            spec: job.spec.clone(),
            cancel: cancel.clone(),
            done: done_tx,
        };

        info!(job_id = %job.id, output = %job.spec.output.display(), "Dispatching job");
        self.hub.publish(QueueEvent::JobStatusChanged { job: job.clone() });

        state.current = Some(ActiveRun {
            job_id: claim.job_id.clone(),
            cancel,
            done: done_rx,
        });
        Some(claim)
    }

    /// Run the worker for `claim`, relaying progress as it arrives.
    async fn execute(&self, claim: &Claim) -> Result<std::path::PathBuf, ExecutionError> {
        let (tx, mut rx) = mpsc::channel(PROGRESS_BUFFER);
        let run = self
            .executor
            .run(&claim.spec, ProgressReporter::new(tx), claim.cancel.clone());
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                Some(update) = rx.recv() => self.apply_progress(&claim.job_id, update).await,
            }
        };

        // Updates sent right before the worker returned.
        while let Ok(update) = rx.try_recv() {
            self.apply_progress(&claim.job_id, update).await;
        }
        result
    }

    async fn apply_progress(&self, job_id: &str, update: ProgressUpdate) {
        let mut state = self.state.lock().await;
        let Some(idx) = state.position(job_id) else {
            return;
        };

        let job = &mut state.jobs[idx];
        if job.advance_progress(update.percent) {
            self.hub.publish(QueueEvent::JobProgress {
                job_id: job.id.clone(),
                progress: job.progress,
                message: update.message,
            });
        }
    }

    /// Record the worker's outcome and release the dispatch slot.
    async fn finish(&self, claim: Claim, result: Result<std::path::PathBuf, ExecutionError>) {
        let mut state = self.state.lock().await;
        state.current = None;

        let Some(idx) = state.position(&claim.job_id) else {
            error!(job_id = %claim.job_id, "Finished job vanished from the queue");
            let _ = claim.done.send(None);
            return;
        };

        let previous = state.jobs[idx].clone();
        let job = &mut state.jobs[idx];
        match result {
            Ok(output) => {
                info!(job_id = %job.id, output = %output.display(), "Job completed");
                job.mark_completed();
            }
            Err(e) if claim.cancel.is_cancelled() || matches!(e, ExecutionError::Canceled) => {
                info!(job_id = %job.id, reason = %e, "Job canceled");
                job.mark_canceled();
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job failed");
                job.mark_failed(e.to_string());
            }
        }

        if let Err(e) = self.store.save(&state.jobs).await {
            error!(job_id = %claim.job_id, error = %e, "Failed to persist job result, stopping queue");
            state.jobs[idx] = previous;
            self.halt(&mut state);
            let _ = claim.done.send(Some(RunOutcome::PersistFailed(e.to_string())));
            return;
        }

        let job = state.jobs[idx].clone();
        let _ = claim.done.send(Some(RunOutcome::Finished(job.status)));
        self.hub.publish(QueueEvent::JobStatusChanged { job });

        if state.running && state.count(JobStatus::Pending) == 0 {
            info!("Queue drained");
            self.hub.publish(QueueEvent::QueueDrained);
        }
    }

    /// Stop dispatching after a failed write.
    fn halt(&self, state: &mut QueueState) {
        if state.running {
            state.running = false;
            self.hub.publish(QueueEvent::QueueState {
                status: state.status(),
            });
        }
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_dispatcher(
    manager: Weak<QueueManager>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
) {
    debug!("Dispatcher started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = wake.notified() => {}
        }

        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.dispatch_pending().await;
    }
    debug!("Dispatcher stopped");
}
