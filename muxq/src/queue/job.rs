//! The job record owned by the queue manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::spec::MuxSpec;

/// Opaque job identifier.
pub type JobId = String;

/// Job status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be dispatched.
    Pending,
    /// Handed to the execution worker.
    Processing,
    /// The tool exited successfully.
    Completed,
    /// The tool failed, or the job was interrupted by a restart.
    Failed,
    /// Stopped on request.
    Canceled,
}

impl JobStatus {
    /// `completed`, `failed` and `canceled` never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// One mux request and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Percent in `[0, 100]`.
    pub progress: f64,
    pub spec: MuxSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job for `spec`.
    pub fn new(spec: MuxSpec) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            progress: 0.0,
            spec,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.progress = 100.0;
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn mark_canceled(&mut self) {
        self.status = JobStatus::Canceled;
        self.completed_at = Some(Utc::now());
    }

    /// Raise progress to `percent` if it is higher than the current value.
    ///
    /// Returns whether the value changed. Only meaningful while processing.
    pub(crate) fn advance_progress(&mut self, percent: f64) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        let percent = percent.clamp(0.0, 100.0);
        if percent > self.progress {
            self.progress = percent;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn job() -> Job {
        Job::new(MuxSpec::new("out1.mp4").with_video("a.mp4"))
    }

    #[test]
    fn test_job_creation() {
        let job = job();
        assert!(!job.id.is_empty());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(job().id, job().id);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(JobStatus::Canceled.to_string(), "canceled");
        assert_eq!(JobStatus::from_str("processing").unwrap(), JobStatus::Processing);
        assert_eq!(
            serde_json::to_string(&JobStatus::Pending).unwrap(),
            "\"pending\""
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let mut job = job();
        assert!(!job.advance_progress(10.0), "pending jobs ignore progress");

        job.mark_processing();
        assert!(job.started_at.is_some());
        assert!(job.advance_progress(10.0));
        assert!(!job.advance_progress(5.0));
        assert_eq!(job.progress, 10.0);
        assert!(job.advance_progress(250.0));
        assert_eq!(job.progress, 100.0);
        assert!(!job.advance_progress(100.0));
    }

    #[test]
    fn test_completion_pins_progress() {
        let mut job = job();
        job.mark_processing();
        job.advance_progress(42.0);
        job.mark_completed();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_failure_keeps_last_progress() {
        let mut job = job();
        job.mark_processing();
        job.advance_progress(42.0);
        job.mark_failed("boom");
        assert_eq!(job.progress, 42.0);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }
}
