//! Execution worker: runs the external muxing tool for one job at a time.

mod lines;
mod mp4box;
mod progress;

pub use lines::{OutputLine, OutputSource, OutputTail, spawn_line_reader};
pub use mp4box::{DEFAULT_MP4BOX_PROGRAM, Mp4BoxConfig, Mp4BoxExecutor};
pub use progress::{
    MonotonicProgress, ProgressLine, ProgressReporter, ProgressUpdate, parse_progress_line,
};

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::queue::MuxSpec;

/// Why a run did not produce its output.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Cancellation was requested and the tool has been torn down.
    #[error("canceled")]
    Canceled,

    /// The tool exited unsuccessfully; carries the tail of its output.
    #[error("{0}")]
    ToolFailed(String),

    /// The tool could not be started.
    #[error("{program} not found at '{}' - install GPAC or set mp4box_path", path.display())]
    NotFound { program: &'static str, path: PathBuf },

    #[error("failed to launch {}: {source}", path.display())]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs the external tool for a single job.
///
/// Implementations report progress through `progress`, must return
/// [`ExecutionError::Canceled`] once `cancel` fires and the tool is gone, and
/// leave any partial output file where it is.
#[async_trait]
pub trait MuxExecutor: Send + Sync {
    /// Produce `spec.output`, returning its path on success.
    async fn run(
        &self,
        spec: &MuxSpec,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<PathBuf, ExecutionError>;

    /// Executor name for logs.
    fn name(&self) -> &'static str;
}
