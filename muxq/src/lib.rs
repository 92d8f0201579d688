//! muxq: a persistent job queue that runs MP4Box mux jobs one at a time.
//!
//! [`queue::QueueManager`] owns the jobs and dispatches them to a
//! [`executor::MuxExecutor`]; observers follow along through
//! [`queue::QueueManager::subscribe`].

pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod queue;

pub use error::{Error, Result};
