//! Command-line adapter over [`QueueManager`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::executor::Mp4BoxExecutor;
use crate::queue::{
    DurableStore, Inbox, Job, JobStatus, JsonFileStore, MuxSpec, QueueError, QueueEvent,
    QueueManager, QueueRequest, QueueStatus, QueueStore, RecvError, StoreError, StoreLock,
};
use crate::{Error, Result};

/// How often `run` picks up requests posted by other commands.
const INBOX_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "muxq", author, version, about = "Queue MP4Box mux jobs and run them one at a time", long_about = None)]
pub struct Args {
    /// Config file (default: <config dir>/muxq/config.toml)
    #[arg(short, long, global = true, env = "MUXQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Queue file, overriding the configured store_path
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Add a job from a JSON mux spec file
    ///
    /// While `muxq run` is active the job is handed to it instead.
    Submit {
        /// Path to the spec, e.g. {"video": {"path": "a.mp4"}, "output": "out.mp4"}
        spec: PathBuf,
    },
    /// Show all jobs in queue order
    List {
        /// Print the jobs as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the queue summary as JSON
    Status,
    /// Delete a finished job
    Remove { job_id: String },
    /// Cancel a pending or running job; works while `muxq run` is active
    Cancel { job_id: String },
    /// Delete every completed and failed job
    ClearCompleted,
    /// Run pending jobs, printing events as JSON lines until the queue drains
    Run,
}

/// A manager opened for mutation, with the store lock held for its lifetime.
struct OpenQueue {
    manager: Arc<QueueManager>,
    inbox: Inbox,
    _lock: StoreLock,
}

/// Where a mutating command is carried out.
enum Target {
    Local(OpenQueue),
    /// Another process owns the queue; requests go through its inbox.
    Forward(Inbox),
}

impl OpenQueue {
    async fn open(config: &AppConfig) -> Result<Self> {
        let lock = StoreLock::acquire(&config.store_path).await?;
        Self::with_lock(config, lock).await
    }

    async fn open_or_forward(config: &AppConfig) -> Result<Target> {
        match StoreLock::acquire(&config.store_path).await {
            Ok(lock) => Ok(Target::Local(Self::with_lock(config, lock).await?)),
            Err(StoreError::Unavailable(reason)) => {
                debug!(reason = %reason, "Queue owned by another process, forwarding");
                Ok(Target::Forward(Inbox::for_store(&config.store_path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn with_lock(config: &AppConfig, lock: StoreLock) -> Result<Self> {
        let store = DurableStore::new(Arc::new(JsonFileStore::new(&config.store_path)));
        let executor = Arc::new(Mp4BoxExecutor::new(config.mp4box_config()));
        let manager = QueueManager::open(store, executor, config.queue_config()).await?;

        // Requests left behind by a `run` that exited before seeing them.
        let inbox = Inbox::for_store(&config.store_path);
        inbox.apply(&manager).await?;

        Ok(Self {
            manager,
            inbox,
            _lock: lock,
        })
    }

    async fn close(self) {
        self.manager.shutdown().await;
    }
}

/// Execute one CLI command.
pub async fn execute(command: Command, config: &AppConfig) -> Result<()> {
    match command {
        Command::Submit { spec } => submit(config, &spec).await,
        Command::List { json } => list(config, json).await,
        Command::Status => status(config).await,
        Command::Remove { job_id } => mutate(config, QueueRequest::Remove { job_id }).await,
        Command::Cancel { job_id } => mutate(config, QueueRequest::Cancel { job_id }).await,
        Command::ClearCompleted => mutate(config, QueueRequest::ClearCompleted).await,
        Command::Run => run(config).await,
    }
}

/// Apply `request` here, or hand it to the process that owns the queue.
///
/// A forwarded request is applied within a moment by that process, which
/// logs the outcome; only the request id is printed here.
async fn mutate(config: &AppConfig, request: QueueRequest) -> Result<()> {
    match OpenQueue::open_or_forward(config).await? {
        Target::Local(queue) => {
            let result = request.apply(&queue.manager).await;
            queue.close().await;
            println!("{}", result?);
        }
        Target::Forward(inbox) => {
            let request_id = inbox.post(&request).await?;
            info!(request_id = %request_id, "Handed request to the running queue");
            println!("forwarded {}", request_id);
        }
    }
    Ok(())
}

/// Parse a spec file.
pub fn read_spec(path: &Path) -> Result<MuxSpec> {
    let text =
        std::fs::read_to_string(path).map_err(|e| Error::io_path("reading job spec", path, e))?;
    Ok(serde_json::from_str(&text)?)
}

async fn submit(config: &AppConfig, path: &Path) -> Result<()> {
    let spec = read_spec(path)?;
    // Rejected here so a forwarded submission cannot fail later unseen.
    spec.validate().map_err(QueueError::InvalidSpec)?;
    mutate(config, QueueRequest::Submit { spec }).await
}

/// Read the stored queue without taking ownership of it.
///
/// A store in an older format reads as empty until a command that owns the
/// queue replaces it.
async fn load_snapshot(config: &AppConfig) -> Result<Vec<Job>> {
    match JsonFileStore::new(&config.store_path).load_all().await {
        Ok(jobs) => Ok(jobs),
        Err(StoreError::IncompatibleVersion { found }) => {
            warn!(found = found, "Queue file has an incompatible version");
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

async fn list(config: &AppConfig, json: bool) -> Result<()> {
    let jobs = load_snapshot(config).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("queue is empty");
        return Ok(());
    }
    for job in &jobs {
        println!("{}", format_job_line(job));
    }
    Ok(())
}

async fn status(config: &AppConfig) -> Result<()> {
    let jobs = load_snapshot(config).await?;
    let status = QueueStatus {
        // Another process dispatching is the only way the queue can be running.
        running: StoreLock::is_held(&config.store_path),
        queued_count: jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .count(),
        total_count: jobs.len(),
    };
    println!("{}", serde_json::to_string(&status)?);
    Ok(())
}

/// One human-readable line per job.
pub fn format_job_line(job: &Job) -> String {
    let mut line = format!(
        "{}  {:<10} {:>5.1}%  {}",
        job.id,
        job.status.to_string(),
        job.progress,
        job.spec.output.display()
    );
    if let Some(error) = &job.error {
        let first = error.lines().next().unwrap_or_default();
        line.push_str(&format!("  ({})", first));
    }
    line
}

async fn run(config: &AppConfig) -> Result<()> {
    let queue = OpenQueue::open(config).await?;
    let manager = queue.manager.clone();

    if manager.status().await.queued_count == 0 {
        info!("No pending jobs");
        queue.close().await;
        return Ok(());
    }

    let mut events = manager.subscribe().await;
    manager.start().await;

    let mut inbox_poll = tokio::time::interval(INBOX_POLL_INTERVAL);
    inbox_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let interrupt = shutdown_signal();
    tokio::pin!(interrupt);

    let result = loop {
        tokio::select! {
            _ = &mut interrupt => {
                manager.stop().await;
                let running = manager
                    .list()
                    .await
                    .into_iter()
                    .find(|j| j.status == JobStatus::Processing);
                if let Some(job) = running {
                    info!(job_id = %job.id, "Canceling running job before exit");
                    if let Err(e) = manager.cancel(&job.id).await {
                        break Err(e.into());
                    }
                }
                break Ok(());
            }
            _ = inbox_poll.tick() => {
                match queue.inbox.apply(&manager).await {
                    // A forwarded cancel can empty the queue without a drain event.
                    Ok(applied) if applied > 0 && !has_unfinished(&manager).await => {
                        info!("No jobs left after applying requests");
                        break Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Failed to read queue inbox"),
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    match event {
                        QueueEvent::QueueDrained => {
                            // Submissions posted just before the queue ran dry.
                            if let Err(e) = queue.inbox.apply(&manager).await {
                                warn!(error = %e, "Failed to read queue inbox");
                            }
                            if !has_unfinished(&manager).await {
                                break Ok(());
                            }
                        }
                        QueueEvent::QueueState { status } if !status.running => break Ok(()),
                        _ => {}
                    }
                }
                Err(RecvError::Lagged { skipped }) => {
                    warn!(skipped = skipped, "Event printer fell behind, resubscribing");
                    events = manager.subscribe().await;
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    queue.close().await;
    result
}

async fn has_unfinished(manager: &QueueManager) -> bool {
    manager
        .list()
        .await
        .iter()
        .any(|j| matches!(j.status, JobStatus::Pending | JobStatus::Processing))
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, stopping"),
        () = terminate => info!("Received SIGTERM, stopping"),
    }
}
