//! Crawl workers.
//!
//! A worker is bound to exactly one catalog credential. It pulls artist ids
//! from the shared job channel and runs the fetch, persist, expand,
//! acknowledge cycle for each:
//!
//! 1. fetch the artist's tracks through its catalog client
//! 2. write every track to the record sink
//! 3. enqueue the artists credited on those tracks (minus the artist itself)
//! 4. mark the job done
//!
//! The order matters: a crash after step 2 re-runs the job on the next boot,
//! which only overwrites records and re-enqueues ids the frontier already
//! knows.
//!
//! When the credential's rate-limit budget is spent the worker goes cold
//! for good. The job that hit the limit is left in `working`; the boot-time
//! recovery sweep returns it to `pending`.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::JobId;
use super::queue::FrontierStore;
use crate::catalog::{CatalogClient, TrackRecord};
use crate::error::{FetchError, StoreError};
use crate::storage::RecordSink;

/// Consumer side of the job channel, shared by every worker.
pub type JobReceiver = Arc<Mutex<mpsc::Receiver<JobId>>>;

/// Errors that end a worker and, with it, the process.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The catalog client failed for a reason other than rate limiting.
    #[error("Failed to fetch artist '{job}': {source}")]
    Fetch {
        job: JobId,
        #[source]
        source: FetchError,
    },

    /// A store operation failed in a way retrying cannot fix.
    #[error("Store operation '{operation}' failed: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Worker task failed: {0}")]
    Join(String),
}

/// Lifecycle of a worker. `Cold` and `Stopped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    Initialized = 0,
    Running = 1,
    Cold = 2,
    Stopped = 3,
}

impl WorkerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initialized,
            1 => Self::Running,
            2 => Self::Cold,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Cold => "cold",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Counters drained by one stats flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntervalStats {
    pub requests: u64,
    pub tracks: u64,
}

/// State a worker publishes to the pool.
///
/// Only the owning worker writes it (stop requests aside); the pool reads.
#[derive(Debug)]
pub struct WorkerState {
    status: AtomicU8,
    requests: AtomicU64,
    tracks: AtomicU64,
    cooldown_secs: AtomicU64,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerState {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(WorkerStatus::Initialized as u8),
            requests: AtomicU64::new(0),
            tracks: AtomicU64::new(0),
            cooldown_secs: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: WorkerStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// Moves to `Stopped` unless the worker already went cold.
    fn mark_stopped(&self) {
        let _ = self
            .status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != WorkerStatus::Cold as u8).then_some(WorkerStatus::Stopped as u8)
            });
    }

    fn go_cold(&self, cooldown: Duration) {
        self.cooldown_secs.store(cooldown.as_secs(), Ordering::SeqCst);
        self.set_status(WorkerStatus::Cold);
    }

    /// How long the credential stays rate limited, once cold.
    pub fn cooldown(&self) -> Option<Duration> {
        match self.status() {
            WorkerStatus::Cold => Some(Duration::from_secs(self.cooldown_secs.load(Ordering::SeqCst))),
            _ => None,
        }
    }

    fn record(&self, requests: u64, tracks: u64) {
        self.requests.fetch_add(requests, Ordering::SeqCst);
        self.tracks.fetch_add(tracks, Ordering::SeqCst);
    }

    /// Reads and zeroes the interval counters.
    pub fn flush(&self) -> IntervalStats {
        IntervalStats {
            requests: self.requests.swap(0, Ordering::SeqCst),
            tracks: self.tracks.swap(0, Ordering::SeqCst),
        }
    }
}

/// What became of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Completed,
    /// The credential is spent; the job stays in `working`.
    CredentialExhausted { retry_after: Duration },
    /// Shutdown arrived while a store retry was pending; the job stays in
    /// `working`.
    Interrupted,
}

/// Artists credited on `tracks`, excluding `seed`, deduplicated in
/// first-seen order.
pub fn discover_artists(tracks: &[TrackRecord], seed: &str) -> Vec<JobId> {
    let mut seen = HashSet::new();
    tracks
        .iter()
        .flat_map(|t| t.artist_ids())
        .filter(|id| *id != seed && seen.insert(*id))
        .map(str::to_string)
        .collect()
}

/// A single worker bound to one credential.
pub struct Worker {
    id: String,
    client: Arc<dyn CatalogClient>,
    frontier: Arc<dyn FrontierStore>,
    sink: Arc<dyn RecordSink>,
    state: Arc<WorkerState>,
    /// Stops this worker's own tasks.
    cancel: CancellationToken,
    /// Process-wide shutdown, raised on fatal errors.
    shutdown: CancellationToken,
    poll_interval: Duration,
    stats_interval: Duration,
}

impl Worker {
    /// Creates a worker whose tasks stop when `shutdown` is cancelled.
    pub fn new(
        id: impl Into<String>,
        client: Arc<dyn CatalogClient>,
        frontier: Arc<dyn FrontierStore>,
        sink: Arc<dyn RecordSink>,
        shutdown: &CancellationToken,
        poll_interval: Duration,
        stats_interval: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            client,
            frontier,
            sink,
            state: Arc::new(WorkerState::new()),
            cancel: shutdown.child_token(),
            shutdown: shutdown.clone(),
            poll_interval,
            stats_interval,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Spawns the stats flush and the job loop.
    pub fn start(self, jobs: JobReceiver) -> WorkerHandle {
        info!(worker_id = %self.id, "Starting");

        let stats_task = tokio::spawn(flush_stats(
            self.id.clone(),
            Arc::clone(&self.state),
            self.stats_interval,
            self.cancel.clone(),
        ));

        self.state.set_status(WorkerStatus::Running);

        let id = self.id.clone();
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            let result = self.run(&jobs).await;
            self.cancel.cancel();
            if let Err(e) = stats_task.await {
                error!(worker_id = %self.id, error = %e, "Stats task panicked");
            }
            result
        });

        WorkerHandle {
            id,
            state,
            cancel,
            task,
        }
    }

    async fn run(&self, jobs: &JobReceiver) -> Result<(), WorkerError> {
        loop {
            if self.cancel.is_cancelled() {
                info!(worker_id = %self.id, "stopped worker");
                self.state.mark_stopped();
                return Ok(());
            }

            let next = jobs.lock().await.try_recv();
            let job = match next {
                Ok(job) => job,
                Err(TryRecvError::Empty) => {
                    self.pause(self.poll_interval).await;
                    continue;
                }
                Err(TryRecvError::Disconnected) => {
                    info!(worker_id = %self.id, "job channel closed");
                    self.state.mark_stopped();
                    return Ok(());
                }
            };

            info!(worker_id = %self.id, job = %job, "working");
            match self.process_job(&job).await {
                Ok(JobOutcome::Completed) | Ok(JobOutcome::Interrupted) => {}
                Ok(JobOutcome::CredentialExhausted { retry_after }) => {
                    warn!(
                        worker_id = %self.id,
                        job = %job,
                        cooldown_secs = retry_after.as_secs(),
                        "max retry duration exceeded, cold key"
                    );
                    self.state.go_cold(retry_after);
                    return Ok(());
                }
                Err(e) => {
                    error!(worker_id = %self.id, job = %job, error = %e, "fatal worker error, shutting down");
                    self.state.mark_stopped();
                    self.shutdown.cancel();
                    return Err(e);
                }
            }
        }
    }

    pub(crate) async fn process_job(&self, job: &str) -> Result<JobOutcome, WorkerError> {
        let subgraph = match self.client.fetch_artist_subgraph(job).await {
            Ok(subgraph) => subgraph,
            Err(FetchError::Exhausted { retry_after }) => {
                return Ok(JobOutcome::CredentialExhausted { retry_after });
            }
            Err(source) => {
                return Err(WorkerError::Fetch {
                    job: job.to_string(),
                    source,
                });
            }
        };

        let track_count = subgraph.tracks.len() as u64;
        info!(
            worker_id = %self.id,
            artist = %job,
            count = track_count,
            request_count = subgraph.requests_used,
            "tracks fetched"
        );

        let stored = self
            .retry_store("store tracks", || self.sink.store_tracks(&subgraph.tracks))
            .await?;
        if stored.is_none() {
            return Ok(JobOutcome::Interrupted);
        }

        let discovered = discover_artists(&subgraph.tracks, job);
        let Some(created) = self
            .retry_store("enqueue jobs", || self.frontier.enqueue(&discovered))
            .await?
        else {
            return Ok(JobOutcome::Interrupted);
        };
        debug!(worker_id = %self.id, discovered = discovered.len(), created, "frontier expanded");

        self.state.record(subgraph.requests_used, track_count);

        match self.frontier.complete(job).await {
            Ok(true) => info!(worker_id = %self.id, job = %job, "marked job as done"),
            Ok(false) => warn!(worker_id = %self.id, job = %job, "job was not in working set, left as is"),
            Err(e) => error!(worker_id = %self.id, job = %job, error = %e, "failed to mark job as done"),
        }

        Ok(JobOutcome::Completed)
    }

    /// Runs a store operation until it succeeds, a non-transient error
    /// occurs, or the worker is cancelled (`Ok(None)`).
    async fn retry_store<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<Option<T>, WorkerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        loop {
            match attempt().await {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.is_transient() => {
                    warn!(worker_id = %self.id, operation, error = %e, "store operation failed, retrying");
                    if !self.pause(self.poll_interval).await {
                        return Ok(None);
                    }
                }
                Err(source) => return Err(WorkerError::Store { operation, source }),
            }
        }
    }

    /// Sleeps for `duration`; returns `false` if cancelled first.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

async fn flush_stats(id: String, state: Arc<WorkerState>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let stats = state.flush();
                info!(worker_id = %id, requests = stats.requests, tracks = stats.tracks, "stats per interval");
            }
        }
    }
}

/// The pool's view of a started worker.
pub struct WorkerHandle {
    id: String,
    state: Arc<WorkerState>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), WorkerError>>,
}

impl WorkerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    /// Cancels the worker's tasks. An in-flight fetch runs to completion.
    pub fn stop(&self) {
        info!(worker_id = %self.id, "stopping");
        self.cancel.cancel();
        self.state.mark_stopped();
    }

    /// Waits for the worker to exit.
    pub async fn join(self) -> Result<(), WorkerError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(WorkerError::Join(e.to_string())),
        }
    }
}
