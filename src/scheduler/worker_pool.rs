//! Worker pool driving the crawl.
//!
//! One [`JobFetcher`] feeds a bounded channel shared by one [`Worker`] per
//! catalog credential. A health monitor watches the workers and raises the
//! shutdown token once none is running, which is how a crawl whose every
//! credential went cold ends.
//!
//! All tasks hang off a single [`CancellationToken`]; the binary cancels it
//! on Ctrl-C and workers cancel it on fatal errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::fetcher::JobFetcher;
use super::queue::FrontierStore;
use super::worker::{JobReceiver, Worker, WorkerError, WorkerHandle, WorkerState, WorkerStatus};
use crate::catalog::CatalogClient;
use crate::error::StoreError;
use crate::storage::RecordSink;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Boot-time frontier operations failed.
    #[error("Frontier operation failed: {0}")]
    Store(#[from] StoreError),

    /// A worker stopped on a fatal error.
    #[error("Worker failed: {0}")]
    Worker(#[from] WorkerError),

    /// A tuning value would make a task spin or panic.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// `start` was called on a pool that has not been stopped.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// `stop` was called on a pool that was never started.
    #[error("Pool is not running")]
    NotRunning,
}

/// Tuning for the fetcher, workers and health monitor.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Bound of the job channel.
    pub channel_capacity: usize,
    /// The fetcher pops only while at most this many jobs are buffered.
    pub low_watermark: usize,
    /// Jobs claimed per pop.
    pub pop_batch: usize,
    /// Fetcher sleep when the frontier is empty.
    pub idle_backoff: Duration,
    /// Fetcher sleep when the buffer is above the watermark.
    pub full_backoff: Duration,
    /// Worker sleep when the channel is empty.
    pub poll_interval: Duration,
    /// Period of each worker's counter flush.
    pub stats_interval: Duration,
    /// Period of the health monitor; bounds how long a pool with no running
    /// worker stays up.
    pub health_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 20,
            low_watermark: 10,
            pop_batch: 5,
            idle_backoff: Duration::from_secs(3),
            full_backoff: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            stats_interval: Duration::from_secs(60),
            health_interval: Duration::from_secs(5),
        }
    }
}

impl WorkerPoolConfig {
    /// Checks the values `start` relies on.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.channel_capacity == 0 {
            return Err(PoolError::InvalidConfig("channel_capacity must be greater than 0".to_string()));
        }
        if self.pop_batch == 0 {
            return Err(PoolError::InvalidConfig("pop_batch must be greater than 0".to_string()));
        }

        let intervals = [
            ("idle_backoff", self.idle_backoff),
            ("full_backoff", self.full_backoff),
            ("poll_interval", self.poll_interval),
            ("stats_interval", self.stats_interval),
            ("health_interval", self.health_interval),
        ];
        match intervals.iter().find(|(_, value)| value.is_zero()) {
            Some((name, _)) => Err(PoolError::InvalidConfig(format!("{} must be greater than zero", name))),
            None => Ok(()),
        }
    }

    /// Sets the bound of the job channel.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Sets the buffered-job count above which the fetcher stops popping.
    pub fn with_low_watermark(mut self, watermark: usize) -> Self {
        self.low_watermark = watermark;
        self
    }

    /// Sets how many jobs one pop claims.
    pub fn with_pop_batch(mut self, batch: usize) -> Self {
        self.pop_batch = batch;
        self
    }

    /// Sets the fetcher sleep used when the frontier is empty.
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Sets the fetcher sleep used when the buffer is full enough.
    pub fn with_full_backoff(mut self, backoff: Duration) -> Self {
        self.full_backoff = backoff;
        self
    }

    /// Sets the worker sleep used when the channel is empty.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the period of the per-worker stats flush.
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Sets the period of the health monitor.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }
}

/// Worker counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub initialized: usize,
    pub running: usize,
    pub cold: usize,
    pub stopped: usize,
}

impl PoolSnapshot {
    fn from_states<'a>(states: impl IntoIterator<Item = &'a Arc<WorkerState>>) -> Self {
        let mut snapshot = Self::default();
        for state in states {
            match state.status() {
                WorkerStatus::Initialized => snapshot.initialized += 1,
                WorkerStatus::Running => snapshot.running += 1,
                WorkerStatus::Cold => snapshot.cold += 1,
                WorkerStatus::Stopped => snapshot.stopped += 1,
            }
        }
        snapshot
    }

    /// Number of workers counted.
    pub fn total(&self) -> usize {
        self.initialized + self.running + self.cold + self.stopped
    }

    /// True when every worker ended because its credential ran out.
    pub fn all_cold(&self) -> bool {
        self.cold == self.total()
    }
}

/// Owns the fetcher, the workers and the health monitor.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    frontier: Arc<dyn FrontierStore>,
    sink: Arc<dyn RecordSink>,
    clients: Vec<Arc<dyn CatalogClient>>,
    shutdown: CancellationToken,
    workers: Vec<WorkerHandle>,
    fetcher: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool with one worker per client.
    pub fn new(
        config: WorkerPoolConfig,
        frontier: Arc<dyn FrontierStore>,
        sink: Arc<dyn RecordSink>,
        clients: Vec<Arc<dyn CatalogClient>>,
    ) -> Self {
        Self {
            config,
            frontier,
            sink,
            clients,
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
            fetcher: None,
            monitor: None,
            is_running: AtomicBool::new(false),
        }
    }

    /// Recovers stranded jobs, seeds an empty frontier and spawns every task.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` on a second call,
    /// `PoolError::InvalidConfig` for zero capacities or intervals, or
    /// `PoolError::Store` if recovery or seeding fails.
    pub async fn start(&mut self, seed: &str) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        self.config.validate()?;

        // a stopped pool's token stays cancelled
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }

        info!("Starting scraper");

        let recovered = self.frontier.recover_stalled().await?;
        if recovered == 0 {
            info!("no jobs to recover");
        } else {
            info!(count = recovered, "recovered jobs");
        }

        self.frontier.ensure_seed(seed).await?;

        match self.frontier.counts().await {
            Ok(stats) => info!(
                pending = stats.pending_jobs,
                working = stats.working_jobs,
                done = stats.done_jobs,
                "frontier state"
            ),
            Err(e) => warn!(error = %e, "failed to read frontier counts"),
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let jobs: JobReceiver = Arc::new(Mutex::new(rx));

        let fetcher = JobFetcher::new(
            Arc::clone(&self.frontier),
            tx,
            &self.config,
            self.shutdown.clone(),
        );
        self.fetcher = Some(tokio::spawn(fetcher.run()));

        for (i, client) in self.clients.iter().enumerate() {
            let id = if client.name().is_empty() {
                format!("worker-{}", i)
            } else {
                client.name().to_string()
            };

            let worker = Worker::new(
                id,
                Arc::clone(client),
                Arc::clone(&self.frontier),
                Arc::clone(&self.sink),
                &self.shutdown,
                self.config.poll_interval,
                self.config.stats_interval,
            );
            self.workers.push(worker.start(Arc::clone(&jobs)));
        }

        let states: Vec<Arc<WorkerState>> = self.workers.iter().map(|w| Arc::clone(w.state())).collect();
        self.monitor = Some(tokio::spawn(monitor_workers(
            states,
            self.config.health_interval,
            self.shutdown.clone(),
        )));

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.workers.len(), "Worker pool started");

        Ok(())
    }

    /// Cancels every task and waits for them.
    ///
    /// In-flight fetches run to completion. Jobs still buffered in the
    /// channel stay in `working` until the next boot.
    ///
    /// # Errors
    ///
    /// Returns the first fatal worker error, if any worker hit one.
    pub async fn stop(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Stopping scraper");
        self.shutdown.cancel();
        for worker in &self.workers {
            worker.stop();
        }

        if let Some(fetcher) = self.fetcher.take() {
            if let Err(e) = fetcher.await {
                error!(error = %e, "Job fetcher panicked during shutdown");
            }
        }
        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                error!(error = %e, "Worker monitor panicked during shutdown");
            }
        }

        let mut first_error = None;
        for worker in self.workers.drain(..) {
            let id = worker.id().to_string();
            if let Err(e) = worker.join().await {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    error!(worker_id = %id, error = %e, "additional worker failure");
                }
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Worker pool shutdown complete");

        match first_error {
            Some(e) => Err(PoolError::Worker(e)),
            None => Ok(()),
        }
    }

    /// Token cancelled when the crawl should end.
    ///
    /// A restart after `stop` replaces the token, so callers fetch it again
    /// after each `start`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Current worker counts per status.
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot::from_states(self.workers.iter().map(|w| w.state()))
    }

    /// Handles of the started workers, in credential order. Empty once the
    /// pool is stopped.
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Whether `start` succeeded and `stop` has not run since.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

async fn monitor_workers(states: Vec<Arc<WorkerState>>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("stopped worker manager");
                return;
            }
            _ = ticker.tick() => {}
        }

        let snapshot = PoolSnapshot::from_states(&states);
        info!(
            running = snapshot.running,
            stopped = snapshot.stopped,
            cold = snapshot.cold,
            "worker pool state"
        );

        if snapshot.running == 0 {
            warn!("no running workers left, shutting down");
            shutdown.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::catalog::ArtistSubgraph;
    use crate::error::FetchError;
    use crate::scheduler::{JobId, JobStatus, MemoryFrontier};
    use crate::storage::MemoryRecordSink;

    struct ExhaustedClient(&'static str);

    #[async_trait]
    impl CatalogClient for ExhaustedClient {
        fn name(&self) -> &str {
            self.0
        }

        async fn fetch_artist_subgraph(&self, _artist_id: &str) -> Result<ArtistSubgraph, FetchError> {
            Err(FetchError::Exhausted {
                retry_after: Duration::from_secs(7200),
            })
        }
    }

    struct BrokenClient;

    #[async_trait]
    impl CatalogClient for BrokenClient {
        fn name(&self) -> &str {
            "broken"
        }

        async fn fetch_artist_subgraph(&self, _artist_id: &str) -> Result<ArtistSubgraph, FetchError> {
            Err(FetchError::Api {
                status: 400,
                message: "invalid id".to_string(),
            })
        }
    }

    fn fast_config() -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_idle_backoff(Duration::from_millis(20))
            .with_full_backoff(Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(10))
            .with_health_interval(Duration::from_millis(100))
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.channel_capacity, 20);
        assert_eq!(config.low_watermark, 10);
        assert_eq!(config.pop_batch, 5);
        assert_eq!(config.idle_backoff, Duration::from_secs(3));
        assert_eq!(config.full_backoff, Duration::from_secs(1));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.stats_interval, Duration::from_secs(60));
        assert_eq!(config.health_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::default()
            .with_channel_capacity(8)
            .with_low_watermark(2)
            .with_pop_batch(3)
            .with_stats_interval(Duration::from_secs(10));

        assert_eq!(config.channel_capacity, 8);
        assert_eq!(config.low_watermark, 2);
        assert_eq!(config.pop_batch, 3);
        assert_eq!(config.stats_interval, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_pool_shuts_down_when_all_credentials_cold() {
        let frontier = Arc::new(MemoryFrontier::new());
        let extra: Vec<JobId> = (0..4).map(|i| format!("artist{}", i)).collect();
        frontier.enqueue(&extra).await.unwrap();

        let clients: Vec<Arc<dyn CatalogClient>> =
            vec![Arc::new(ExhaustedClient("key-a")), Arc::new(ExhaustedClient("key-b"))];
        let mut pool = WorkerPool::new(fast_config(), frontier.clone(), Arc::new(MemoryRecordSink::new()), clients);

        let health_interval = fast_config().health_interval;
        pool.start("seed").await.unwrap();
        let token = pool.shutdown_token();

        // the workers go cold within a few polls; the next health tick ends the crawl
        tokio::time::timeout(health_interval * 2, token.cancelled())
            .await
            .expect("pool should shut down within one health interval of going cold");

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.cold, 2);
        assert_eq!(snapshot.running, 0);
        assert!(snapshot.all_cold());
        assert!(pool.workers().iter().all(|w| w.state().cooldown() == Some(Duration::from_secs(7200))));

        pool.stop().await.unwrap();
        assert!(!pool.is_running());
        assert_eq!(pool.snapshot().total(), 0);

        // abandoned jobs wait in working for the next boot
        let state = frontier.snapshot().unwrap();
        assert!(state.done().is_empty());
        assert!(state.working().len() >= 2);
    }

    #[tokio::test]
    async fn test_pool_surfaces_fatal_worker_error() {
        let frontier = Arc::new(MemoryFrontier::new());
        let clients: Vec<Arc<dyn CatalogClient>> = vec![Arc::new(BrokenClient)];
        let mut pool = WorkerPool::new(fast_config(), frontier.clone(), Arc::new(MemoryRecordSink::new()), clients);

        pool.start("artist1").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), pool.shutdown_token().cancelled())
            .await
            .expect("fatal error should raise shutdown");

        assert!(!pool.snapshot().all_cold());
        let result = pool.stop().await;
        assert!(matches!(result, Err(PoolError::Worker(WorkerError::Fetch { .. }))));

        let state = frontier.snapshot().unwrap();
        assert_eq!(state.status_of("artist1"), Some(JobStatus::Working));
    }

    #[tokio::test]
    async fn test_pool_start_twice_and_stop_idle() {
        let mut pool = WorkerPool::new(
            fast_config(),
            Arc::new(MemoryFrontier::new()),
            Arc::new(MemoryRecordSink::new()),
            Vec::new(),
        );

        assert!(matches!(pool.stop().await, Err(PoolError::NotRunning)));

        pool.start("artist1").await.unwrap();
        assert!(matches!(pool.start("artist1").await, Err(PoolError::AlreadyRunning)));

        // no workers at all: the first health tick ends the crawl
        tokio::time::timeout(Duration::from_secs(2), pool.shutdown_token().cancelled())
            .await
            .expect("empty pool should shut down");
        assert!(pool.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_pool_restarts_with_fresh_token() {
        let mut pool = WorkerPool::new(
            fast_config(),
            Arc::new(MemoryFrontier::new()),
            Arc::new(MemoryRecordSink::new()),
            Vec::new(),
        );

        pool.start("artist1").await.unwrap();
        pool.stop().await.unwrap();
        assert!(pool.shutdown_token().is_cancelled());

        pool.start("artist1").await.unwrap();
        let token = pool.shutdown_token();
        assert!(!token.is_cancelled());
        assert!(pool.is_running());

        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("empty pool should shut down again");
        assert!(pool.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_pool_rejects_zero_intervals() {
        assert!(fast_config().validate().is_ok());
        assert!(matches!(
            fast_config().with_stats_interval(Duration::ZERO).validate(),
            Err(PoolError::InvalidConfig(ref message)) if message.contains("stats_interval")
        ));
        assert!(matches!(
            fast_config().with_channel_capacity(0).validate(),
            Err(PoolError::InvalidConfig(_))
        ));

        let mut pool = WorkerPool::new(
            fast_config().with_idle_backoff(Duration::ZERO),
            Arc::new(MemoryFrontier::new()),
            Arc::new(MemoryRecordSink::new()),
            Vec::new(),
        );
        assert!(matches!(pool.start("artist1").await, Err(PoolError::InvalidConfig(_))));
        assert!(!pool.is_running());
    }

    #[test]
    fn test_pool_snapshot_total() {
        let snapshot = PoolSnapshot {
            initialized: 1,
            running: 2,
            cold: 3,
            stopped: 4,
        };
        assert_eq!(snapshot.total(), 10);
        assert!(!snapshot.all_cold());
        assert!(PoolSnapshot { cold: 2, ..Default::default() }.all_cold());
    }
}
