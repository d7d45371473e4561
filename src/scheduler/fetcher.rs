//! The single producer feeding the job channel.
//!
//! The fetcher keeps the in-process buffer topped up from the frontier
//! without over-claiming: jobs it pops move to `working` immediately, so
//! popping more than the workers can chew only widens the window of jobs
//! stranded by a crash.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::JobId;
use super::queue::FrontierStore;
use super::worker_pool::WorkerPoolConfig;

/// Pops jobs from the frontier into the bounded job channel.
///
/// Exactly one fetcher runs per pool. It only pops while the channel holds
/// at most `low_watermark` jobs and sleeps between attempts, so an empty
/// frontier costs one `pop` per `idle_backoff`.
pub struct JobFetcher {
    frontier: Arc<dyn FrontierStore>,
    jobs: mpsc::Sender<JobId>,
    low_watermark: usize,
    pop_batch: usize,
    full_backoff: Duration,
    idle_backoff: Duration,
    cancel: CancellationToken,
}

impl JobFetcher {
    /// Creates a fetcher that sends into `jobs` and stops when `cancel` fires.
    ///
    /// Watermark, batch size and backoffs are taken from `config`.
    pub fn new(
        frontier: Arc<dyn FrontierStore>,
        jobs: mpsc::Sender<JobId>,
        config: &WorkerPoolConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            frontier,
            jobs,
            low_watermark: config.low_watermark,
            pop_batch: config.pop_batch,
            full_backoff: config.full_backoff,
            idle_backoff: config.idle_backoff,
            cancel,
        }
    }

    /// Jobs sitting in the channel.
    pub fn buffered(&self) -> usize {
        self.jobs.max_capacity() - self.jobs.capacity()
    }

    /// Runs until cancelled or until every worker has dropped its receiver.
    ///
    /// Pop failures are logged and retried after `idle_backoff`; they never
    /// end the loop.
    pub async fn run(self) {
        info!("Starting job fetcher");

        while !self.cancel.is_cancelled() {
            let buffered = self.buffered();
            if buffered > self.low_watermark {
                debug!(buffered, "job buffer above watermark");
                self.pause(self.full_backoff).await;
                continue;
            }

            let jobs = match self.frontier.pop(self.pop_batch).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(error = %e, "failed to pop jobs");
                    self.pause(self.idle_backoff).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                info!("no jobs to fetch, waiting");
                self.pause(self.idle_backoff).await;
                continue;
            }

            debug!(count = jobs.len(), "fetched jobs");
            for job in jobs {
                tokio::select! {
                    sent = self.jobs.send(job) => {
                        if sent.is_err() {
                            info!("job channel closed");
                            return;
                        }
                    }
                    _ = self.cancel.cancelled() => break,
                }
            }
        }

        info!("stopped job fetcher");
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::MemoryFrontier;

    fn config() -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_channel_capacity(20)
            .with_low_watermark(10)
            .with_pop_batch(5)
            .with_full_backoff(Duration::from_millis(10))
            .with_idle_backoff(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_fetcher_respects_watermark() {
        let frontier = Arc::new(MemoryFrontier::new());
        let ids: Vec<JobId> = (0..40).map(|i| format!("artist{}", i)).collect();
        frontier.enqueue(&ids).await.unwrap();

        let (tx, _rx) = mpsc::channel(20);
        let probe = tx.clone();
        let cancel = CancellationToken::new();
        let fetcher = JobFetcher::new(frontier.clone(), tx, &config(), cancel.clone());
        let task = tokio::spawn(fetcher.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap();

        let buffered = probe.max_capacity() - probe.capacity();
        // stops once above 10; one more batch of 5 can land on top
        assert!(buffered > 10 && buffered <= 15, "buffered = {}", buffered);

        let state = frontier.snapshot().unwrap();
        assert_eq!(state.working().len(), buffered);
        assert_eq!(state.pending().len(), 40 - buffered);
    }

    #[tokio::test]
    async fn test_fetcher_idle_sleep_is_cancellable() {
        let frontier = Arc::new(MemoryFrontier::new());
        let (tx, _rx) = mpsc::channel(20);
        let cancel = CancellationToken::new();
        let config = config().with_idle_backoff(Duration::from_secs(30));
        let task = tokio::spawn(JobFetcher::new(frontier, tx, &config, cancel.clone()).run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("fetcher should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn test_fetcher_stops_when_receiver_dropped() {
        let frontier = Arc::new(MemoryFrontier::new());
        frontier.enqueue(&["artist1".to_string()]).await.unwrap();

        let (tx, rx) = mpsc::channel(20);
        drop(rx);
        let task = tokio::spawn(JobFetcher::new(frontier, tx, &config(), CancellationToken::new()).run());

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("fetcher should stop once the channel closes")
            .unwrap();
    }
}
