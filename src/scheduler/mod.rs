//! Crawl scheduling: the persistent frontier and the workers draining it.
//!
//! - **FrontierStore**: the set of artists to crawl, split into `pending`,
//!   `working` and `done`, with every transition atomic in the store
//! - **JobFetcher**: moves jobs from `pending` into a bounded in-process
//!   channel, keeping the buffer near a low watermark
//! - **Worker**: one per catalog credential; fetches an artist's tracks,
//!   persists them and enqueues the artists it discovers
//! - **WorkerPool**: wires the above together and ends the crawl once no
//!   worker is left running
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Frontier   │◄──────── enqueue / complete ─────┐
//!                      │   (Redis)    │                                  │
//!                      └──────┬───────┘                                  │
//!                             │ pop                                      │
//!                      ┌──────▼───────┐                                  │
//!                      │  JobFetcher  │                                  │
//!                      └──────┬───────┘                                  │
//!                             │ bounded channel                          │
//!         ┌───────────────────┼───────────────────┐                      │
//!         ▼                   ▼                   ▼                      │
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐                 │
//!    │ Worker 1│         │ Worker 2│         │ Worker N│─────────────────┘
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use metaraid::scheduler::{FrontierKeys, RedisFrontier, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let frontier = RedisFrontier::connect("redis://localhost:6379", FrontierKeys::default()).await?;
//! let mut pool = WorkerPool::new(WorkerPoolConfig::default(), Arc::new(frontier), sink, clients);
//! pool.start("5D8TBtxnP5GZm9wUBQ8OTc").await?;
//!
//! pool.shutdown_token().cancelled().await;
//! pool.stop().await?;
//! ```

pub mod fetcher;
pub mod job;
pub mod queue;
pub mod store;
pub mod worker;
pub mod worker_pool;

pub use fetcher::JobFetcher;
pub use job::{FrontierKeys, FrontierState, JobId, JobStatus, QueueStats};
pub use queue::{FrontierStore, RedisFrontier};
pub use store::MemoryFrontier;
pub use worker::{discover_artists, IntervalStats, Worker, WorkerError, WorkerHandle, WorkerState, WorkerStatus};
pub use worker_pool::{PoolError, PoolSnapshot, WorkerPool, WorkerPoolConfig};
