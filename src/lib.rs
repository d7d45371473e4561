//! metaraid: breadth-first crawler of a music catalog's artist graph.
//!
//! Artists form a frontier persisted in Redis. A pool of workers, one per
//! API credential, fetches each artist's tracks with their audio features,
//! stores them, and enqueues the collaborating artists it discovers. The
//! collected tracks can then be exported to Parquet.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod scheduler;
pub mod storage;

pub use error::{ConfigError, ExportError, FetchError, StoreError};
