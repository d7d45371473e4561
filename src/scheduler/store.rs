//! In-process frontier.
//!
//! Applies the `FrontierState` transitions under a single mutex, which plays
//! the role Redis' single-threaded script execution plays for
//! `RedisFrontier`. Nothing is durable; used by tests and local dry runs.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::job::{FrontierState, JobId, QueueStats};
use super::queue::FrontierStore;
use crate::error::StoreError;

#[derive(Debug, Default)]
pub struct MemoryFrontier {
    state: Mutex<FrontierState>,
}

impl MemoryFrontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a frontier that already holds `state`.
    pub fn with_state(state: FrontierState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// A copy of the current frontier, for inspection.
    pub fn snapshot(&self) -> Result<FrontierState, StoreError> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, FrontierState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl FrontierStore for MemoryFrontier {
    async fn enqueue(&self, ids: &[JobId]) -> Result<usize, StoreError> {
        let flags = self.lock()?.enqueue(ids);
        let created = flags.iter().filter(|created| **created).count();
        debug!(requested = ids.len(), created, "jobs enqueued");
        Ok(created)
    }

    async fn pop(&self, count: usize) -> Result<Vec<JobId>, StoreError> {
        Ok(self.lock()?.pop(count))
    }

    async fn complete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.complete(id))
    }

    async fn recover_stalled(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.recover_stalled())
    }

    async fn pending_len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.pending().len())
    }

    async fn counts(&self) -> Result<QueueStats, StoreError> {
        Ok(self.lock()?.stats())
    }
}
