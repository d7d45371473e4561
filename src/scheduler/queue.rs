//! Redis-backed crawl frontier with atomic transitions.
//!
//! The frontier is stored as three Redis sets plus one status hash per job:
//!
//! - `pending`: jobs waiting to be claimed
//! - `working`: jobs claimed by a worker (or stranded by a crash)
//! - `done`: finished jobs; doubles as the seen-set for deduplication
//! - `job:<id>`: hash with a single `status` field mirroring set membership
//!
//! # Atomicity
//!
//! Every transition runs as a Lua script, so the check-and-mutate across a
//! set and a status hash is indivisible. Two workers can never claim the same
//! job, and two workers discovering the same artist can never both create it.
//! Nothing else writes these keys.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use super::job::{FrontierKeys, JobId, QueueStats};
use crate::error::StoreError;

/// The frontier queue contract.
///
/// Only whole-lifecycle operations are exposed; there is no way to touch a
/// set or a status field on its own.
#[async_trait]
pub trait FrontierStore: Send + Sync {
    /// Creates a pending job for every id the store has never seen.
    ///
    /// Returns the number of jobs created. Atomic per id.
    async fn enqueue(&self, ids: &[JobId]) -> Result<usize, StoreError>;

    /// Claims up to `count` arbitrary pending jobs. Never blocks.
    async fn pop(&self, count: usize) -> Result<Vec<JobId>, StoreError>;

    /// Marks a claimed job as done.
    ///
    /// Returns `false` (and changes nothing) when `id` was not working.
    async fn complete(&self, id: &str) -> Result<bool, StoreError>;

    /// Moves every working job back to pending. Run once at boot, before any
    /// `pop`.
    async fn recover_stalled(&self) -> Result<usize, StoreError>;

    /// Number of pending jobs.
    async fn pending_len(&self) -> Result<usize, StoreError>;

    /// Cardinalities of the three job sets.
    async fn counts(&self) -> Result<QueueStats, StoreError>;

    /// Enqueues `seed` when nothing is pending. Returns whether the seed was
    /// created.
    async fn ensure_seed(&self, seed: &str) -> Result<bool, StoreError> {
        if self.pending_len().await? > 0 {
            info!("job queue is not empty, no seed job needed");
            return Ok(false);
        }

        info!(seed = %seed, "job queue is empty, adding seed job");
        let created = self.enqueue(&[seed.to_string()]).await?;
        if created == 0 {
            info!(seed = %seed, "seed artist already crawled");
        }
        Ok(created > 0)
    }
}

/// Lua sources of the frontier transitions.
mod scripts {
    use redis::Script;

    /// KEYS: pending. ARGV: job prefix, ids...
    pub fn enqueue() -> Script {
        Script::new(
            r#"
            local pending = KEYS[1]
            local prefix = ARGV[1]
            local results = {}

            for i = 2, #ARGV do
                local id = ARGV[i]
                local created = redis.call("HSETNX", prefix .. id, "status", "pending")
                if created == 1 then
                    redis.call("SADD", pending, id)
                end
                results[i - 1] = created
            end

            return results
            "#,
        )
    }

    /// KEYS: pending, working. ARGV: count, job prefix.
    pub fn pop() -> Script {
        Script::new(
            r#"
            local pending = KEYS[1]
            local working = KEYS[2]
            local count = tonumber(ARGV[1])
            local prefix = ARGV[2]

            local jobs = redis.call("SPOP", pending, count)
            for _, id in ipairs(jobs) do
                redis.call("HSET", prefix .. id, "status", "working")
                redis.call("SADD", working, id)
            end

            return jobs
            "#,
        )
    }

    /// KEYS: working, done. ARGV: job prefix, id.
    pub fn complete() -> Script {
        Script::new(
            r#"
            local working = KEYS[1]
            local done = KEYS[2]
            local prefix = ARGV[1]
            local id = ARGV[2]

            if redis.call("SREM", working, id) == 0 then
                return 0
            end
            redis.call("SADD", done, id)
            redis.call("HSET", prefix .. id, "status", "done")

            return 1
            "#,
        )
    }

    /// KEYS: working, pending. ARGV: job prefix.
    pub fn recover_stalled() -> Script {
        Script::new(
            r#"
            local working = KEYS[1]
            local pending = KEYS[2]
            local prefix = ARGV[1]

            local jobs = redis.call("SMEMBERS", working)
            if #jobs == 0 then
                return 0
            end

            for _, id in ipairs(jobs) do
                redis.call("SADD", pending, id)
                redis.call("HSET", prefix .. id, "status", "pending")
            end
            redis.call("DEL", working)

            return #jobs
            "#,
        )
    }
}

struct FrontierScripts {
    enqueue: Script,
    pop: Script,
    complete: Script,
    recover_stalled: Script,
}

impl FrontierScripts {
    fn load() -> Self {
        Self {
            enqueue: scripts::enqueue(),
            pop: scripts::pop(),
            complete: scripts::complete(),
            recover_stalled: scripts::recover_stalled(),
        }
    }
}

/// Frontier stored in Redis.
pub struct RedisFrontier {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    keys: FrontierKeys,
    scripts: FrontierScripts,
}

impl RedisFrontier {
    /// Connects to Redis and creates a frontier over `keys`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, keys: FrontierKeys) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, keys))
    }

    /// Creates a frontier from an existing ConnectionManager.
    ///
    /// Useful when sharing the connection with the record sink.
    pub fn from_connection(redis: ConnectionManager, keys: FrontierKeys) -> Self {
        Self {
            redis,
            keys,
            scripts: FrontierScripts::load(),
        }
    }

    pub fn keys(&self) -> &FrontierKeys {
        &self.keys
    }
}

#[async_trait]
impl FrontierStore for RedisFrontier {
    async fn enqueue(&self, ids: &[JobId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.redis.clone();
        let flags: Vec<i64> = self
            .scripts
            .enqueue
            .key(&self.keys.pending)
            .arg(&self.keys.job_prefix)
            .arg(ids)
            .invoke_async(&mut conn)
            .await?;

        if flags.len() != ids.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "enqueue returned {} flags for {} ids",
                flags.len(),
                ids.len()
            )));
        }

        let mut created = 0;
        for (id, flag) in ids.iter().zip(&flags) {
            if *flag == 1 {
                created += 1;
                debug!(job = %id, "job added to queue");
            } else {
                debug!(job = %id, "job already exists");
            }
        }
        Ok(created)
    }

    async fn pop(&self, count: usize) -> Result<Vec<JobId>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let jobs: Vec<String> = self
            .scripts
            .pop
            .key(&self.keys.pending)
            .key(&self.keys.working)
            .arg(count)
            .arg(&self.keys.job_prefix)
            .invoke_async(&mut conn)
            .await?;

        Ok(jobs)
    }

    async fn complete(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let moved: i64 = self
            .scripts
            .complete
            .key(&self.keys.working)
            .key(&self.keys.done)
            .arg(&self.keys.job_prefix)
            .arg(id)
            .invoke_async(&mut conn)
            .await?;

        Ok(moved == 1)
    }

    async fn recover_stalled(&self) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let recovered: usize = self
            .scripts
            .recover_stalled
            .key(&self.keys.working)
            .key(&self.keys.pending)
            .arg(&self.keys.job_prefix)
            .invoke_async(&mut conn)
            .await?;

        Ok(recovered)
    }

    async fn pending_len(&self) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.scard(&self.keys.pending).await?;
        Ok(len)
    }

    async fn counts(&self) -> Result<QueueStats, StoreError> {
        let mut conn = self.redis.clone();
        let (pending_jobs, working_jobs, done_jobs): (usize, usize, usize) = redis::pipe()
            .scard(&self.keys.pending)
            .scard(&self.keys.working)
            .scard(&self.keys.done)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            pending_jobs,
            working_jobs,
            done_jobs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_are_distinct() {
        let scripts = FrontierScripts::load();
        let hashes = [
            scripts.enqueue.get_hash(),
            scripts.pop.get_hash(),
            scripts.complete.get_hash(),
            scripts.recover_stalled.get_hash(),
        ];
        for (i, a) in hashes.iter().enumerate() {
            for b in &hashes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = StoreError::UnexpectedReply("enqueue returned 1 flags for 2 ids".to_string());
        assert!(err.to_string().contains("2 ids"));
    }
}
