//! Job definitions for the crawl frontier.
//!
//! This module defines the core types of the frontier lifecycle:
//!
//! - `JobId`: an artist identifier, the unit of crawl work
//! - `JobStatus`: `pending -> working -> done`, plus `working -> pending` on recovery
//! - `FrontierKeys`: names of the Redis keys backing the frontier
//! - `FrontierState`: the lifecycle as pure transitions over the three job sets
//! - `QueueStats`: cardinalities of the job sets

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An artist identifier. Opaque to the frontier.
pub type JobId = String;

/// Status of a job, mirrored by its set membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Working,
    Done,
}

impl JobStatus {
    /// Value stored in the `status` field of the job record.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Working => "working",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "working" => Ok(Self::Working),
            "done" => Ok(Self::Done),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Key names of the frontier in the job store.
///
/// The defaults are the wire contract shared with every other process that
/// reads the frontier; a different namespace is only useful for isolating
/// tests on a shared server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontierKeys {
    pub pending: String,
    pub working: String,
    pub done: String,
    /// Prefix of the per-job status hash (`job:<id>`).
    pub job_prefix: String,
}

impl Default for FrontierKeys {
    fn default() -> Self {
        Self {
            pending: "pending".to_string(),
            working: "working".to_string(),
            done: "done".to_string(),
            job_prefix: "job:".to_string(),
        }
    }
}

impl FrontierKeys {
    /// Keys with every name prefixed by `namespace:`.
    pub fn namespaced(namespace: &str) -> Self {
        Self {
            pending: format!("{}:pending", namespace),
            working: format!("{}:working", namespace),
            done: format!("{}:done", namespace),
            job_prefix: format!("{}:job:", namespace),
        }
    }

    /// Key of the status hash for `id`.
    pub fn job_key(&self, id: &str) -> String {
        format!("{}{}", self.job_prefix, id)
    }
}

/// The frontier as plain data.
///
/// Every transition updates the status record and the set membership
/// together, so the two never drift. Stores that lack server-side scripting
/// apply these transitions under their own atomicity primitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontierState {
    pending: HashSet<JobId>,
    working: HashSet<JobId>,
    done: HashSet<JobId>,
    statuses: HashMap<JobId, JobStatus>,
}

impl FrontierState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pending job for every id without a status record.
    ///
    /// Returns one flag per input id, `true` when that id was created. An id
    /// repeated within the batch is created once.
    pub fn enqueue(&mut self, ids: &[JobId]) -> Vec<bool> {
        ids.iter()
            .map(|id| {
                if self.statuses.contains_key(id) {
                    return false;
                }
                self.statuses.insert(id.clone(), JobStatus::Pending);
                self.pending.insert(id.clone());
                true
            })
            .collect()
    }

    /// Moves up to `count` arbitrary pending jobs to working.
    pub fn pop(&mut self, count: usize) -> Vec<JobId> {
        let picked: Vec<JobId> = self.pending.iter().take(count).cloned().collect();
        for id in &picked {
            self.pending.remove(id);
            self.working.insert(id.clone());
            self.statuses.insert(id.clone(), JobStatus::Working);
        }
        picked
    }

    /// Moves `id` from working to done. No-op unless `id` is working.
    pub fn complete(&mut self, id: &str) -> bool {
        if !self.working.remove(id) {
            return false;
        }
        self.done.insert(id.to_string());
        self.statuses.insert(id.to_string(), JobStatus::Done);
        true
    }

    /// Moves every working job back to pending.
    pub fn recover_stalled(&mut self) -> usize {
        let stalled: Vec<JobId> = self.working.drain().collect();
        for id in &stalled {
            self.pending.insert(id.clone());
            self.statuses.insert(id.clone(), JobStatus::Pending);
        }
        stalled.len()
    }

    pub fn status_of(&self, id: &str) -> Option<JobStatus> {
        self.statuses.get(id).copied()
    }

    pub fn pending(&self) -> &HashSet<JobId> {
        &self.pending
    }

    pub fn working(&self) -> &HashSet<JobId> {
        &self.working
    }

    pub fn done(&self) -> &HashSet<JobId> {
        &self.done
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending_jobs: self.pending.len(),
            working_jobs: self.working.len(),
            done_jobs: self.done.len(),
        }
    }
}

/// Statistics about frontier state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Jobs waiting to be claimed.
    pub pending_jobs: usize,
    /// Jobs claimed by a worker (or stranded by a crash).
    pub working_jobs: usize,
    /// Jobs finished for good.
    pub done_jobs: usize,
}

impl QueueStats {
    /// Every artist id the frontier has ever seen.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.working_jobs + self.done_jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<JobId> {
        values.iter().map(|v| v.to_string()).collect()
    }

    /// Every known id sits in exactly the set its status names.
    fn assert_consistent(state: &FrontierState) {
        for (id, status) in &state.statuses {
            let in_pending = state.pending.contains(id);
            let in_working = state.working.contains(id);
            let in_done = state.done.contains(id);
            match status {
                JobStatus::Pending => assert!(in_pending && !in_working && !in_done, "{}", id),
                JobStatus::Working => assert!(!in_pending && in_working && !in_done, "{}", id),
                JobStatus::Done => assert!(!in_pending && !in_working && in_done, "{}", id),
            }
        }
        assert_eq!(
            state.statuses.len(),
            state.pending.len() + state.working.len() + state.done.len()
        );
    }

    #[test]
    fn test_job_status_roundtrip_str() {
        for status in [JobStatus::Pending, JobStatus::Working, JobStatus::Done] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("stalled".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_default_keys_match_wire_contract() {
        let keys = FrontierKeys::default();
        assert_eq!(keys.pending, "pending");
        assert_eq!(keys.working, "working");
        assert_eq!(keys.done, "done");
        assert_eq!(keys.job_key("4Z8W4fKeB5YxbusRsdQVPb"), "job:4Z8W4fKeB5YxbusRsdQVPb");

        let ns = FrontierKeys::namespaced("test");
        assert_eq!(ns.pending, "test:pending");
        assert_eq!(ns.job_key("a"), "test:job:a");
    }

    #[test]
    fn test_enqueue_dedup() {
        let mut state = FrontierState::new();

        assert_eq!(state.enqueue(&ids(&["A", "B"])), vec![true, true]);
        assert_eq!(state.enqueue(&ids(&["A", "C"])), vec![false, true]);
        assert_eq!(state.enqueue(&ids(&["D", "D"])), vec![true, false]);

        assert_eq!(state.pending().len(), 4);
        assert_consistent(&state);
    }

    #[test]
    fn test_pop_moves_to_working() {
        let mut state = FrontierState::new();
        state.enqueue(&ids(&["A", "B", "C"]));

        let first = state.pop(2);
        assert_eq!(first.len(), 2);
        let second = state.pop(5);
        assert_eq!(second.len(), 1);
        assert!(state.pop(5).is_empty());

        let all: HashSet<_> = first.iter().chain(second.iter()).cloned().collect();
        assert_eq!(all.len(), 3);
        assert_eq!(state.working().len(), 3);
        assert!(state.pending().is_empty());
        assert_consistent(&state);
    }

    #[test]
    fn test_complete_is_terminal() {
        let mut state = FrontierState::new();
        state.enqueue(&ids(&["A"]));
        let popped = state.pop(1);
        assert_eq!(popped, ids(&["A"]));

        assert!(state.complete("A"));
        assert_eq!(state.status_of("A"), Some(JobStatus::Done));
        assert!(state.working().is_empty());
        assert!(state.done().contains("A"));

        // done doubles as the seen-set
        assert_eq!(state.enqueue(&ids(&["A"])), vec![false]);
        assert!(state.pending().is_empty());
        assert_consistent(&state);
    }

    #[test]
    fn test_complete_without_claim_is_noop() {
        let mut state = FrontierState::new();
        state.enqueue(&ids(&["A"]));

        assert!(!state.complete("A"));
        assert!(!state.complete("unknown"));
        assert_eq!(state.status_of("A"), Some(JobStatus::Pending));
        assert!(state.done().is_empty());
        assert_consistent(&state);
    }

    #[test]
    fn test_recover_stalled() {
        let mut state = FrontierState::new();
        state.enqueue(&ids(&["A", "B", "C", "D", "E", "F"]));
        let popped: HashSet<_> = state.pop(5).into_iter().collect();

        assert_eq!(state.recover_stalled(), 5);
        assert!(state.working().is_empty());
        assert_eq!(state.pending().len(), 6);
        assert!(popped.iter().all(|id| state.pending().contains(id)));
        assert!(popped
            .iter()
            .all(|id| state.status_of(id) == Some(JobStatus::Pending)));
        assert_eq!(state.recover_stalled(), 0);
        assert_consistent(&state);
    }

    #[test]
    fn test_queue_stats() {
        let mut state = FrontierState::new();
        state.enqueue(&ids(&["A", "B", "C"]));
        state.pop(2);
        let working: Vec<_> = state.working().iter().cloned().collect();
        state.complete(&working[0]);

        let stats = state.stats();
        assert_eq!(stats.pending_jobs, 1);
        assert_eq!(stats.working_jobs, 1);
        assert_eq!(stats.done_jobs, 1);
        assert_eq!(stats.total_jobs(), 3);
    }
}
