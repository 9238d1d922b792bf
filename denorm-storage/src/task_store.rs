//! Task persistence collaborator.
//!
//! One entry per [`TaskKey`]. A second request for a key never creates a
//! second entry: a pending task is superseded in place, and a claimed task
//! is marked for another run once the in-flight execution settles.
//!
//! Each entry carries a generation counter bumped by every enqueue. The
//! generation observed at claim time travels in the lease; completing a
//! claim whose generation is stale reschedules the task instead of deleting
//! it, so a source change that raced with execution is never lost.

use async_trait::async_trait;
use chrono::Utc;
use denorm_core::{
    ClaimedTask, DenormResult, DenormalizationTask, LeaseData, TaskError, TaskKey, TaskState,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

// ============================================================================
// OUTCOMES
// ============================================================================

/// What an enqueue did to the stored entry for its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnqueueOutcome {
    /// No entry existed; a new pending task was stored
    Inserted,
    /// A pending or parked task was updated in place
    Superseded,
    /// The key is claimed; it will run again after the current execution
    Requeued,
}

/// What completing a claim did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionOutcome {
    /// Task deleted
    Deleted,
    /// A newer request arrived while claimed; the task is pending again
    Rescheduled,
}

/// What recording a failure did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureOutcome {
    /// Pending again, claimable from `retry_at`
    Retrying { retry_at: Timestamp },
    /// Retry budget exhausted; kept for operators
    Parked,
}

/// Entry counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: usize,
    pub claimed: usize,
    pub parked: usize,
}

impl TaskStats {
    /// Tasks that still need to run (pending or in flight).
    pub fn outstanding(&self) -> usize {
        self.pending + self.claimed
    }
}

// ============================================================================
// TRAIT
// ============================================================================

/// Durable, keyed store of refresh tasks with atomic per-key claims.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Store a request, collapsing with any existing entry for its key.
    async fn enqueue(&self, task: DenormalizationTask) -> DenormResult<EnqueueOutcome>;

    /// Claim one key. `None` when the key has no claimable task.
    async fn claim(&self, key: &TaskKey, lease: Duration) -> DenormResult<Option<ClaimedTask>>;

    /// Claim the oldest claimable task of any key.
    async fn claim_next(&self, lease: Duration) -> DenormResult<Option<ClaimedTask>>;

    /// Settle a successful execution.
    async fn complete(&self, claimed: ClaimedTask) -> DenormResult<CompletionOutcome>;

    /// Settle a failed execution, scheduling a retry or parking the task
    /// once `max_attempts` failures have accumulated.
    async fn fail(
        &self,
        claimed: ClaimedTask,
        error: &str,
        retry_at: Timestamp,
        max_attempts: u32,
    ) -> DenormResult<FailureOutcome>;

    /// The stored task for `key`, whatever its state.
    async fn get(&self, key: &TaskKey) -> DenormResult<Option<DenormalizationTask>>;

    /// Parked tasks, for operator inspection.
    async fn parked(&self) -> DenormResult<Vec<DenormalizationTask>>;

    /// Return a parked task to the queue with a fresh retry budget.
    async fn revive(&self, key: &TaskKey) -> DenormResult<bool>;

    async fn stats(&self) -> DenormResult<TaskStats>;
}

// ============================================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================================

#[derive(Debug, Clone)]
struct TaskEntry {
    task: DenormalizationTask,
    state: TaskState,
    generation: u64,
    not_before: Timestamp,
    lease: Option<LeaseData>,
}

impl TaskEntry {
    fn is_claimable(&self, now: Timestamp) -> bool {
        match self.state {
            TaskState::Pending => self.not_before <= now,
            TaskState::Claimed => self.lease.as_ref().map_or(true, |l| l.is_expired(now)),
            TaskState::Parked => false,
        }
    }

    fn claim(&mut self, now: Timestamp, duration: Duration) -> ClaimedTask {
        let lease = LeaseData::new(self.task.key.clone(), now, duration, self.generation);
        self.state = TaskState::Claimed;
        self.lease = Some(lease.clone());
        ClaimedTask {
            task: self.task.clone(),
            lease,
        }
    }

    fn release(&mut self, not_before: Timestamp) {
        self.state = TaskState::Pending;
        self.lease = None;
        self.not_before = not_before;
    }
}

/// In-memory task store. A single lock serializes claims.
#[derive(Default)]
pub struct InMemoryTaskStore {
    entries: RwLock<HashMap<TaskKey, TaskEntry>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live entry for a claim, or `LeaseLost` if the claim was taken over.
    fn owned_entry<'a>(
        entries: &'a mut HashMap<TaskKey, TaskEntry>,
        claimed: &ClaimedTask,
    ) -> DenormResult<&'a mut TaskEntry> {
        let lost = || TaskError::LeaseLost {
            key: claimed.key().to_string(),
        };
        let entry = entries.get_mut(claimed.key()).ok_or_else(lost)?;
        let owned = entry.state == TaskState::Claimed
            && entry
                .lease
                .as_ref()
                .is_some_and(|lease| lease.lease_id == claimed.lease.lease_id);
        if owned {
            Ok(entry)
        } else {
            Err(lost().into())
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: DenormalizationTask) -> DenormResult<EnqueueOutcome> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&task.key) else {
            entries.insert(
                task.key.clone(),
                TaskEntry {
                    task,
                    state: TaskState::Pending,
                    generation: 1,
                    not_before: now,
                    lease: None,
                },
            );
            return Ok(EnqueueOutcome::Inserted);
        };

        entry.task.supersede(task);
        entry.generation += 1;
        match entry.state {
            TaskState::Claimed => Ok(EnqueueOutcome::Requeued),
            TaskState::Pending | TaskState::Parked => {
                entry.release(now);
                Ok(EnqueueOutcome::Superseded)
            }
        }
    }

    async fn claim(&self, key: &TaskKey, lease: Duration) -> DenormResult<Option<ClaimedTask>> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        Ok(entries
            .get_mut(key)
            .filter(|entry| entry.is_claimable(now))
            .map(|entry| entry.claim(now, lease)))
    }

    async fn claim_next(&self, lease: Duration) -> DenormResult<Option<ClaimedTask>> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        Ok(entries
            .values_mut()
            .filter(|entry| entry.is_claimable(now))
            .min_by(|a, b| {
                (a.not_before, a.task.enqueued_at, &a.task.key)
                    .cmp(&(b.not_before, b.task.enqueued_at, &b.task.key))
            })
            .map(|entry| entry.claim(now, lease)))
    }

    async fn complete(&self, claimed: ClaimedTask) -> DenormResult<CompletionOutcome> {
        let mut entries = self.entries.write().await;
        let entry = Self::owned_entry(&mut entries, &claimed)?;
        if entry.generation != claimed.lease.generation {
            entry.release(Utc::now());
            return Ok(CompletionOutcome::Rescheduled);
        }
        entries.remove(claimed.key());
        Ok(CompletionOutcome::Deleted)
    }

    async fn fail(
        &self,
        claimed: ClaimedTask,
        error: &str,
        retry_at: Timestamp,
        max_attempts: u32,
    ) -> DenormResult<FailureOutcome> {
        let mut entries = self.entries.write().await;
        let entry = Self::owned_entry(&mut entries, &claimed)?;
        entry.task.last_error = Some(error.to_string());

        // A newer request during execution resets the retry history.
        if entry.generation != claimed.lease.generation {
            let now = Utc::now();
            entry.release(now);
            return Ok(FailureOutcome::Retrying { retry_at: now });
        }

        entry.task.attempts += 1;
        if entry.task.attempts >= max_attempts {
            entry.state = TaskState::Parked;
            entry.lease = None;
            return Ok(FailureOutcome::Parked);
        }
        entry.release(retry_at);
        Ok(FailureOutcome::Retrying { retry_at })
    }

    async fn get(&self, key: &TaskKey) -> DenormResult<Option<DenormalizationTask>> {
        Ok(self.entries.read().await.get(key).map(|e| e.task.clone()))
    }

    async fn parked(&self) -> DenormResult<Vec<DenormalizationTask>> {
        let entries = self.entries.read().await;
        let mut parked: Vec<_> = entries
            .values()
            .filter(|e| e.state == TaskState::Parked)
            .map(|e| e.task.clone())
            .collect();
        parked.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(parked)
    }

    async fn revive(&self, key: &TaskKey) -> DenormResult<bool> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.state == TaskState::Parked => {
                entry.task.attempts = 0;
                entry.release(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stats(&self) -> DenormResult<TaskStats> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        let mut stats = TaskStats::default();
        for entry in entries.values() {
            match entry.state {
                TaskState::Pending => stats.pending += 1,
                // An expired claim is abandoned work waiting to be reclaimed.
                TaskState::Claimed if entry.is_claimable(now) => stats.pending += 1,
                TaskState::Claimed => stats.claimed += 1,
                TaskState::Parked => stats.parked += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use denorm_core::{new_entity_id, DenormError};

    const LEASE: Duration = Duration::from_secs(30);

    fn task(field: &str) -> DenormalizationTask {
        DenormalizationTask::new(TaskKey::new("Tenant", field, new_entity_id()))
            .with_id_paths(["house.id"])
    }

    #[tokio::test]
    async fn test_rapid_enqueues_collapse() {
        let store = InMemoryTaskStore::new();
        let first = task("house");
        let second = DenormalizationTask::new(first.key.clone()).with_id_paths(["house.id"]);

        assert_eq!(store.enqueue(first.clone()).await.unwrap(), EnqueueOutcome::Inserted);
        assert_eq!(store.enqueue(second).await.unwrap(), EnqueueOutcome::Superseded);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(store.get(&first.key).await.unwrap().unwrap().id_paths, vec!["house.id"]);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_per_key() {
        let store = InMemoryTaskStore::new();
        let t = task("house");
        store.enqueue(t.clone()).await.unwrap();

        let claimed = store.claim(&t.key, LEASE).await.unwrap();
        assert!(claimed.is_some());
        assert!(store.claim(&t.key, LEASE).await.unwrap().is_none());
        assert!(store.claim_next(LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_distinct_keys_claim_independently() {
        let store = InMemoryTaskStore::new();
        store.enqueue(task("house")).await.unwrap();
        store.enqueue(task("owner")).await.unwrap();
        let a = store.claim_next(LEASE).await.unwrap().unwrap();
        let b = store.claim_next(LEASE).await.unwrap().unwrap();
        assert_ne!(a.key(), b.key());
        assert_eq!(store.stats().await.unwrap().claimed, 2);
    }

    #[tokio::test]
    async fn test_complete_deletes() {
        let store = InMemoryTaskStore::new();
        let t = task("house");
        store.enqueue(t.clone()).await.unwrap();
        let claimed = store.claim(&t.key, LEASE).await.unwrap().unwrap();
        assert_eq!(store.complete(claimed).await.unwrap(), CompletionOutcome::Deleted);
        assert!(store.get(&t.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_while_claimed_reschedules() {
        let store = InMemoryTaskStore::new();
        let t = task("house");
        store.enqueue(t.clone()).await.unwrap();
        let claimed = store.claim(&t.key, LEASE).await.unwrap().unwrap();

        let newer = DenormalizationTask::new(t.key.clone());
        assert_eq!(store.enqueue(newer).await.unwrap(), EnqueueOutcome::Requeued);
        assert_eq!(store.complete(claimed).await.unwrap(), CompletionOutcome::Rescheduled);

        let again = store.claim(&t.key, LEASE).await.unwrap().unwrap();
        assert_eq!(store.complete(again).await.unwrap(), CompletionOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable_and_old_claim_is_lost() {
        let store = InMemoryTaskStore::new();
        let t = task("house");
        store.enqueue(t.clone()).await.unwrap();
        let stale = store.claim(&t.key, Duration::ZERO).await.unwrap().unwrap();

        let fresh = store.claim(&t.key, LEASE).await.unwrap();
        assert!(fresh.is_some());

        let err = store.complete(stale).await.unwrap_err();
        assert!(matches!(err, DenormError::Task(TaskError::LeaseLost { .. })));
    }

    #[tokio::test]
    async fn test_fail_retries_then_parks() {
        let store = InMemoryTaskStore::new();
        let t = task("house");
        store.enqueue(t.clone()).await.unwrap();

        let claimed = store.claim(&t.key, LEASE).await.unwrap().unwrap();
        let outcome = store.fail(claimed, "write failed", Utc::now(), 2).await.unwrap();
        assert!(matches!(outcome, FailureOutcome::Retrying { .. }));

        let claimed = store.claim(&t.key, LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.task.attempts, 1);
        let outcome = store.fail(claimed, "write failed", Utc::now(), 2).await.unwrap();
        assert_eq!(outcome, FailureOutcome::Parked);

        assert!(store.claim(&t.key, LEASE).await.unwrap().is_none());
        let parked = store.parked().await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].last_error.as_deref(), Some("write failed"));

        assert!(store.revive(&t.key).await.unwrap());
        assert!(store.claim(&t.key, LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_backoff_delays_claim() {
        let store = InMemoryTaskStore::new();
        let t = task("house");
        store.enqueue(t.clone()).await.unwrap();
        let claimed = store.claim(&t.key, LEASE).await.unwrap().unwrap();
        let later = Utc::now() + chrono::Duration::seconds(60);
        store.fail(claimed, "boom", later, 5).await.unwrap();

        assert!(store.claim_next(LEASE).await.unwrap().is_none());
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_fresh_request_revives_parked_task() {
        let store = InMemoryTaskStore::new();
        let t = task("house");
        store.enqueue(t.clone()).await.unwrap();
        let claimed = store.claim(&t.key, LEASE).await.unwrap().unwrap();
        store.fail(claimed, "boom", Utc::now(), 1).await.unwrap();
        assert_eq!(store.stats().await.unwrap().parked, 1);

        let outcome = store.enqueue(DenormalizationTask::new(t.key.clone())).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Superseded);
        let claimed = store.claim(&t.key, LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.task.attempts, 0);
    }
}
