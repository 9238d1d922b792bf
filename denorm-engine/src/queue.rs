//! Task queue
//!
//! Wraps a [`TaskStore`] with the engine's retry policy, handler-name checks
//! and a wake signal for idle workers.

use crate::config::EngineConfig;
use crate::registry::HandlerRegistry;
use chrono::Utc;
use denorm_core::{ClaimedTask, DenormResult, DenormalizationTask, TaskError, TaskKey};
use denorm_storage::{CompletionOutcome, EnqueueOutcome, FailureOutcome, TaskStats, TaskStore};
use std::sync::Arc;
use tokio::sync::Notify;

pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    config: EngineConfig,
    wake: Notify,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, registry: Arc<HandlerRegistry>, config: EngineConfig) -> Self {
        Self {
            store,
            registry,
            config,
            wake: Notify::new(),
        }
    }

    /// Store a refresh request, collapsing with any existing one for its key.
    pub async fn enqueue(&self, task: DenormalizationTask) -> DenormResult<EnqueueOutcome> {
        if let Some(handler) = &task.handler {
            if !self.registry.contains(handler) {
                return Err(TaskError::UnknownHandler {
                    handler: handler.clone(),
                }
                .into());
            }
        }

        let key = task.key.clone();
        let outcome = self.store.enqueue(task).await?;
        tracing::debug!(
            model = %key.model,
            field = %key.field,
            object_id = %key.object_id,
            outcome = ?outcome,
            "Task enqueued"
        );
        if outcome != EnqueueOutcome::Requeued {
            self.wake.notify_waiters();
        }
        Ok(outcome)
    }

    pub async fn claim(&self, key: &TaskKey) -> DenormResult<Option<ClaimedTask>> {
        self.store.claim(key, self.config.lease_duration).await
    }

    pub async fn claim_next(&self) -> DenormResult<Option<ClaimedTask>> {
        self.store.claim_next(self.config.lease_duration).await
    }

    pub async fn complete(&self, claimed: ClaimedTask) -> DenormResult<CompletionOutcome> {
        let outcome = self.store.complete(claimed).await?;
        if outcome == CompletionOutcome::Rescheduled {
            self.wake.notify_waiters();
        }
        Ok(outcome)
    }

    /// Record a failure. Retryable failures back off exponentially; others
    /// park the task at once.
    pub async fn fail(
        &self,
        claimed: ClaimedTask,
        error: &str,
        retryable: bool,
    ) -> DenormResult<FailureOutcome> {
        let attempts = claimed.task.attempts + 1;
        let delay = self.config.retry_delay(attempts);
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let max_attempts = if retryable { self.config.max_attempts } else { 0 };
        self.store.fail(claimed, error, retry_at, max_attempts).await
    }

    pub async fn get(&self, key: &TaskKey) -> DenormResult<Option<DenormalizationTask>> {
        self.store.get(key).await
    }

    pub async fn parked(&self) -> DenormResult<Vec<DenormalizationTask>> {
        self.store.parked().await
    }

    pub async fn revive(&self, key: &TaskKey) -> DenormResult<bool> {
        let revived = self.store.revive(key).await?;
        if revived {
            self.wake.notify_waiters();
        }
        Ok(revived)
    }

    pub async fn stats(&self) -> DenormResult<TaskStats> {
        self.store.stats().await
    }

    /// Resolves on the next enqueue, reschedule or revive.
    pub(crate) async fn woken(&self) {
        self.wake.notified().await
    }
}
