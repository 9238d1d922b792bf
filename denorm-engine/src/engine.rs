//! Cascade engine
//!
//! Ties the scheduler, queue and executor together behind the two entry
//! points a host application uses: `notify` from its source-write path, and
//! `spawn_workers` (or `drain`) to apply refreshes.
//!
//! ```ignore
//! let engine = CascadeEngine::builder()
//!     .schema(schema)
//!     .documents(documents)
//!     .handler("count_houses", Arc::new(CountHouses))
//!     .config(EngineConfig::from_env())
//!     .build()?;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let workers = engine.spawn_workers(shutdown_rx);
//!
//! // After a House write commits:
//! engine.notify("House", house_id, Some(&["address".to_string()])).await;
//!
//! let _ = shutdown_tx.send(true);
//! for worker in workers {
//!     if let Err(e) = worker.await {
//!         tracing::warn!(error = %e, "Cascade worker did not stop cleanly");
//!     }
//! }
//! ```

use crate::config::EngineConfig;
use crate::constants::LEASE_EXECUTION_PERCENT;
use crate::executor::{ExecutionOutcome, TaskExecutor};
use crate::queue::TaskQueue;
use crate::registry::{CustomHandler, HandlerRegistry};
use chrono::Utc;
use denorm_core::{
    reference_id, CascadeScheduler, ClaimedTask, ConfigError, DenormError,
    DenormResult, DenormalizationTask, EntityId, Filter, FilterExpr, MirrorSource, SchemaError,
    SnapshotBuilder, SnapshotSchema, TaskError, TaskKey, ID_FIELD,
};
use denorm_storage::{
    CompletionOutcome, DocumentStore, EnqueueOutcome, FailureOutcome, InMemoryTaskStore,
    TaskStats, TaskStore,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for engine activity since startup.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub tasks_enqueued: AtomicU64,
    pub tasks_superseded: AtomicU64,
    pub tasks_requeued: AtomicU64,
    pub tasks_executed: AtomicU64,
    pub targets_written: AtomicU64,
    pub targets_nulled: AtomicU64,
    pub handler_runs: AtomicU64,
    pub task_failures: AtomicU64,
    pub tasks_parked: AtomicU64,
    /// Enqueue failures swallowed on the write path
    pub enqueue_errors: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            tasks_enqueued: self.tasks_enqueued.load(Ordering::Relaxed),
            tasks_superseded: self.tasks_superseded.load(Ordering::Relaxed),
            tasks_requeued: self.tasks_requeued.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            targets_written: self.targets_written.load(Ordering::Relaxed),
            targets_nulled: self.targets_nulled.load(Ordering::Relaxed),
            handler_runs: self.handler_runs.load(Ordering::Relaxed),
            task_failures: self.task_failures.load(Ordering::Relaxed),
            tasks_parked: self.tasks_parked.load(Ordering::Relaxed),
            enqueue_errors: self.enqueue_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of engine metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineMetricsSnapshot {
    pub tasks_enqueued: u64,
    pub tasks_superseded: u64,
    pub tasks_requeued: u64,
    pub tasks_executed: u64,
    pub targets_written: u64,
    pub targets_nulled: u64,
    pub handler_runs: u64,
    pub task_failures: u64,
    pub tasks_parked: u64,
    pub enqueue_errors: u64,
}

// ============================================================================
// REPORTS
// ============================================================================

/// Result of one `notify` call. Never an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Dependent types affected by the change
    pub dependents: usize,
    pub inserted: usize,
    pub superseded: usize,
    pub requeued: usize,
    /// Enqueues that failed and were swallowed
    pub failed: usize,
}

impl NotifyReport {
    /// Tasks accepted by the queue in any form.
    pub fn accepted(&self) -> usize {
        self.inserted + self.superseded + self.requeued
    }
}

/// Result of one `drain` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub executed: usize,
    /// Completed, but a newer request arrived meanwhile and was run again
    pub rescheduled: usize,
    pub failed: usize,
    pub parked: usize,
}

/// How processing one claimed task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Completed,
    Rescheduled,
    Retrying,
    Parked,
    LeaseLost,
}

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles and validates a [`CascadeEngine`]. Every startup check runs in
/// [`build`](Self::build): schema, dependency graph, handler names, config.
#[derive(Default)]
pub struct CascadeEngineBuilder {
    schema: Option<SnapshotSchema>,
    documents: Option<Arc<dyn DocumentStore>>,
    tasks: Option<Arc<dyn TaskStore>>,
    registry: HandlerRegistry,
    config: EngineConfig,
}

impl CascadeEngineBuilder {
    pub fn schema(mut self, schema: SnapshotSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    /// Task persistence; defaults to an in-memory store.
    pub fn tasks(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn handler(mut self, name: impl Into<String>, handler: Arc<dyn CustomHandler>) -> Self {
        self.registry.register(name, handler);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> DenormResult<CascadeEngine> {
        let schema = self.schema.ok_or_else(|| ConfigError::Missing {
            component: "schema".to_string(),
        })?;
        let documents = self.documents.ok_or_else(|| ConfigError::Missing {
            component: "document store".to_string(),
        })?;
        self.config.validate()?;

        let validated = schema
            .validate()
            .and_then(|_| self.registry.validate_against(&schema));
        if let Err(e) = validated {
            tracing::error!(error = %e, "Schema validation failed");
            return Err(e.into());
        }

        let schema = Arc::new(schema);
        let scheduler = CascadeScheduler::new(Arc::clone(&schema))?;
        let registry = Arc::new(self.registry);
        let tasks = self
            .tasks
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()) as Arc<dyn TaskStore>);

        tracing::info!(
            mirrors = schema.mirrors().count(),
            models = schema.models().count(),
            "Cascade engine built"
        );

        Ok(CascadeEngine {
            inner: Arc::new(EngineInner {
                queue: TaskQueue::new(tasks, Arc::clone(&registry), self.config.clone()),
                executor: TaskExecutor::new(Arc::clone(&schema), Arc::clone(&documents), registry),
                schema,
                scheduler,
                documents,
                config: self.config,
                metrics: EngineMetrics::new(),
            }),
        })
    }
}

// ============================================================================
// ENGINE
// ============================================================================

struct EngineInner {
    schema: Arc<SnapshotSchema>,
    scheduler: CascadeScheduler,
    queue: TaskQueue,
    executor: TaskExecutor,
    documents: Arc<dyn DocumentStore>,
    config: EngineConfig,
    metrics: EngineMetrics,
}

/// Denormalization cascade engine. Cheap to clone.
#[derive(Clone)]
pub struct CascadeEngine {
    inner: Arc<EngineInner>,
}

impl CascadeEngine {
    pub fn builder() -> CascadeEngineBuilder {
        CascadeEngineBuilder::default()
    }

    pub fn schema(&self) -> &SnapshotSchema {
        &self.inner.schema
    }

    pub fn scheduler(&self) -> &CascadeScheduler {
        &self.inner.scheduler
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub async fn stats(&self) -> DenormResult<TaskStats> {
        self.inner.queue.stats().await
    }

    /// Build a fresh mirror for a write path that creates a dependent.
    pub fn snapshot(&self, mirror_type: &str, source: &dyn MirrorSource) -> Result<Value, SchemaError> {
        SnapshotBuilder::new(&self.inner.schema).from_instance(mirror_type, source)
    }

    // ------------------------------------------------------------------------
    // Write-path entry points
    // ------------------------------------------------------------------------

    /// Schedule refreshes for everything derived from a changed source.
    ///
    /// Call after the source write commits. Enqueue failures are logged and
    /// counted, never returned: the source write always takes priority.
    pub async fn notify(
        &self,
        source_type: &str,
        source_id: EntityId,
        changed_fields: Option<&[String]>,
    ) -> NotifyReport {
        let affected = self
            .inner
            .scheduler
            .compute_affected(source_type, source_id, changed_fields);
        let mut report = NotifyReport {
            dependents: affected.len(),
            ..NotifyReport::default()
        };

        for dependent in &affected {
            for task in dependent.tasks() {
                self.enqueue_best_effort(task, &mut report).await;
            }
        }

        tracing::debug!(
            source_type,
            source_id = %source_id,
            dependents = report.dependents,
            accepted = report.accepted(),
            failed = report.failed,
            "Source change notified"
        );
        report
    }

    /// Two-phase write: await the source write, then notify best-effort.
    ///
    /// A failed write is returned and nothing is scheduled.
    pub async fn commit_then_notify<F, T, E>(
        &self,
        write: F,
        source_type: &str,
        source_id: EntityId,
        changed_fields: Option<&[String]>,
    ) -> Result<(T, NotifyReport), E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let written = write.await?;
        let report = self.notify(source_type, source_id, changed_fields).await;
        Ok((written, report))
    }

    /// Enqueue a refresh of `model.field` for every distinct source currently
    /// referenced by that mirror field, including bare id references.
    ///
    /// Used after adding a mirror field or recovering from an outage.
    pub async fn backfill(&self, model: &str, field: &str) -> DenormResult<usize> {
        self.inner.schema.mirror_spec_for(model, field)?;
        let docs = self
            .inner
            .documents
            .find_by_filter(model, &Filter::Expr(FilterExpr::exists(field)))
            .await?;
        let sources: BTreeSet<EntityId> = docs
            .iter()
            .filter_map(|d| d.get(field).and_then(reference_id))
            .collect();

        let mut report = NotifyReport::default();
        for source_id in &sources {
            let task = DenormalizationTask::new(TaskKey::new(model, field, *source_id))
                .with_id_paths([format!("{}.{}", field, ID_FIELD), field.to_string()]);
            self.enqueue_best_effort(task, &mut report).await;
        }

        tracing::info!(
            model,
            field,
            sources = sources.len(),
            accepted = report.accepted(),
            "Backfill enqueued"
        );
        Ok(report.accepted())
    }

    async fn enqueue_best_effort(&self, task: DenormalizationTask, report: &mut NotifyReport) {
        let metrics = &self.inner.metrics;
        let key = task.key.clone();
        match self.inner.queue.enqueue(task).await {
            Ok(EnqueueOutcome::Inserted) => {
                report.inserted += 1;
                metrics.tasks_enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Ok(EnqueueOutcome::Superseded) => {
                report.superseded += 1;
                metrics.tasks_superseded.fetch_add(1, Ordering::Relaxed);
            }
            Ok(EnqueueOutcome::Requeued) => {
                report.requeued += 1;
                metrics.tasks_requeued.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                report.failed += 1;
                metrics.enqueue_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %e,
                    model = %key.model,
                    field = %key.field,
                    object_id = %key.object_id,
                    "Enqueue failed, refresh dropped"
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Process claimable tasks until none remain or the batch limit is hit.
    pub async fn drain(&self) -> DenormResult<DrainReport> {
        let mut report = DrainReport::default();
        for _ in 0..self.inner.config.drain_batch_limit {
            let Some(claimed) = self.inner.queue.claim_next().await? else {
                break;
            };
            match self.process(claimed).await {
                Settled::Completed => report.executed += 1,
                Settled::Rescheduled => {
                    report.executed += 1;
                    report.rescheduled += 1;
                }
                Settled::Retrying => report.failed += 1,
                Settled::Parked => {
                    report.failed += 1;
                    report.parked += 1;
                }
                Settled::LeaseLost => {}
            }
        }
        Ok(report)
    }

    /// Claim and run one specific key, if it is claimable.
    pub async fn run_key(&self, key: &TaskKey) -> DenormResult<bool> {
        match self.inner.queue.claim(key).await? {
            Some(claimed) => {
                self.process(claimed).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Start `worker_count` workers that run until `shutdown_rx` turns true
    /// or its sender is dropped.
    pub fn spawn_workers(&self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.inner.config.worker_count)
            .map(|worker| {
                let engine = self.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { engine.worker_loop(worker, shutdown_rx).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, mut shutdown_rx: watch::Receiver<bool>) {
        let mut poll = interval(self.inner.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            worker,
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            "Cascade worker started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            loop {
                match self.inner.queue.claim_next().await {
                    Ok(Some(claimed)) => {
                        self.process(claimed).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(worker, error = %e, "Claim failed");
                        break;
                    }
                }
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = self.inner.queue.woken() => {}
                _ = poll.tick() => {}
            }
        }

        tracing::info!(worker, "Cascade worker stopped");
    }

    /// Execute a claimed task and settle it with the queue.
    ///
    /// Execution is cut off before the lease runs out, so no other worker
    /// can claim the key while this one still runs it.
    async fn process(&self, claimed: ClaimedTask) -> Settled {
        let metrics = &self.inner.metrics;
        let task = claimed.task.clone();
        let key = &task.key;
        let budget = claimed
            .lease
            .execution_budget(Utc::now(), LEASE_EXECUTION_PERCENT);
        tracing::debug!(
            model = %key.model,
            field = %key.field,
            object_id = %key.object_id,
            handler = ?task.handler,
            attempt = task.attempts + 1,
            budget_ms = budget.as_millis() as u64,
            "Task claimed"
        );

        let executed = match timeout(budget, self.inner.executor.execute(&task)).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::LeaseBudgetExceeded {
                key: key.to_string(),
                budget_ms: budget.as_millis() as u64,
            }
            .into()),
        };

        match executed {
            Ok(outcome) => {
                metrics.tasks_executed.fetch_add(1, Ordering::Relaxed);
                metrics
                    .targets_written
                    .fetch_add(outcome.written.len() as u64, Ordering::Relaxed);
                metrics
                    .targets_nulled
                    .fetch_add(outcome.nulled as u64, Ordering::Relaxed);
                self.follow_up(&task, &outcome).await;

                let settled = match self.inner.queue.complete(claimed).await {
                    Ok(CompletionOutcome::Deleted) => Settled::Completed,
                    Ok(CompletionOutcome::Rescheduled) => Settled::Rescheduled,
                    Err(e) => {
                        tracing::warn!(error = %e, key = %key, "Completion not recorded");
                        Settled::LeaseLost
                    }
                };
                tracing::debug!(
                    model = %key.model,
                    field = %key.field,
                    object_id = %key.object_id,
                    targets = outcome.targets,
                    written = outcome.written.len(),
                    settled = ?settled,
                    "Task executed"
                );
                settled
            }
            Err(e) => self.record_failure(claimed, e).await,
        }
    }

    /// Continue the cascade past what this task changed.
    ///
    /// Ids a handler reports as touched are re-notified in full. Documents
    /// the default path rewrote get their computed dependents scheduled;
    /// their mirror dependents are already covered by the original notify.
    async fn follow_up(&self, task: &DenormalizationTask, outcome: &ExecutionOutcome) {
        let model = &task.key.model;
        if let Some(handler) = &outcome.handler {
            self.inner.metrics.handler_runs.fetch_add(1, Ordering::Relaxed);
            let changed = [task.key.field.clone()];
            for id in &handler.touched {
                self.notify(model, *id, Some(&changed)).await;
            }
            return;
        }

        let mut report = NotifyReport::default();
        for id in &outcome.written {
            let computed = self.inner.scheduler.computed_dependents(model, *id);
            report.dependents += computed.len();
            for dependent in &computed {
                for follow in dependent.tasks() {
                    self.enqueue_best_effort(follow, &mut report).await;
                }
            }
        }
        if report.dependents > 0 {
            tracing::debug!(
                model = %model,
                field = %task.key.field,
                rewritten = outcome.written.len(),
                accepted = report.accepted(),
                failed = report.failed,
                "Computed dependents scheduled"
            );
        }
    }

    async fn record_failure(&self, claimed: ClaimedTask, error: DenormError) -> Settled {
        let metrics = &self.inner.metrics;
        metrics.task_failures.fetch_add(1, Ordering::Relaxed);
        let key = claimed.key().clone();
        let attempt = claimed.task.attempts + 1;
        tracing::warn!(
            error = %error,
            model = %key.model,
            field = %key.field,
            object_id = %key.object_id,
            handler = ?claimed.task.handler,
            attempt,
            "Task failed"
        );

        match self
            .inner
            .queue
            .fail(claimed, &error.to_string(), error.is_retryable())
            .await
        {
            Ok(FailureOutcome::Retrying { .. }) => Settled::Retrying,
            Ok(FailureOutcome::Parked) => {
                metrics.tasks_parked.fetch_add(1, Ordering::Relaxed);
                tracing::error!(key = %key, attempt, "Task parked");
                Settled::Parked
            }
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "Failure not recorded");
                Settled::LeaseLost
            }
        }
    }
}
