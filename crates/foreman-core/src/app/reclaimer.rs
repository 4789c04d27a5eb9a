//! Reclaimer - 期限切れ lease と孤児タスクの回収（janitor）
//!
//! # フロー（1 パス）
//! 1. locked_by IS NOT NULL AND lock_expires_at < now の id を読み、lock を外す
//! 2. status IN (dispatched, processing) AND locked_by IS NULL の id を読み、queued に戻す
//!
//! どちらも「読み取りで作った id リスト」に対する更新で、条件は更新時に再検証されます。
//! attempts は増やしません（claim 時に数え済み）。
//! 更新はチャンク単位。チャンクが失敗したら 1 件ずつやり直し、失敗した id を記録して続行します。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::domain::{DomainEvent, QueueError, TaskId, TaskStatus};
use crate::ports::{Clock, EventSink, TaskQuery, TaskStore};

/// Id-scoped bulk repairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOp {
    ReleaseExpiredLocks,
    RequeueOrphans,
    ResetAttempts,
}

impl BulkOp {
    async fn apply(
        self,
        store: &dyn TaskStore,
        ids: &[TaskId],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, QueueError> {
        match self {
            BulkOp::ReleaseExpiredLocks => store.release_expired_locks(ids, now).await,
            BulkOp::RequeueOrphans => store.requeue_orphans(ids, now).await,
            BulkOp::ResetAttempts => store.reset_attempts(ids, now).await,
        }
    }

    fn event(self, task_id: TaskId) -> DomainEvent {
        match self {
            BulkOp::ReleaseExpiredLocks => DomainEvent::LockExpired { task_id },
            BulkOp::RequeueOrphans => DomainEvent::OrphanRequeued { task_id },
            BulkOp::ResetAttempts => DomainEvent::AttemptsReset { task_id },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkFailure {
    pub task_id: TaskId,
    pub op: BulkOp,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkOutcome {
    pub changed: Vec<TaskId>,
    pub failures: Vec<BulkFailure>,
}

/// Apply `op` to `ids` in chunks of `batch_size`; a failing chunk is retried
/// one id at a time so a single bad record cannot sink the rest.
pub async fn apply_in_chunks(
    store: &dyn TaskStore,
    op: BulkOp,
    ids: &[TaskId],
    batch_size: usize,
    now: DateTime<Utc>,
) -> BulkOutcome {
    let mut out = BulkOutcome::default();
    for chunk in ids.chunks(batch_size.max(1)) {
        match op.apply(store, chunk, now).await {
            Ok(changed) => out.changed.extend(changed),
            Err(chunk_err) => {
                warn!(?op, size = chunk.len(), error = %chunk_err, "chunk failed; retrying per id");
                for id in chunk {
                    match op.apply(store, std::slice::from_ref(id), now).await {
                        Ok(changed) => out.changed.extend(changed),
                        Err(e) => {
                            error!(?op, task_id = %id, error = %e, "bulk update failed");
                            out.failures.push(BulkFailure {
                                task_id: *id,
                                op,
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReclaimReport {
    pub locks_released: Vec<TaskId>,
    pub orphans_requeued: Vec<TaskId>,
    pub errors: Vec<BulkFailure>,
}

impl ReclaimReport {
    pub fn is_noop(&self) -> bool {
        self.locks_released.is_empty() && self.orphans_requeued.is_empty() && self.errors.is_empty()
    }
}

pub struct Reclaimer {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    batch_size: usize,
}

impl Reclaimer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            batch_size,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Step 1: clear locks whose lease expired before `now`.
    pub async fn expire_locks(&self, now: DateTime<Utc>) -> Result<BulkOutcome, QueueError> {
        let stale = self
            .store
            .find(&TaskQuery::new().locked(true).lock_expired_before(now))
            .await?;
        let ids: Vec<TaskId> = stale.iter().map(|r| r.id).collect();
        Ok(self.apply(BulkOp::ReleaseExpiredLocks, &ids, now).await)
    }

    /// Step 2: claimed state with no lock -> queued.
    pub async fn requeue_orphans(&self, now: DateTime<Utc>) -> Result<BulkOutcome, QueueError> {
        let orphans = self
            .store
            .find(
                &TaskQuery::new()
                    .with_statuses([TaskStatus::Dispatched, TaskStatus::Processing])
                    .locked(false),
            )
            .await?;
        let ids: Vec<TaskId> = orphans.iter().map(|r| r.id).collect();
        Ok(self.apply(BulkOp::RequeueOrphans, &ids, now).await)
    }

    /// Operator override: queued tasks stuck at the attempt ceiling get
    /// `attempts = 0`. Never called by the periodic loop.
    pub async fn reset_blocked(&self, now: DateTime<Utc>) -> Result<BulkOutcome, QueueError> {
        let blocked = self
            .store
            .find(
                &TaskQuery::new()
                    .with_statuses([TaskStatus::Queued])
                    .exhausted(true),
            )
            .await?;
        let ids: Vec<TaskId> = blocked.iter().map(|r| r.id).collect();
        let out = self.apply(BulkOp::ResetAttempts, &ids, now).await;
        if !out.changed.is_empty() {
            warn!(count = out.changed.len(), "operator reset attempts on blocked tasks");
        }
        Ok(out)
    }

    async fn apply(&self, op: BulkOp, ids: &[TaskId], now: DateTime<Utc>) -> BulkOutcome {
        let out = apply_in_chunks(self.store.as_ref(), op, ids, self.batch_size, now).await;
        for id in &out.changed {
            self.events.emit(op.event(*id));
        }
        out
    }

    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<ReclaimReport, QueueError> {
        let released = self.expire_locks(now).await?;
        let requeued = self.requeue_orphans(now).await?;

        let mut errors = released.failures;
        errors.extend(requeued.failures);
        let report = ReclaimReport {
            locks_released: released.changed,
            orphans_requeued: requeued.changed,
            errors,
        };
        if !report.is_noop() {
            info!(
                locks_released = report.locks_released.len(),
                orphans_requeued = report.orphans_requeued.len(),
                errors = report.errors.len(),
                "reclaim pass"
            );
        }
        Ok(report)
    }
}

/// Runs `Reclaimer::run_pass` every `interval`, independent of dispatch.
pub struct ReclaimerLoop {
    reclaimer: Arc<Reclaimer>,
    interval: Duration,
}

impl ReclaimerLoop {
    pub fn new(reclaimer: Arc<Reclaimer>, interval: Duration) -> Self {
        Self {
            reclaimer,
            interval,
        }
    }

    /// Loop until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let now = self.reclaimer.clock().now();
            if let Err(e) = self.reclaimer.run_pass(now).await {
                error!(error = %e, "reclaim pass failed");
            }
        }
        info!("reclaimer loop stopped");
    }
}
