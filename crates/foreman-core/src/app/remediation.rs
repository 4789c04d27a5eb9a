//! Remediation - 運用者向けの一括修復
//!
//! どの操作も「先に読んで id リストを作る → その id だけを条件付きで更新」。
//! 失敗した id は報告に載せ、残りの処理は止めません。
//! 前後の StatusCounts を一緒に返すので、何が動いたかをその場で確認できます。
//! 変更後の集計だけが失敗した場合は `after = None` と `count_error` を載せて
//! 部分結果を返します（変更済みの id を捨てない）。

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::dispatcher::Dispatcher;
use super::reclaimer::{BulkFailure, BulkOutcome, Reclaimer};
use crate::domain::{QueueError, StatusCounts, TaskId, WorkerId};
use crate::ports::{Clock, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    ReleaseExpiredLocks,
    RequeueOrphanedDispatched,
    ResetAttemptsForBlocked,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemediationReport {
    pub action: RemediationAction,
    pub touched: Vec<TaskId>,
    pub failures: Vec<BulkFailure>,
    pub before: StatusCounts,
    pub after: Option<StatusCounts>,
    /// Set when the post-change count failed; the change itself went through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count_error: Option<String>,
}

impl RemediationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.count_error.is_none()
    }
}

/// Queue shape around one manual dispatch call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchDelta {
    pub before: StatusCounts,
    pub after: Option<StatusCounts>,
    pub claimed_ids: Vec<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count_error: Option<String>,
}

impl DispatchDelta {
    /// Tasks that left `queued` between the two snapshots. Can differ from
    /// `claimed_ids.len()` when other dispatchers run concurrently.
    pub fn queued_drop(&self) -> Option<i64> {
        self.after
            .as_ref()
            .map(|after| self.before.queued as i64 - after.queued as i64)
    }
}

pub struct Remediation {
    store: Arc<dyn TaskStore>,
    reclaimer: Arc<Reclaimer>,
    dispatcher: Arc<Dispatcher>,
}

impl Remediation {
    pub fn new(
        store: Arc<dyn TaskStore>,
        reclaimer: Arc<Reclaimer>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            store,
            reclaimer,
            dispatcher,
        }
    }

    pub async fn release_expired_locks(&self) -> Result<RemediationReport, QueueError> {
        let now = self.reclaimer.clock().now();
        self.run(RemediationAction::ReleaseExpiredLocks, self.reclaimer.expire_locks(now))
            .await
    }

    pub async fn requeue_orphaned_dispatched(&self) -> Result<RemediationReport, QueueError> {
        let now = self.reclaimer.clock().now();
        self.run(
            RemediationAction::RequeueOrphanedDispatched,
            self.reclaimer.requeue_orphans(now),
        )
        .await
    }

    pub async fn reset_attempts_for_blocked(&self) -> Result<RemediationReport, QueueError> {
        let now = self.reclaimer.clock().now();
        self.run(
            RemediationAction::ResetAttemptsForBlocked,
            self.reclaimer.reset_blocked(now),
        )
        .await
    }

    pub async fn dispatch_with_delta(
        &self,
        worker: WorkerId,
        max_tasks: usize,
    ) -> Result<DispatchDelta, QueueError> {
        let before = self.store.count_by_status().await?;
        let result = self.dispatcher.dispatch(worker, max_tasks).await?;
        let (after, count_error) = self.count_after().await;
        Ok(DispatchDelta {
            before,
            after,
            claimed_ids: result.claimed_ids,
            count_error,
        })
    }

    async fn count_after(&self) -> (Option<StatusCounts>, Option<String>) {
        match self.store.count_by_status().await {
            Ok(counts) => (Some(counts), None),
            Err(e) => {
                warn!(error = %e, "post-change count failed; returning partial result");
                (None, Some(e.to_string()))
            }
        }
    }

    async fn run(
        &self,
        action: RemediationAction,
        op: impl std::future::Future<Output = Result<BulkOutcome, QueueError>>,
    ) -> Result<RemediationReport, QueueError> {
        let before = self.store.count_by_status().await?;
        let outcome = op.await?;
        let (after, count_error) = self.count_after().await;
        info!(
            ?action,
            touched = outcome.changed.len(),
            failures = outcome.failures.len(),
            "remediation done"
        );
        Ok(RemediationReport {
            action,
            touched: outcome.changed,
            failures: outcome.failures,
            before,
            after,
            count_error,
        })
    }
}
