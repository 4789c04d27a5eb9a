//! TaskStore port - タスクの正本（source of truth）
//!
//! TaskStore は状態・lease・attempts を管理します。
//!
//! # 設計原則
//! - 状態を変える操作はすべて単一のアトミック操作（1 文 or 1 トランザクション）
//! - lease を伴う書き込みは `locked_by` を条件にした条件付き更新
//! - 一括更新は「事前の読み取りで作った id リスト」に限定し、条件は更新時に再検証する

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    JobId, QueueError, RetryDecision, StatusCounts, TaskId, TaskRecord, TaskStatus, WorkerId,
};

/// Sort order for snapshot reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaskOrder {
    /// `updated_at` ascending, ties by id. Dispatch order.
    #[default]
    OldestFirst,
    /// `updated_at` descending. Status projections.
    NewestFirst,
}

/// Filter for `TaskStore::find`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskQuery {
    pub statuses: Vec<TaskStatus>,
    pub job_id: Option<JobId>,
    /// `Some(true)`: `locked_by IS NOT NULL`; `Some(false)`: `IS NULL`.
    pub locked: Option<bool>,
    /// `lock_expires_at < t`
    pub lock_expired_before: Option<DateTime<Utc>>,
    /// `updated_at >= t`
    pub updated_since: Option<DateTime<Utc>>,
    /// `Some(true)`: `attempts >= max_attempts`.
    pub exhausted: Option<bool>,
    pub order: TaskOrder,
    pub limit: Option<usize>,
}

impl TaskQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn locked(mut self, locked: bool) -> Self {
        self.locked = Some(locked);
        self
    }

    pub fn lock_expired_before(mut self, t: DateTime<Utc>) -> Self {
        self.lock_expired_before = Some(t);
        self
    }

    pub fn updated_since(mut self, t: DateTime<Utc>) -> Self {
        self.updated_since = Some(t);
        self
    }

    pub fn exhausted(mut self, exhausted: bool) -> Self {
        self.exhausted = Some(exhausted);
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.order = TaskOrder::NewestFirst;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// In-process evaluation of the filter. SQL stores translate the same
    /// predicate into a WHERE clause.
    pub fn matches(&self, rec: &TaskRecord) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&rec.status) {
            return false;
        }
        if self.job_id.is_some() && rec.job_id != self.job_id {
            return false;
        }
        if self.locked.is_some_and(|locked| rec.locked_by.is_some() != locked) {
            return false;
        }
        if let Some(t) = self.lock_expired_before {
            if !rec.lock_expires_at.is_some_and(|exp| exp < t) {
                return false;
            }
        }
        if self.updated_since.is_some_and(|t| rec.updated_at < t) {
            return false;
        }
        if self.exhausted.is_some_and(|exhausted| rec.is_exhausted() != exhausted) {
            return false;
        }
        true
    }
}

/// TaskStore はタスク状態の正本
///
/// Lease-holding writes (`begin_processing`, `renew_lease`, `complete`,
/// `fail`) return `QueueError::LeaseLost` when the task exists but the caller
/// is no longer the live holder, and `QueueError::TaskNotFound` when it does
/// not exist.
///
/// Bulk repair operations (`release_expired_locks`, `requeue_orphans`,
/// `reset_attempts`) re-check their predicate per id and return only the ids
/// they actually changed; ids that no longer match are skipped silently.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a freshly built `queued` record.
    async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, QueueError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueError>;

    /// Select up to `max` eligible tasks (oldest `updated_at` first) and claim
    /// them for `worker` in one atomic step.
    async fn claim_batch(
        &self,
        worker: WorkerId,
        max: usize,
        now: DateTime<Utc>,
        lock_expires_at: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, QueueError>;

    /// `dispatched -> processing`. Idempotent while already processing.
    async fn begin_processing(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, QueueError>;

    async fn renew_lease(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
        lock_expires_at: DateTime<Utc>,
    ) -> Result<TaskRecord, QueueError>;

    async fn complete(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, QueueError>;

    async fn fail(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
        error: &str,
        decision: RetryDecision,
    ) -> Result<TaskRecord, QueueError>;

    /// Clear locks whose expiry is before `now`. Status is left as is.
    async fn release_expired_locks(
        &self,
        ids: &[TaskId],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, QueueError>;

    /// `dispatched | processing` with no lock -> `queued`. No attempts change.
    async fn requeue_orphans(
        &self,
        ids: &[TaskId],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, QueueError>;

    /// Operator override: `attempts = 0` for queued tasks at the ceiling.
    async fn reset_attempts(
        &self,
        ids: &[TaskId],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, QueueError>;

    async fn find(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, QueueError>;

    async fn count_by_status(&self) -> Result<StatusCounts, QueueError>;
}
