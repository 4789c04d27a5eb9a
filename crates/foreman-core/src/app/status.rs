//! StatusView - 読み取り専用の状態ビュー
//!
//! 運用者が「いま何が詰まっているか」を見るための投影。書き込みは一切しません。

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::domain::{
    JobId, JobSummary, QueueError, StatusCounts, TaskId, TaskRecord, TaskStatus, WorkerId,
};
use crate::ports::{Clock, TaskQuery, TaskStore};

/// One row of the status projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusRow {
    pub id: TaskId,
    pub job_id: Option<JobId>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub locked_by: Option<WorkerId>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TaskRecord> for TaskStatusRow {
    fn from(rec: &TaskRecord) -> Self {
        Self {
            id: rec.id,
            job_id: rec.job_id,
            status: rec.status,
            attempts: rec.attempts,
            max_attempts: rec.max_attempts,
            locked_by: rec.locked_by,
            lock_expires_at: rec.lock_expires_at,
            last_error: rec.last_error.clone(),
            updated_at: rec.updated_at,
        }
    }
}

/// Queued tasks vs. the ones stuck at the attempt ceiling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockedAudit {
    pub queued_total: u64,
    pub blocked: u64,
    pub blocked_ids: Vec<TaskId>,
}

pub struct StatusView {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl StatusView {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn counts(&self) -> Result<StatusCounts, QueueError> {
        self.store.count_by_status().await
    }

    /// Most recently updated first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<TaskStatusRow>, QueueError> {
        self.rows(TaskQuery::new().newest_first().limit(limit)).await
    }

    /// Tasks touched within the last `window`.
    pub async fn recent_since(
        &self,
        window: TimeDelta,
        limit: usize,
    ) -> Result<Vec<TaskStatusRow>, QueueError> {
        let since = self.clock.now() - window;
        self.rows(TaskQuery::new().updated_since(since).newest_first().limit(limit))
            .await
    }

    /// Attempts of queued tasks (oldest first), for the "why is nothing
    /// moving" check.
    pub async fn queued_attempts(&self, limit: usize) -> Result<Vec<TaskStatusRow>, QueueError> {
        self.rows(
            TaskQuery::new()
                .with_statuses([TaskStatus::Queued])
                .limit(limit),
        )
        .await
    }

    pub async fn blocked_audit(&self) -> Result<BlockedAudit, QueueError> {
        let counts = self.store.count_by_status().await?;
        let blocked = self
            .store
            .find(
                &TaskQuery::new()
                    .with_statuses([TaskStatus::Queued])
                    .exhausted(true),
            )
            .await?;
        Ok(BlockedAudit {
            queued_total: counts.queued,
            blocked: blocked.len() as u64,
            blocked_ids: blocked.iter().map(|r| r.id).collect(),
        })
    }

    pub async fn summarize_job(&self, job_id: JobId) -> Result<JobSummary, QueueError> {
        let tasks = self.store.find(&TaskQuery::new().for_job(job_id)).await?;
        let mut summary = JobSummary::empty(job_id);
        for rec in &tasks {
            summary.record(rec.status);
        }
        Ok(summary)
    }

    async fn rows(&self, query: TaskQuery) -> Result<Vec<TaskStatusRow>, QueueError> {
        let records = self.store.find(&query).await?;
        Ok(records.iter().map(TaskStatusRow::from).collect())
    }
}
