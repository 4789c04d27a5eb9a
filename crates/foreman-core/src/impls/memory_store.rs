//! InMemoryTaskStore - テスト・デモ用のタスクストア
//!
//! # 実装詳細
//! - HashMap<TaskId, TaskRecord> を tokio::sync::Mutex で保護
//! - 各操作はロックを取ったまま「条件の確認 → 遷移」を行うので、
//!   SQL の単一 UPDATE 文と同じアトミック性になる

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    QueueError, RetryDecision, StatusCounts, TaskId, TaskRecord, WorkerId,
};
use crate::ports::{TaskOrder, TaskQuery, TaskStore};

struct InMemoryStoreState {
    records: HashMap<TaskId, TaskRecord>,
}

impl InMemoryStoreState {
    /// Lease holder check shared by every lease-keyed write.
    fn held_mut(
        &mut self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<&mut TaskRecord, QueueError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(QueueError::TaskNotFound(id))?;
        if !record.is_held_by(worker, now) {
            return Err(QueueError::LeaseLost {
                task_id: id,
                worker,
            });
        }
        Ok(record)
    }

    fn select<'a>(&'a self, query: &TaskQuery) -> Vec<&'a TaskRecord> {
        let mut hits: Vec<&TaskRecord> =
            self.records.values().filter(|r| query.matches(r)).collect();
        sort_records(&mut hits, query.order);
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        hits
    }

    /// Apply `f` to each listed record for which `pred` holds; returns the
    /// ids that were changed.
    fn update_where(
        &mut self,
        ids: &[TaskId],
        pred: impl Fn(&TaskRecord) -> bool,
        f: impl Fn(&mut TaskRecord),
    ) -> Vec<TaskId> {
        let mut changed = Vec::new();
        for id in ids {
            if let Some(record) = self.records.get_mut(id) {
                if pred(record) {
                    f(record);
                    changed.push(*id);
                }
            }
        }
        changed
    }
}

fn sort_records(records: &mut [&TaskRecord], order: TaskOrder) {
    match order {
        TaskOrder::OldestFirst => {
            records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)))
        }
        TaskOrder::NewestFirst => {
            records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)))
        }
    }
}

/// In-memory TaskStore.
///
/// Clone は同じ状態を共有します（複数 worker に同じストアを渡せる）。
#[derive(Clone)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryStoreState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryStoreState {
                records: HashMap::new(),
            })),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, QueueError> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(&record.id) {
            return Err(QueueError::InvalidArgument(format!(
                "duplicate task id {}",
                record.id
            )));
        }
        state.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn claim_batch(
        &self,
        worker: WorkerId,
        max: usize,
        now: DateTime<Utc>,
        lock_expires_at: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        let mut state = self.state.lock().await;

        let mut eligible: Vec<&TaskRecord> =
            state.records.values().filter(|r| r.is_eligible(now)).collect();
        sort_records(&mut eligible, TaskOrder::OldestFirst);
        let picked: Vec<TaskId> = eligible.iter().take(max).map(|r| r.id).collect();

        let mut claimed = Vec::with_capacity(picked.len());
        for id in picked {
            if let Some(record) = state.records.get_mut(&id) {
                record.claim(worker, now, lock_expires_at);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn begin_processing(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, QueueError> {
        let mut state = self.state.lock().await;
        let record = state.held_mut(id, worker, now)?;
        record.begin_processing(now);
        Ok(record.clone())
    }

    async fn renew_lease(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
        lock_expires_at: DateTime<Utc>,
    ) -> Result<TaskRecord, QueueError> {
        let mut state = self.state.lock().await;
        let record = state.held_mut(id, worker, now)?;
        record.extend_lease(lock_expires_at, now);
        Ok(record.clone())
    }

    async fn complete(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, QueueError> {
        let mut state = self.state.lock().await;
        let record = state.held_mut(id, worker, now)?;
        record.mark_succeeded(now);
        Ok(record.clone())
    }

    async fn fail(
        &self,
        id: TaskId,
        worker: WorkerId,
        now: DateTime<Utc>,
        error: &str,
        decision: RetryDecision,
    ) -> Result<TaskRecord, QueueError> {
        let mut state = self.state.lock().await;
        let record = state.held_mut(id, worker, now)?;
        match decision {
            RetryDecision::Requeue { next_eligible_at } => {
                record.requeue_after_failure(error.to_string(), next_eligible_at, now)
            }
            RetryDecision::FailTerminal => record.mark_failed(error.to_string(), now),
        }
        Ok(record.clone())
    }

    async fn release_expired_locks(
        &self,
        ids: &[TaskId],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state.update_where(ids, |r| r.has_stale_lock(now), |r| r.clear_lock(now)))
    }

    async fn requeue_orphans(
        &self,
        ids: &[TaskId],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state.update_where(ids, TaskRecord::is_orphaned, |r| r.requeue_orphan(now)))
    }

    async fn reset_attempts(
        &self,
        ids: &[TaskId],
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state.update_where(ids, TaskRecord::is_blocked, |r| r.reset_attempts(now)))
    }

    async fn find(&self, query: &TaskQuery) -> Result<Vec<TaskRecord>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.select(query).into_iter().cloned().collect())
    }

    async fn count_by_status(&self) -> Result<StatusCounts, QueueError> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for record in state.records.values() {
            counts.add(record.status, 1);
        }
        Ok(counts)
    }
}
