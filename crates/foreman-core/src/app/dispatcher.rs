//! Dispatcher - eligible なタスクを一括で claim する
//!
//! # フロー
//! 1. 対象: status = queued AND attempts < max_attempts AND backoff 期限切れ
//! 2. 並び: updated_at が古い順（同時刻は id 順）
//! 3. 最大 min(max_tasks, dispatch.max_batch) 件を 1 回のアトミック操作で claim
//!
//! 複数の dispatcher が同時に走っても同じタスクを二重に claim しない（ストアが保証）。

use std::sync::Arc;

use chrono::TimeDelta;
use serde::Serialize;
use tracing::{debug, info};

use super::lease::{Lease, lease_expiry};
use crate::domain::{DomainEvent, QueueError, TaskId, TaskRecord, WorkerId};
use crate::ports::{Clock, EventSink, TaskStore};

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub claimed_ids: Vec<TaskId>,
    #[serde(skip)]
    pub claimed: Vec<TaskRecord>,
}

impl DispatchResult {
    pub fn is_empty(&self) -> bool {
        self.claimed_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.claimed_ids.len()
    }

    /// Worker-side handles, in claim order.
    pub fn leases(&self) -> Result<Vec<Lease>, QueueError> {
        self.claimed.iter().map(Lease::from_claimed).collect()
    }
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    lease_duration: TimeDelta,
    max_batch: usize,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        lease_duration: TimeDelta,
        max_batch: usize,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            lease_duration,
            max_batch,
        }
    }

    /// Claim up to `max_tasks` eligible tasks for `worker`.
    ///
    /// An empty queue yields an empty result, not an error.
    pub async fn dispatch(
        &self,
        worker: WorkerId,
        max_tasks: usize,
    ) -> Result<DispatchResult, QueueError> {
        if max_tasks == 0 {
            return Err(QueueError::InvalidArgument(
                "max_tasks must be positive".to_string(),
            ));
        }
        let limit = max_tasks.min(self.max_batch);
        let now = self.clock.now();
        let lock_expires_at = lease_expiry(now, self.lease_duration)?;

        let claimed = self
            .store
            .claim_batch(worker, limit, now, lock_expires_at)
            .await?;

        for rec in &claimed {
            debug!(task_id = %rec.id, %worker, attempts = rec.attempts, "claimed");
            self.events.emit(DomainEvent::TaskClaimed {
                task_id: rec.id,
                worker,
                attempts: rec.attempts,
                lock_expires_at,
            });
        }
        if !claimed.is_empty() {
            info!(%worker, count = claimed.len(), requested = max_tasks, "dispatched batch");
        }

        Ok(DispatchResult {
            claimed_ids: claimed.iter().map(|r| r.id).collect(),
            claimed,
        })
    }
}
