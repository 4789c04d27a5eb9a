//! Events - ドメインイベント
//!
//! 状態遷移が成功したときにだけ発行されます（条件付き更新が不一致なら発行しない）。
//! EventSink 経由でログや監査に流します。

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ids::{TaskId, WorkerId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskClaimed {
        task_id: TaskId,
        worker: WorkerId,
        attempts: u32,
        lock_expires_at: DateTime<Utc>,
    },
    ProcessingStarted {
        task_id: TaskId,
        worker: WorkerId,
    },
    LeaseRenewed {
        task_id: TaskId,
        worker: WorkerId,
        lock_expires_at: DateTime<Utc>,
    },
    TaskSucceeded {
        task_id: TaskId,
        worker: WorkerId,
        attempts: u32,
    },
    TaskRequeued {
        task_id: TaskId,
        attempts: u32,
        next_eligible_at: Option<DateTime<Utc>>,
        error: String,
    },
    TaskFailed {
        task_id: TaskId,
        attempts: u32,
        error: String,
    },
    /// Reclaimer step 1.
    LockExpired { task_id: TaskId },
    /// Reclaimer step 2.
    OrphanRequeued { task_id: TaskId },
    /// Operator override; always audited.
    AttemptsReset { task_id: TaskId },
}

impl DomainEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            DomainEvent::TaskClaimed { task_id, .. }
            | DomainEvent::ProcessingStarted { task_id, .. }
            | DomainEvent::LeaseRenewed { task_id, .. }
            | DomainEvent::TaskSucceeded { task_id, .. }
            | DomainEvent::TaskRequeued { task_id, .. }
            | DomainEvent::TaskFailed { task_id, .. }
            | DomainEvent::LockExpired { task_id }
            | DomainEvent::OrphanRequeued { task_id }
            | DomainEvent::AttemptsReset { task_id } => *task_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::TaskClaimed { .. } => "task_claimed",
            DomainEvent::ProcessingStarted { .. } => "processing_started",
            DomainEvent::LeaseRenewed { .. } => "lease_renewed",
            DomainEvent::TaskSucceeded { .. } => "task_succeeded",
            DomainEvent::TaskRequeued { .. } => "task_requeued",
            DomainEvent::TaskFailed { .. } => "task_failed",
            DomainEvent::LockExpired { .. } => "lock_expired",
            DomainEvent::OrphanRequeued { .. } => "orphan_requeued",
            DomainEvent::AttemptsReset { .. } => "attempts_reset",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn event_tag_matches_name() {
        let ev = DomainEvent::OrphanRequeued {
            task_id: TaskId::from_ulid(Ulid::new()),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], ev.name());
        assert_eq!(v["task_id"], ev.task_id().to_string());
    }
}
