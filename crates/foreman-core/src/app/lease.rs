//! LeaseManager - claim 後の lease プロトコル（begin / renew / release）
//!
//! すべての書き込みは「現在の lease holder であること」を条件にした条件付き更新。
//! 条件が外れた（期限切れ・他 worker に再取得された）場合は `QueueError::LeaseLost`
//! が返り、worker はそのタスクを放棄して以後何も書きません。

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::domain::{
    DomainEvent, JobId, QueueError, RetryDecision, RetryPolicy, TaskId, TaskRecord, WorkerId,
};
use crate::ports::{Clock, EventSink, TaskStore};

/// Worker-side handle for a claimed task.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub task_id: TaskId,
    pub job_id: Option<JobId>,
    pub worker: WorkerId,
    pub expires_at: DateTime<Utc>,
    /// Attempt number of this claim (1-based).
    pub attempts: u32,
    pub max_attempts: u32,
    pub payload: serde_json::Value,
}

impl Lease {
    /// Build a handle from a record returned by a claim.
    pub fn from_claimed(record: &TaskRecord) -> Result<Self, QueueError> {
        match (record.locked_by, record.lock_expires_at) {
            (Some(worker), Some(expires_at)) if record.status.is_claimed() => Ok(Self {
                task_id: record.id,
                job_id: record.job_id,
                worker,
                expires_at,
                attempts: record.attempts,
                max_attempts: record.max_attempts,
                payload: record.payload.clone(),
            }),
            _ => Err(QueueError::InvalidArgument(format!(
                "{} is not a claimed task",
                record.id
            ))),
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

pub struct LeaseManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    retry_policy: RetryPolicy,
    lease_duration: TimeDelta,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        retry_policy: RetryPolicy,
        lease_duration: TimeDelta,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            retry_policy,
            lease_duration,
        }
    }

    pub fn lease_duration(&self) -> TimeDelta {
        self.lease_duration
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// `dispatched -> processing`.
    pub async fn begin(&self, lease: &Lease) -> Result<TaskRecord, QueueError> {
        let now = self.clock.now();
        let rec = self
            .store
            .begin_processing(lease.task_id, lease.worker, now)
            .await
            .inspect_err(|e| log_lost(e, "begin"))?;
        self.events.emit(DomainEvent::ProcessingStarted {
            task_id: lease.task_id,
            worker: lease.worker,
        });
        Ok(rec)
    }

    /// Extend to `now + lease_duration`; updates `lease.expires_at` on success.
    pub async fn renew(&self, lease: &mut Lease) -> Result<(), QueueError> {
        let now = self.clock.now();
        let expires_at = lease_expiry(now, self.lease_duration)?;
        self.store
            .renew_lease(lease.task_id, lease.worker, now, expires_at)
            .await
            .inspect_err(|e| log_lost(e, "renew"))?;
        lease.expires_at = expires_at;
        debug!(task_id = %lease.task_id, worker = %lease.worker, %expires_at, "lease renewed");
        self.events.emit(DomainEvent::LeaseRenewed {
            task_id: lease.task_id,
            worker: lease.worker,
            lock_expires_at: expires_at,
        });
        Ok(())
    }

    pub async fn release_success(&self, lease: Lease) -> Result<TaskRecord, QueueError> {
        let now = self.clock.now();
        let rec = self
            .store
            .complete(lease.task_id, lease.worker, now)
            .await
            .inspect_err(|e| log_lost(e, "release_success"))?;
        self.events.emit(DomainEvent::TaskSucceeded {
            task_id: rec.id,
            worker: lease.worker,
            attempts: rec.attempts,
        });
        Ok(rec)
    }

    /// Record the error and either requeue or fail terminally, per the retry
    /// policy.
    pub async fn release_failure(
        &self,
        lease: Lease,
        error: &str,
    ) -> Result<(TaskRecord, RetryDecision), QueueError> {
        let now = self.clock.now();
        let decision = self
            .retry_policy
            .decide(lease.attempts, lease.max_attempts, error, now);
        let rec = self
            .store
            .fail(lease.task_id, lease.worker, now, error, decision)
            .await
            .inspect_err(|e| log_lost(e, "release_failure"))?;

        match decision {
            RetryDecision::Requeue { next_eligible_at } => {
                self.events.emit(DomainEvent::TaskRequeued {
                    task_id: rec.id,
                    attempts: rec.attempts,
                    next_eligible_at,
                    error: error.to_string(),
                })
            }
            RetryDecision::FailTerminal => self.events.emit(DomainEvent::TaskFailed {
                task_id: rec.id,
                attempts: rec.attempts,
                error: error.to_string(),
            }),
        }
        Ok((rec, decision))
    }
}

/// `now + duration`, or `QueueError::Config` when it leaves chrono's range.
pub(crate) fn lease_expiry(
    now: DateTime<Utc>,
    duration: TimeDelta,
) -> Result<DateTime<Utc>, QueueError> {
    now.checked_add_signed(duration)
        .ok_or_else(|| QueueError::Config(format!("lease duration {duration} is out of range")))
}

fn log_lost(err: &QueueError, op: &str) {
    if let QueueError::LeaseLost { task_id, worker } = err {
        warn!(%task_id, %worker, op, "lease lost; abandoning task");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, TaskStatus};
    use crate::impls::{InMemoryTaskStore, MemoryEventSink};
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        clock: FixedClock,
        events: MemoryEventSink,
        leases: LeaseManager,
    }

    fn fixture(policy: RetryPolicy) -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new());
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let events = MemoryEventSink::new();
        let leases = LeaseManager::new(
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(events.clone()),
            policy,
            TimeDelta::minutes(10),
        );
        Fixture {
            store,
            clock,
            events,
            leases,
        }
    }

    async fn claim_one(f: &Fixture, max_attempts: u32) -> Lease {
        let now = f.clock.now();
        let rec = TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask::new(serde_json::json!({"file_id": "f-1"})).with_max_attempts(max_attempts),
            5,
            now,
        );
        f.store.insert(rec).await.unwrap();
        let claimed = f
            .store
            .claim_batch(WorkerId::from_ulid(Ulid::new()), 1, now, now + TimeDelta::minutes(10))
            .await
            .unwrap();
        Lease::from_claimed(&claimed[0]).unwrap()
    }

    #[tokio::test]
    async fn renew_extends_from_now() {
        let f = fixture(RetryPolicy::default());
        let mut lease = claim_one(&f, 3).await;

        f.clock.advance(TimeDelta::minutes(8));
        f.leases.renew(&mut lease).await.unwrap();

        assert_eq!(lease.expires_at, f.clock.now() + TimeDelta::minutes(10));
        let rec = f.store.get(lease.task_id).await.unwrap().unwrap();
        assert_eq!(rec.lock_expires_at, Some(lease.expires_at));
    }

    #[tokio::test]
    async fn renew_after_expiry_is_lease_lost() {
        let f = fixture(RetryPolicy::default());
        let mut lease = claim_one(&f, 3).await;

        f.clock.advance(TimeDelta::minutes(11));
        let err = f.leases.renew(&mut lease).await.unwrap_err();
        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn begin_then_succeed() {
        let f = fixture(RetryPolicy::default());
        let lease = claim_one(&f, 3).await;

        let rec = f.leases.begin(&lease).await.unwrap();
        assert_eq!(rec.status, TaskStatus::Processing);

        let rec = f.leases.release_success(lease).await.unwrap();
        assert_eq!(rec.status, TaskStatus::Succeeded);
        assert_eq!(f.events.count("processing_started"), 1);
        assert_eq!(f.events.count("task_succeeded"), 1);
    }

    #[tokio::test]
    async fn failure_on_last_attempt_is_terminal() {
        let f = fixture(RetryPolicy::default());
        let lease = claim_one(&f, 1).await;
        assert!(lease.is_last_attempt());

        let (rec, decision) = f.leases.release_failure(lease, "bad scan").await.unwrap();
        assert_eq!(decision, RetryDecision::FailTerminal);
        assert_eq!(rec.status, TaskStatus::Failed);
        assert_eq!(rec.last_error.as_deref(), Some("bad scan"));
        assert_eq!(f.events.count("task_failed"), 1);
    }

    #[tokio::test]
    async fn failure_with_attempts_left_requeues() {
        let f = fixture(RetryPolicy::default());
        let lease = claim_one(&f, 3).await;

        let (rec, decision) = f.leases.release_failure(lease, "timeout").await.unwrap();
        assert_eq!(decision, RetryDecision::Requeue { next_eligible_at: None });
        assert_eq!(rec.status, TaskStatus::Queued);
        assert_eq!(rec.locked_by, None);
        assert_eq!(rec.attempts, 1);
    }

    #[test]
    fn lease_expiry_out_of_range_is_config_error() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            lease_expiry(now, TimeDelta::minutes(10)).unwrap(),
            now + TimeDelta::minutes(10)
        );
        assert!(matches!(
            lease_expiry(now, TimeDelta::MAX),
            Err(QueueError::Config(_))
        ));
    }

    #[test]
    fn unclaimed_record_has_no_lease() {
        let rec = TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask::default(),
            5,
            Utc::now(),
        );
        assert!(Lease::from_claimed(&rec).is_err());
    }
}
