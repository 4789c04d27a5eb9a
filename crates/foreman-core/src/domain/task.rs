//! Task record: lifecycle metadata + opaque payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, TaskId, WorkerId};
use super::state::TaskStatus;

/// Input for creating a task.
///
/// The ingestion trigger that produces these lives outside the queue; the
/// queue never looks inside `payload`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub job_id: Option<JobId>,

    #[serde(default)]
    pub payload: serde_json::Value,

    /// Overrides the configured default when set.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl NewTask {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            job_id: None,
            payload,
            max_attempts: None,
        }
    }

    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Single source of truth for one task.
///
/// The transition methods below do NOT check preconditions; stores check the
/// lease/status predicate first and only then apply the transition, inside the
/// same atomic section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub job_id: Option<JobId>,
    pub payload: serde_json::Value,
    pub status: TaskStatus,

    /// Number of claims made so far (incremented at claim time).
    pub attempts: u32,
    pub max_attempts: u32,

    pub locked_by: Option<WorkerId>,
    pub lock_expires_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    /// Backoff gate; `None` means eligible immediately.
    pub next_eligible_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: TaskId, new_task: NewTask, default_max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_id: new_task.job_id,
            payload: new_task.payload,
            status: TaskStatus::Queued,
            attempts: 0,
            max_attempts: new_task.max_attempts.unwrap_or(default_max_attempts),
            locked_by: None,
            lock_expires_at: None,
            last_error: None,
            next_eligible_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Lease present and not yet expired at `now`.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.locked_by.is_some() && self.lock_expires_at.is_some_and(|exp| exp >= now)
    }

    /// Lock still set but its expiry has passed.
    pub fn has_stale_lock(&self, now: DateTime<Utc>) -> bool {
        self.locked_by.is_some() && self.lock_expires_at.is_none_or(|exp| exp < now)
    }

    /// `worker` holds a live lease on a claimed task.
    pub fn is_held_by(&self, worker: WorkerId, now: DateTime<Utc>) -> bool {
        self.status.is_claimed() && self.locked_by == Some(worker) && self.has_live_lease(now)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Eligibility predicate used by the dispatcher.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Queued
            && !self.is_exhausted()
            && self.next_eligible_at.is_none_or(|at| at <= now)
    }

    /// Queued but stuck at the attempt ceiling; only an operator reset frees it.
    pub fn is_blocked(&self) -> bool {
        self.status == TaskStatus::Queued && self.is_exhausted()
    }

    /// Orphan: claimed state without a lock.
    pub fn is_orphaned(&self) -> bool {
        self.status.is_claimed() && self.locked_by.is_none()
    }

    pub fn claim(&mut self, worker: WorkerId, now: DateTime<Utc>, lock_expires_at: DateTime<Utc>) {
        self.status = TaskStatus::Dispatched;
        self.locked_by = Some(worker);
        self.lock_expires_at = Some(lock_expires_at);
        self.attempts = self.attempts.saturating_add(1);
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub fn begin_processing(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.updated_at = now;
    }

    pub fn extend_lease(&mut self, lock_expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.lock_expires_at = Some(lock_expires_at);
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Succeeded;
        self.locked_by = None;
        self.lock_expires_at = None;
        self.last_error = None;
        self.next_eligible_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn requeue_after_failure(
        &mut self,
        error: String,
        next_eligible_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.status = TaskStatus::Queued;
        self.locked_by = None;
        self.lock_expires_at = None;
        self.last_error = Some(error);
        self.next_eligible_at = next_eligible_at;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.locked_by = None;
        self.lock_expires_at = None;
        self.last_error = Some(error);
        self.next_eligible_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Reclaimer step 1. Status is left untouched.
    pub fn clear_lock(&mut self, now: DateTime<Utc>) {
        self.locked_by = None;
        self.lock_expires_at = None;
        self.updated_at = now;
    }

    /// Reclaimer step 2. `attempts` stays as counted at claim time.
    pub fn requeue_orphan(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Queued;
        self.updated_at = now;
    }

    /// Operator action only.
    pub fn reset_attempts(&mut self, now: DateTime<Utc>) {
        self.attempts = 0;
        self.updated_at = now;
    }
}
