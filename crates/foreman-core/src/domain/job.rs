//! Job closeout stats, aggregated from the tasks of one import job.

use serde::Serialize;

use super::ids::JobId;
use super::state::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub total: u64,
    /// queued + dispatched + processing
    pub in_flight: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl JobSummary {
    pub fn empty(job_id: JobId) -> Self {
        Self {
            job_id,
            total: 0,
            in_flight: 0,
            succeeded: 0,
            failed: 0,
        }
    }

    pub fn record(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Succeeded => self.succeeded += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Queued | TaskStatus::Dispatched | TaskStatus::Processing => {
                self.in_flight += 1
            }
        }
    }

    /// Every task reached a terminal state; the job can be closed out.
    pub fn is_settled(&self) -> bool {
        self.total > 0 && self.in_flight == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn settles_only_when_nothing_in_flight() {
        let mut s = JobSummary::empty(JobId::from_ulid(Ulid::new()));
        assert!(!s.is_settled());

        s.record(TaskStatus::Succeeded);
        s.record(TaskStatus::Processing);
        assert!(!s.is_settled());
        assert_eq!(s.in_flight, 1);

        let mut done = JobSummary::empty(s.job_id);
        done.record(TaskStatus::Succeeded);
        done.record(TaskStatus::Failed);
        assert!(done.is_settled());
        assert_eq!((done.total, done.succeeded, done.failed), (2, 1, 1));
    }
}
