//! Enqueuer - 新しいタスクを queued で登録する
//!
//! 1 ジョブ = 取り込みファイル 1 件ごとのタスク群。job_id で束ねて、
//! StatusView::summarize_job() でまとめて締めを判断します。

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::domain::{JobId, NewTask, QueueError, TaskId, TaskRecord};
use crate::ports::{Clock, IdGenerator, TaskStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnqueuedJob {
    pub job_id: JobId,
    pub task_ids: Vec<TaskId>,
}

pub struct Enqueuer {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    default_max_attempts: u32,
}

impl Enqueuer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            default_max_attempts,
        }
    }

    pub async fn enqueue(&self, task: NewTask) -> Result<TaskRecord, QueueError> {
        if task.max_attempts == Some(0) {
            return Err(QueueError::InvalidArgument(
                "max_attempts must be positive".to_string(),
            ));
        }
        let record = TaskRecord::new(
            self.ids.generate_task_id(),
            task,
            self.default_max_attempts,
            self.clock.now(),
        );
        let record = self.store.insert(record).await?;
        debug!(task_id = %record.id, max_attempts = record.max_attempts, "enqueued");
        Ok(record)
    }

    /// One task per payload, all under a fresh job id.
    pub async fn enqueue_job(
        &self,
        payloads: Vec<serde_json::Value>,
    ) -> Result<EnqueuedJob, QueueError> {
        let job_id = self.ids.generate_job_id();
        let mut task_ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let rec = self.enqueue(NewTask::new(payload).for_job(job_id)).await?;
            task_ids.push(rec.id);
        }
        info!(%job_id, count = task_ids.len(), "job enqueued");
        Ok(EnqueuedJob { job_id, task_ids })
    }
}
