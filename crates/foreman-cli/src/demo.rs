//! Demo handler for `foreman work`.
//!
//! payload: `{ "fail_with": "GEMINI_429 quota" }` で失敗を再現できます。

use std::time::Duration;

use async_trait::async_trait;
use foreman_core::app::{Lease, TaskHandler};
use foreman_core::domain::Outcome;
use tracing::info;

pub struct DemoHandler {
    work: Duration,
}

impl DemoHandler {
    pub fn new(work: Duration) -> Self {
        Self { work }
    }
}

#[async_trait]
impl TaskHandler for DemoHandler {
    async fn handle(&self, lease: &Lease) -> Outcome {
        tokio::time::sleep(self.work).await;

        match lease.payload.get("fail_with").and_then(|v| v.as_str()) {
            Some(reason) => Outcome::failure(reason),
            None => {
                info!(task_id = %lease.task_id, attempts = lease.attempts, "processed");
                Outcome::success()
            }
        }
    }
}
