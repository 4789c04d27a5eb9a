//! Domain model (ids, status, task record, outcomes, retry decisions, ...).
//!
//! ストアや時刻に依存しない純粋な型だけを置きます。

pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod state;
pub mod task;

pub use decision::{Backoff, RetryDecision, RetryPolicy};
pub use errors::{ErrorKind, QueueError};
pub use events::DomainEvent;
pub use ids::{IdParseError, JobId, TaskId, WorkerId};
pub use job::JobSummary;
pub use outcome::{Outcome, OutcomeKind};
pub use state::{StatusCounts, TaskStatus, UnknownStatus};
pub use task::{NewTask, TaskRecord};
