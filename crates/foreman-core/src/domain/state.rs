//! Task status state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Task status.
///
/// State transitions:
/// - Queued -> Dispatched -> Processing -> Succeeded
/// - Queued -> Dispatched -> (Processing) -> Queued (retry, until max_attempts)
/// - Queued -> Dispatched -> (Processing) -> Failed (attempts exhausted)
/// - Dispatched/Processing with a cleared lock -> Queued (reclaimer)
///
/// `Dispatched` means "claimed, handler not started yet"; `Processing` means the
/// lease holder has started the handler. Both are lease-holding states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the backlog.
    Queued,

    /// Claimed by a dispatcher on behalf of a worker.
    Dispatched,

    /// The lease holder is running the handler.
    Processing,

    /// Completed successfully.
    Succeeded,

    /// Failed permanently (max_attempts exhausted).
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::Dispatched,
        TaskStatus::Processing,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Does this state carry a lease?
    pub fn is_claimed(self) -> bool {
        matches!(self, TaskStatus::Dispatched | TaskStatus::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Processing => "processing",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "dispatched" => Ok(TaskStatus::Dispatched),
            "processing" => Ok(TaskStatus::Processing),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Point-in-time status distribution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub dispatched: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Queued => self.queued,
            TaskStatus::Dispatched => self.dispatched,
            TaskStatus::Processing => self.processing,
            TaskStatus::Succeeded => self.succeeded,
            TaskStatus::Failed => self.failed,
        }
    }

    pub fn add(&mut self, status: TaskStatus, n: u64) {
        let slot = match status {
            TaskStatus::Queued => &mut self.queued,
            TaskStatus::Dispatched => &mut self.dispatched,
            TaskStatus::Processing => &mut self.processing,
            TaskStatus::Succeeded => &mut self.succeeded,
            TaskStatus::Failed => &mut self.failed,
        };
        *slot += n;
    }

    pub fn total(&self) -> u64 {
        TaskStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaskStatus, u64)> + '_ {
        TaskStatus::ALL.into_iter().map(|s| (s, self.get(s)))
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (status, n) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{status}={n}")?;
            first = false;
        }
        Ok(())
    }
}
