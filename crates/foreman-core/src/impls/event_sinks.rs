//! EventSink 実装
//!
//! - TracingEventSink: 構造化ログとして出力（本番・CLI）
//! - MemoryEventSink: テストで発行イベントを検査する
//! - NoopEventSink: 何もしない

use std::sync::{Arc, Mutex};

use crate::domain::DomainEvent;
use crate::ports::EventSink;

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: DomainEvent) {
        let task_id = event.task_id();
        match &event {
            DomainEvent::TaskClaimed {
                worker,
                attempts,
                lock_expires_at,
                ..
            } => tracing::debug!(
                event = event.name(),
                %task_id,
                %worker,
                attempts,
                %lock_expires_at
            ),
            DomainEvent::ProcessingStarted { worker, .. } => {
                tracing::debug!(event = event.name(), %task_id, %worker)
            }
            DomainEvent::LeaseRenewed {
                worker,
                lock_expires_at,
                ..
            } => tracing::debug!(event = event.name(), %task_id, %worker, %lock_expires_at),
            DomainEvent::TaskSucceeded {
                worker, attempts, ..
            } => tracing::info!(event = event.name(), %task_id, %worker, attempts),
            DomainEvent::TaskRequeued {
                attempts,
                next_eligible_at,
                error,
                ..
            } => tracing::info!(
                event = event.name(),
                %task_id,
                attempts,
                next_eligible_at = ?next_eligible_at,
                error = %error
            ),
            DomainEvent::TaskFailed {
                attempts, error, ..
            } => tracing::warn!(event = event.name(), %task_id, attempts, error = %error),
            DomainEvent::LockExpired { .. } | DomainEvent::OrphanRequeued { .. } => {
                tracing::info!(event = event.name(), %task_id)
            }
            DomainEvent::AttemptsReset { .. } => {
                tracing::warn!(event = event.name(), %task_id, "operator reset attempts")
            }
        }
    }
}

/// Collects events in order. Clones share the buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<DomainEvent>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .map(|g| g.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: DomainEvent) {
        let mut guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        guard.push(event);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: DomainEvent) {}
}
