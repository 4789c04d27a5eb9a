//! Retry decision: requeue or give up after a failed attempt.
//!
//! `RetryPolicy::decide` is a pure function of (attempts, max_attempts, error,
//! now). The lease manager applies the result; nothing here touches the store.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// What to do with a task whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `queued`. `None` means eligible immediately.
    Requeue { next_eligible_at: Option<DateTime<Utc>> },

    /// Attempts exhausted: `failed`.
    FailTerminal,
}

/// Delay shape between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Requeue with no delay.
    None,

    Fixed(Duration),

    /// delay = base * multiplier^(attempts - 1), capped at `max_delay`.
    ///
    /// Example with base=60s, multiplier=2.0:
    /// - attempt 1: 60s
    /// - attempt 2: 120s
    /// - attempt 3: 240s
    Exponential {
        base: Duration,
        multiplier: f64,
        max_delay: Duration,
    },
}

impl Backoff {
    pub fn delay_for(&self, attempts: u32) -> Option<Duration> {
        match self {
            Backoff::None => None,
            Backoff::Fixed(d) => Some(*d),
            Backoff::Exponential {
                base,
                multiplier,
                max_delay,
            } => {
                let exp = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = base.as_secs_f64() * multiplier.powi(exp);
                // inf / NaN も上限に丸める
                let delay = Duration::try_from_secs_f64(secs).unwrap_or(*max_delay);
                Some(delay.min(*max_delay))
            }
        }
    }
}

/// Retry policy applied by `LeaseManager::release_failure`.
///
/// Errors containing one of `rate_limit_markers` (e.g. `"429"`) use
/// `rate_limited_delay` instead of the regular backoff; quota errors recover
/// faster than genuine parse failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub rate_limit_markers: Vec<String>,
    pub rate_limited_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    /// Requeue iff attempts remain, no delay.
    fn default() -> Self {
        Self {
            backoff: Backoff::None,
            rate_limit_markers: Vec::new(),
            rate_limited_delay: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_rate_limit(mut self, markers: Vec<String>, delay: Duration) -> Self {
        self.rate_limit_markers = markers;
        self.rate_limited_delay = Some(delay);
        self
    }

    pub fn is_rate_limited(&self, error: &str) -> bool {
        self.rate_limit_markers
            .iter()
            .any(|m| !m.is_empty() && error.contains(m.as_str()))
    }

    pub fn decide(
        &self,
        attempts: u32,
        max_attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if attempts >= max_attempts {
            return RetryDecision::FailTerminal;
        }

        let delay = match self.rate_limited_delay {
            Some(d) if self.is_rate_limited(error) => Some(d),
            _ => self.backoff.delay_for(attempts),
        };

        RetryDecision::Requeue {
            next_eligible_at: delay.map(|d| offset(now, d)),
        }
    }
}

fn offset(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
