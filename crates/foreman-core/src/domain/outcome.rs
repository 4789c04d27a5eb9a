//! Outcome model: what a handler reports for one attempt.
//!
//! The queue only distinguishes success from failure; the failure reason is
//! stored verbatim in `last_error` and fed to the retry policy.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            kind: OutcomeKind::Success,
            reason: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            reason: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }

    /// Text recorded as `last_error`.
    pub fn error_text(&self) -> String {
        self.reason
            .clone()
            .unwrap_or_else(|| "handler reported failure".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_kind_serializes_as_upper_snake() {
        let s = serde_json::to_string(&OutcomeKind::Success).unwrap();
        assert_eq!(s, "\"SUCCESS\"");
        let s = serde_json::to_string(&OutcomeKind::Failure).unwrap();
        assert_eq!(s, "\"FAILURE\"");
    }

    #[test]
    fn failure_keeps_reason_as_error_text() {
        let o = Outcome::failure("GEMINI_429 quota");
        assert!(!o.is_success());
        assert_eq!(o.error_text(), "GEMINI_429 quota");
    }

    #[test]
    fn success_omits_reason_in_json() {
        let v = serde_json::to_value(Outcome::success()).unwrap();
        assert_eq!(v, serde_json::json!({"kind": "SUCCESS"}));
    }
}
