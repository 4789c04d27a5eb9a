//! Errors - エラー型と運用分類
//!
//! `QueueError` は core の全操作が返す唯一のエラー型です。
//! 呼び出し側は `kind()` で分類し、リトライするか・諦めるかを決めます。

use super::ids::{TaskId, WorkerId};

/// Operational classification of a `QueueError`.
///
/// - Transient: ストア障害など。状態変化は起きていない前提で呼び出し側が再試行してよい
/// - LeaseLost: lease を失った worker はそのタスクを放棄し、以後何も書かない
/// - Unauthorized: 境界で拒否（ストアは一切変更しない）
/// - Invalid: 呼び出し側のバグ / 不正入力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    LeaseLost,
    Unauthorized,
    Invalid,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Backend failure (I/O, driver, poisoned connection, join error).
    #[error("store error: {0}")]
    Store(String),

    /// The caller no longer holds the lease: either another worker has it,
    /// or it expired and was reclaimed.
    #[error("lease lost on {task_id} (worker {worker})")]
    LeaseLost { task_id: TaskId, worker: WorkerId },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("unknown ingest type: {0}")]
    InvalidIngestKind(String),

    #[error("price_table_id is required for {0}")]
    MissingPriceTable(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Store(_) => ErrorKind::Transient,
            QueueError::LeaseLost { .. } => ErrorKind::LeaseLost,
            QueueError::Unauthorized => ErrorKind::Unauthorized,
            QueueError::TaskNotFound(_)
            | QueueError::InvalidArgument(_)
            | QueueError::InvalidIngestKind(_)
            | QueueError::MissingPriceTable(_)
            | QueueError::Config(_) => ErrorKind::Invalid,
        }
    }

    pub fn is_lease_lost(&self) -> bool {
        self.kind() == ErrorKind::LeaseLost
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        QueueError::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    #[rstest]
    #[case::store(QueueError::Store("disk".into()), ErrorKind::Transient)]
    #[case::unauthorized(QueueError::Unauthorized, ErrorKind::Unauthorized)]
    #[case::bad_arg(QueueError::InvalidArgument("max_tasks".into()), ErrorKind::Invalid)]
    #[case::bad_kind(QueueError::InvalidIngestKind("foo".into()), ErrorKind::Invalid)]
    #[case::no_price_table(QueueError::MissingPriceTable("input_prices".into()), ErrorKind::Invalid)]
    fn kinds(#[case] err: QueueError, #[case] expected: ErrorKind) {
        assert_eq!(err.kind(), expected);
    }

    #[test]
    fn lease_lost_is_its_own_kind() {
        let err = QueueError::LeaseLost {
            task_id: TaskId::from_ulid(Ulid::new()),
            worker: WorkerId::from_ulid(Ulid::new()),
        };
        assert!(err.is_lease_lost());
        assert!(err.to_string().starts_with("lease lost on task-"));
    }
}
