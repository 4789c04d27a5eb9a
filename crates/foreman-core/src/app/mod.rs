//! App - アプリケーション層
//!
//! ports を組み合わせてキューの振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 設定の検証とワイヤリング
//! - **Enqueuer**: タスク / ジョブの登録
//! - **Dispatcher**: eligible なタスクの一括 claim
//! - **LeaseManager**: begin / renew / release
//! - **WorkerLoop / WorkerGroup**: claim → handle（lease を延長しながら）→ release
//! - **Reclaimer / ReclaimerLoop**: 期限切れ lease と孤児タスクの回収
//! - **StatusView / Remediation**: 運用者向けの状態ビューと一括修復
//! - **IngestService**: 参照データのチャンク取り込み

pub mod builder;
pub mod dispatcher;
pub mod enqueue;
pub mod ingest;
pub mod lease;
pub mod reclaimer;
pub mod remediation;
pub mod status;
pub mod worker_loop;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::dispatcher::{DispatchResult, Dispatcher};
pub use self::enqueue::{EnqueuedJob, Enqueuer};
pub use self::ingest::{IngestRequest, IngestService, http_status};
pub use self::lease::{Lease, LeaseManager};
pub use self::reclaimer::{
    BulkFailure, BulkOp, BulkOutcome, ReclaimReport, Reclaimer, ReclaimerLoop, apply_in_chunks,
};
pub use self::remediation::{DispatchDelta, Remediation, RemediationAction, RemediationReport};
pub use self::status::{BlockedAudit, StatusView, TaskStatusRow};
pub use self::worker_loop::{TaskHandler, TaskRun, WorkerGroup, WorkerLoop, WorkerSettings};
