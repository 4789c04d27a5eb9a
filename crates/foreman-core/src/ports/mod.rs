//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! app 層はこれらの trait だけに依存し、テストでは InMemory 実装を注入します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）。worker 間の共有状態はこれだけ
//! - 時刻と ID 生成も trait 経由（テストで差し替え可能）

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod ingest;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::ingest::{Authenticator, BatchIngestor, Caller, IngestBatch, IngestKind};
pub use self::task_store::{TaskOrder, TaskQuery, TaskStore};
