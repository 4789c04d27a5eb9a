//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: テスト・デモ用の正本
//! - **SqliteTaskStore**: SQLite を正本にした本番用ストア（feature `sqlite`）
//! - **TracingEventSink / MemoryEventSink / NoopEventSink**
//! - **StaticTokenAuthenticator / InMemoryIngestor**: ingest intake の開発用実装

pub mod event_sinks;
pub mod ingest;
pub mod memory_store;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use self::event_sinks::{MemoryEventSink, NoopEventSink, TracingEventSink};
pub use self::ingest::{InMemoryIngestor, StaticTokenAuthenticator};
pub use self::memory_store::InMemoryTaskStore;
#[cfg(feature = "sqlite")]
pub use self::sqlite_store::SqliteTaskStore;
