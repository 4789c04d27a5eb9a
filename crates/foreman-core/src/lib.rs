//! foreman-core
//!
//! Lease-based work queue for import-parse tasks.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, task, outcome, decision, events, job, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator, EventSink, ingest）
//! - **impls**: 実装（InMemoryTaskStore, SqliteTaskStore, event sinks, ingest helpers）
//! - **app**: アプリケーションロジック（dispatcher, lease, reclaimer, worker_loop, status, ...）
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{App, AppBuilder};
pub use config::ForemanConfig;
pub use domain::QueueError;
