//! Ingest port の開発用実装
//!
//! - StaticTokenAuthenticator: 設定ファイルの bearer token 一覧で認証
//! - InMemoryIngestor: 受け取ったチャンクを保持するだけのバックエンド

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::QueueError;
use crate::ports::{Authenticator, BatchIngestor, Caller, IngestBatch};

/// token -> subject
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, bearer: Option<&str>) -> Result<Caller, QueueError> {
        let token = bearer
            .map(|b| b.strip_prefix("Bearer ").unwrap_or(b).trim())
            .filter(|t| !t.is_empty())
            .ok_or(QueueError::Unauthorized)?;
        self.tokens
            .get(token)
            .map(|subject| Caller {
                subject: subject.clone(),
            })
            .ok_or(QueueError::Unauthorized)
    }
}

/// Keeps every accepted chunk; can be told to fail for backend-error tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIngestor {
    batches: Arc<Mutex<Vec<IngestBatch>>>,
    fail_with: Option<String>,
}

impl InMemoryIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            batches: Arc::default(),
            fail_with: Some(reason.into()),
        }
    }

    pub async fn batches(&self) -> Vec<IngestBatch> {
        self.batches.lock().await.clone()
    }
}

#[async_trait]
impl BatchIngestor for InMemoryIngestor {
    async fn ingest(&self, batch: IngestBatch) -> Result<serde_json::Value, QueueError> {
        if let Some(reason) = &self.fail_with {
            return Err(QueueError::Store(reason.clone()));
        }
        let summary = serde_json::json!({
            "type": batch.kind.as_str(),
            "rows": batch.rows.len(),
        });
        self.batches.lock().await.push(batch);
        Ok(summary)
    }
}
