//! IngestService - 参照データのチャンク取り込み
//!
//! 順序: 認証 → type の解釈 → price_table_id の確認 → バックエンドへ転送。
//! 認証に失敗したリクエストはバックエンドに一切届きません。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{ErrorKind, QueueError};
use crate::ports::{Authenticator, BatchIngestor, IngestBatch, IngestKind};

/// Wire shape of one chunk: `{ "type": ..., "chunk": [...], "price_table_id": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub chunk: Vec<serde_json::Value>,
    #[serde(default)]
    pub price_table_id: Option<String>,
}

impl IngestRequest {
    fn validate(self) -> Result<IngestBatch, QueueError> {
        let kind: IngestKind = self.kind.parse()?;
        let price_table_id = self.price_table_id.filter(|p| !p.trim().is_empty());
        if kind.requires_price_table() && price_table_id.is_none() {
            return Err(QueueError::MissingPriceTable(kind.to_string()));
        }
        Ok(IngestBatch {
            kind,
            rows: self.chunk,
            price_table_id,
        })
    }
}

pub struct IngestService {
    authenticator: Arc<dyn Authenticator>,
    ingestor: Arc<dyn BatchIngestor>,
}

impl IngestService {
    pub fn new(authenticator: Arc<dyn Authenticator>, ingestor: Arc<dyn BatchIngestor>) -> Self {
        Self {
            authenticator,
            ingestor,
        }
    }

    pub async fn handle(
        &self,
        bearer: Option<&str>,
        request: IngestRequest,
    ) -> Result<serde_json::Value, QueueError> {
        self.handle_decoded(bearer, Ok(request)).await
    }

    /// Like `handle`, for a body whose decoding may already have failed.
    /// Authentication still runs first, so an unauthenticated caller gets
    /// `Unauthorized` even when the body is garbage.
    pub async fn handle_decoded(
        &self,
        bearer: Option<&str>,
        request: Result<IngestRequest, QueueError>,
    ) -> Result<serde_json::Value, QueueError> {
        let caller = self.authenticator.authenticate(bearer).await?;
        let batch = request?.validate()?;
        let kind = batch.kind;
        let rows = batch.rows.len();

        let result = self
            .ingestor
            .ingest(batch)
            .await
            .inspect_err(|e| warn!(caller = %caller.subject, %kind, error = %e, "ingest failed"))?;
        info!(caller = %caller.subject, %kind, rows, "chunk ingested");
        Ok(result)
    }
}

/// HTTP status for an intake error.
pub fn http_status(err: &QueueError) -> u16 {
    match err.kind() {
        ErrorKind::Unauthorized => 401,
        ErrorKind::Invalid => 400,
        ErrorKind::LeaseLost => 409,
        ErrorKind::Transient => 502,
    }
}
