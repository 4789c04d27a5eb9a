//! Ingest ports - バッチ取り込みの外部境界
//!
//! queue 本体とは独立した intake。呼び出し元の認証と、チャンク単位の
//! バックエンド書き込みだけを trait として定義します。

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::QueueError;

/// Reference-data batch types accepted by the intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestKind {
    Inputs,
    InputPrices,
    Compositions,
    CompositionPrices,
    CompositionItems,
}

impl IngestKind {
    pub const ALL: [IngestKind; 5] = [
        IngestKind::Inputs,
        IngestKind::InputPrices,
        IngestKind::Compositions,
        IngestKind::CompositionPrices,
        IngestKind::CompositionItems,
    ];

    /// Kinds scoped to a price table.
    pub fn requires_price_table(self) -> bool {
        matches!(
            self,
            IngestKind::InputPrices | IngestKind::CompositionPrices | IngestKind::CompositionItems
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IngestKind::Inputs => "inputs",
            IngestKind::InputPrices => "input_prices",
            IngestKind::Compositions => "compositions",
            IngestKind::CompositionPrices => "composition_prices",
            IngestKind::CompositionItems => "composition_items",
        }
    }
}

impl fmt::Display for IngestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IngestKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| QueueError::InvalidIngestKind(s.to_string()))
    }
}

/// One validated chunk, forwarded as a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestBatch {
    pub kind: IngestKind,
    pub rows: Vec<serde_json::Value>,
    pub price_table_id: Option<String>,
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub subject: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `Err(QueueError::Unauthorized)` for a missing or unknown token.
    async fn authenticate(&self, bearer: Option<&str>) -> Result<Caller, QueueError>;
}

/// Backend that persists a chunk atomically (all rows or none).
///
/// Backend failures are reported as `QueueError::Store`.
#[async_trait]
pub trait BatchIngestor: Send + Sync {
    async fn ingest(&self, batch: IngestBatch) -> Result<serde_json::Value, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("inputs", IngestKind::Inputs, false)]
    #[case("input_prices", IngestKind::InputPrices, true)]
    #[case("compositions", IngestKind::Compositions, false)]
    #[case("composition_prices", IngestKind::CompositionPrices, true)]
    #[case("composition_items", IngestKind::CompositionItems, true)]
    fn parses_kinds(#[case] raw: &str, #[case] kind: IngestKind, #[case] priced: bool) {
        let parsed: IngestKind = raw.parse().unwrap();
        assert_eq!(parsed, kind);
        assert_eq!(parsed.requires_price_table(), priced);
        assert_eq!(serde_json::to_value(kind).unwrap(), raw);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = "prices".parse::<IngestKind>().unwrap_err();
        assert!(matches!(err, QueueError::InvalidIngestKind(ref k) if k == "prices"));
    }
}
