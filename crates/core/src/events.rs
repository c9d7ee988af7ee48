use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::BookSnapshot;

/// Events delivered by the price feed.
///
/// Serialized with a `type` tag so recorded sessions can be replayed from JSON lines:
///
/// ```json
/// {"type":"price","timestamp":"2026-01-01T00:00:01Z","price":"97000.5"}
/// {"type":"book","token_id":"123","bids":[...],"asks":[...],"timestamp":"..."}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    /// Reference asset tick, matching the settlement oracle.
    Price {
        timestamp: DateTime<Utc>,
        price: Decimal,
    },
    /// Order book snapshot of one outcome token.
    Book(BookSnapshot),
}

impl MarketEvent {
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Price { timestamp, .. } => *timestamp,
            Self::Book(book) => book.timestamp,
        }
    }
}
