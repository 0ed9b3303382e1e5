use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An executed match, ready for persistence.
///
/// `tx_hash` is `None` when on-chain settlement failed; the match still
/// happened in memory and the trade is still recorded.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Trade {
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub tx_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}
