//! Matching engine types
//!
//! Shared types for the order book and matching engine.

use rust_decimal::Decimal;
use std::cmp::Ordering;
use uuid::Uuid;

use crate::models::Side;

/// Price scaled to a fixed-point integer for exact ordering and hashing.
///
/// `Decimal` already implements `Ord` correctly, but keying a `BTreeMap`
/// on the raw `Decimal` forces a comparison through its internal scale
/// normalization on every lookup; a scaled integer key is the cheaper,
/// stable ordering key a price level abstraction typically uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriceLevel(i128);

const SCALE: i128 = 100_000_000; // 8 decimal places, matches on-chain precision conventions

impl PriceLevel {
    pub fn from_decimal(price: Decimal) -> Self {
        let scaled = (price * Decimal::from(SCALE)).trunc();
        PriceLevel(scaled.mantissa() / 10i128.pow(scaled.scale()))
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::from_i128_with_scale(self.0, 0) / Decimal::from(SCALE)
    }
}

/// An order resting in the book, or about to be inserted into one.
///
/// `sequence` is the monotonic arrival-order tiebreaker assigned by the
/// engine — never by order id or object identity.
#[derive(Debug, Clone)]
pub struct OrderEntry {
    pub id: Uuid,
    pub address: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub sequence: u64,
}

/// Ordering key for a resting order within one side of the book: best
/// price first, then earliest sequence. Bids want highest price first,
/// asks want lowest price first — callers pick `Reverse` on the bid side
/// when iterating a `BTreeMap`, the book itself only needs one ordering.
impl OrderEntry {
    pub fn tie_break_key(&self) -> (PriceLevel, u64) {
        (PriceLevel::from_decimal(self.price), self.sequence)
    }
}

impl PartialEq for OrderEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for OrderEntry {}

impl PartialOrd for OrderEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tie_break_key().cmp(&other.tie_break_key())
    }
}

/// One fill produced by matching an incoming order against a resting one.
#[derive(Debug, Clone)]
pub struct Fill {
    pub maker_address: String,
    pub taker_address: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub tx_hash: Option<String>,
}

/// Outcome of `MatchingEngine::process_order` for one incoming order.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub fills: Vec<Fill>,
    pub remaining_quantity: Decimal,
    pub resting_order_id: Option<Uuid>,
}

/// Top-of-book snapshot broadcast after every mutation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrderbookSnapshot {
    pub symbol: String,
    pub bids: Vec<[Decimal; 2]>,
    pub asks: Vec<[Decimal; 2]>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn price_level_round_trips() {
        let price = dec!(30000.12345678);
        let level = PriceLevel::from_decimal(price);
        assert_eq!(level.to_decimal(), price);
    }

    #[test]
    fn price_level_orders_numerically() {
        assert!(PriceLevel::from_decimal(dec!(100)) < PriceLevel::from_decimal(dec!(101)));
    }

    #[test]
    fn order_entry_ties_break_on_sequence_not_id() {
        let older = OrderEntry {
            id: Uuid::max(),
            address: "0xAAA".into(),
            side: Side::Sell,
            price: dec!(100),
            quantity: dec!(1),
            sequence: 1,
        };
        let newer = OrderEntry {
            id: Uuid::nil(),
            address: "0xBBB".into(),
            side: Side::Sell,
            price: dec!(100),
            quantity: dec!(1),
            sequence: 2,
        };
        // newer has the "smaller" uuid but arrived later: it must sort after.
        assert!(older < newer);
    }
}
