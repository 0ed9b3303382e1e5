//! A single symbol's order book.
//!
//! Bids and asks are each kept as an ordered map of price level to a FIFO
//! queue of resting orders, the same shape as a `services::matching::Orderbook`.
//! Unlike that shape, this type does not lock anything internally: the
//! matching engine is the sole owner of a book at any time, so interior
//! mutability would only hide a bug if it were ever needed.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::matching::types::{OrderEntry, PriceLevel};
use crate::models::Side;

#[derive(Debug, Default)]
pub struct OrderBook {
    symbol: String,
    // Highest price first: keyed by Reverse(price) so BTreeMap's natural
    // ascending iteration yields best-bid-first.
    bids: BTreeMap<(Reverse<PriceLevel>, u64), OrderEntry>,
    // Lowest price first: natural ascending order is already best-ask-first.
    asks: BTreeMap<(PriceLevel, u64), OrderEntry>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Insert a resting order. Caller assigns `sequence` before calling —
    /// the book never invents one, so recovery can reuse arrival order
    /// derived from `created_at` on reload.
    pub fn insert(&mut self, order: OrderEntry) {
        let level = PriceLevel::from_decimal(order.price);
        match order.side {
            Side::Buy => {
                self.bids.insert((Reverse(level), order.sequence), order);
            }
            Side::Sell => {
                self.asks.insert((level, order.sequence), order);
            }
        }
    }

    /// The best resting order on one side, without removing it. The
    /// matching loop mutates its `quantity` in place via `peek_best_mut`
    /// while walking fills, then calls `pop_best` once it is exhausted.
    pub fn peek_best(&self, side: Side) -> Option<&OrderEntry> {
        match side {
            Side::Buy => self.bids.values().next(),
            Side::Sell => self.asks.values().next(),
        }
    }

    pub fn peek_best_mut(&mut self, side: Side) -> Option<&mut OrderEntry> {
        match side {
            Side::Buy => self.bids.values_mut().next(),
            Side::Sell => self.asks.values_mut().next(),
        }
    }

    /// Remove and return the best resting order on one side.
    ///
    /// Callers must only pop an order once its resting quantity has
    /// reached zero (invariant O1) — popping a partially filled order
    /// would silently lose the remainder, so this is a logic error in the
    /// engine, not a recoverable runtime condition.
    pub fn pop_best(&mut self, side: Side) -> Option<OrderEntry> {
        match side {
            Side::Buy => {
                let key = self.bids.keys().next().copied();
                key.and_then(|k| self.bids.remove(&k))
            }
            Side::Sell => {
                let key = self.asks.keys().next().copied();
                key.and_then(|k| self.asks.remove(&k))
            }
        }
    }

    pub fn best_bid_price(&self) -> Option<Decimal> {
        self.bids.keys().next().map(|(Reverse(level), _)| level.to_decimal())
    }

    pub fn best_ask_price(&self) -> Option<Decimal> {
        self.asks.keys().next().map(|(level, _)| level.to_decimal())
    }

    pub fn is_crossed(&self) -> bool {
        match (self.best_bid_price(), self.best_ask_price()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Aggregated top `n` price levels on one side, best first, as
    /// `(price, total_quantity)` pairs — the shape the market-data
    /// publisher broadcasts.
    pub fn top_n(&self, side: Side, n: usize) -> Vec<(Decimal, Decimal)> {
        let mut out: Vec<(Decimal, Decimal)> = Vec::new();
        match side {
            Side::Buy => {
                for (_, order) in self.bids.iter() {
                    accumulate_level(&mut out, order.price, order.quantity, n);
                }
            }
            Side::Sell => {
                for (_, order) in self.asks.iter() {
                    accumulate_level(&mut out, order.price, order.quantity, n);
                }
            }
        }
        out
    }

    pub fn order_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }
}

fn accumulate_level(levels: &mut Vec<(Decimal, Decimal)>, price: Decimal, quantity: Decimal, n: usize) {
    if let Some(last) = levels.last_mut() {
        if last.0 == price {
            last.1 += quantity;
            return;
        }
    }
    if levels.len() < n {
        levels.push((price, quantity));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(side: Side, price: Decimal, quantity: Decimal, sequence: u64) -> OrderEntry {
        OrderEntry {
            id: Uuid::new_v4(),
            address: "0xabc".into(),
            side,
            price,
            quantity,
            sequence,
        }
    }

    #[test]
    fn bids_rank_highest_price_first() {
        let mut book = OrderBook::new("BTC/USDT");
        book.insert(order(Side::Buy, dec!(100), dec!(1), 1));
        book.insert(order(Side::Buy, dec!(101), dec!(1), 2));
        assert_eq!(book.best_bid_price(), Some(dec!(101)));
    }

    #[test]
    fn asks_rank_lowest_price_first() {
        let mut book = OrderBook::new("BTC/USDT");
        book.insert(order(Side::Sell, dec!(101), dec!(1), 1));
        book.insert(order(Side::Sell, dec!(100), dec!(1), 2));
        assert_eq!(book.best_ask_price(), Some(dec!(100)));
    }

    #[test]
    fn same_price_ties_break_on_arrival_sequence() {
        let mut book = OrderBook::new("BTC/USDT");
        let first = order(Side::Sell, dec!(100), dec!(1), 1);
        let first_id = first.id;
        book.insert(first);
        book.insert(order(Side::Sell, dec!(100), dec!(1), 2));

        assert_eq!(book.peek_best(Side::Sell).unwrap().id, first_id);
    }

    #[test]
    fn pop_best_removes_the_front_of_queue() {
        let mut book = OrderBook::new("BTC/USDT");
        book.insert(order(Side::Sell, dec!(100), dec!(1), 1));
        book.insert(order(Side::Sell, dec!(100), dec!(1), 2));

        let popped = book.pop_best(Side::Sell).unwrap();
        assert_eq!(popped.sequence, 1);
        assert_eq!(book.order_count(), 1);
    }

    #[test]
    fn top_n_aggregates_quantity_at_equal_price() {
        let mut book = OrderBook::new("BTC/USDT");
        book.insert(order(Side::Buy, dec!(100), dec!(1), 1));
        book.insert(order(Side::Buy, dec!(100), dec!(2), 2));
        book.insert(order(Side::Buy, dec!(99), dec!(5), 3));

        let levels = book.top_n(Side::Buy, 10);
        assert_eq!(levels[0], (dec!(100), dec!(3)));
        assert_eq!(levels[1], (dec!(99), dec!(5)));
    }

    #[test]
    fn top_n_is_bounded() {
        let mut book = OrderBook::new("BTC/USDT");
        for i in 0..20 {
            book.insert(order(Side::Buy, Decimal::from(100 - i), dec!(1), i as u64));
        }
        assert_eq!(book.top_n(Side::Buy, 5).len(), 5);
    }

    #[test]
    fn not_crossed_when_book_is_empty_or_one_sided() {
        let mut book = OrderBook::new("BTC/USDT");
        assert!(!book.is_crossed());
        book.insert(order(Side::Buy, dec!(100), dec!(1), 1));
        assert!(!book.is_crossed());
    }

    #[test]
    fn crossed_when_bid_meets_or_exceeds_ask() {
        let mut book = OrderBook::new("BTC/USDT");
        book.insert(order(Side::Buy, dec!(100), dec!(1), 1));
        book.insert(order(Side::Sell, dec!(100), dec!(1), 2));
        assert!(book.is_crossed());
    }
}
