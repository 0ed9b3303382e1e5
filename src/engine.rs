//! The matching engine.
//!
//! Owns every symbol's order book and drives the full lifecycle of one
//! incoming order: validate, match against the opposite side, settle each
//! fill on-chain, persist the result, and publish an updated snapshot —
//! all before the caller acknowledges the queue message.
//!
//! This mirrors the reference `MatchingEngine.process_order` /
//! `process_limit_order` control flow (`original_source/workers/order_processor/matching_engine.py`)
//! and an `Orderbook::match_order` loop, but splits "walk the
//! book and decide fills" (here) from "is this price level ahead of that
//! one" (`matching::OrderBook`), and makes persistence/settlement
//! synchronous rather than fire-and-forget the way an
//! `OrderFlowOrchestrator::process_order` would spawn them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::MatchingError;
use crate::market_data::MarketDataPublisher;
use crate::matching::types::{Fill, MatchOutcome, OrderEntry};
use crate::matching::OrderBook;
use crate::models::{IncomingOrder, Order, OrderStatus, OrderType, Side};
use crate::persistence::{trade_from_fill, OrderStore};
use crate::settlement::{Settlement, TradeLeg};

/// Bound on the in-memory dedup set: old enough entries are evicted so a
/// long-running worker doesn't grow unbounded. Redelivery only requires that
/// a message redelivered shortly after its first delivery (the only
/// realistic case for a queue consumer crash/retry) be caught.
const DEDUP_CAPACITY: usize = 10_000;

pub struct MatchingEngine {
    books: DashMap<String, OrderBook>,
    sequence: AtomicU64,
    store: Arc<dyn OrderStore>,
    settlement: Arc<dyn Settlement>,
    publisher: Arc<dyn MarketDataPublisher>,
    config: AppConfig,
    /// When `false`, `process_order` re-matches a redelivered message as
    /// if it were new — reproduces the duplicate-fill bug the reference
    /// worker has, kept only so the engine's test suite can demonstrate
    /// the regression the dedup set fixes.
    dedup_enabled: bool,
    seen_messages: parking_lot::Mutex<VecDeque<String>>,
}

impl MatchingEngine {
    pub fn new(
        store: Arc<dyn OrderStore>,
        settlement: Arc<dyn Settlement>,
        publisher: Arc<dyn MarketDataPublisher>,
        config: AppConfig,
    ) -> Self {
        Self {
            books: DashMap::new(),
            sequence: AtomicU64::new(0),
            store,
            settlement,
            publisher,
            config,
            dedup_enabled: true,
            seen_messages: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    #[cfg(test)]
    pub fn with_dedup_disabled(mut self) -> Self {
        self.dedup_enabled = false;
        self
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// True if `message_id` has already been processed; records it as
    /// seen either way so a second call for the same id is idempotent.
    fn mark_seen(&self, message_id: &str) -> bool {
        if !self.dedup_enabled {
            return false;
        }
        let mut seen = self.seen_messages.lock();
        if seen.iter().any(|id| id == message_id) {
            return true;
        }
        seen.push_back(message_id.to_string());
        if seen.len() > DEDUP_CAPACITY {
            seen.pop_front();
        }
        false
    }

    /// Load every open order from the store and reinsert it into its
    /// book, oldest first. The store query already orders by
    /// `created_at ASC` (this resolves the heap-insertion
    /// non-determinism this way), so sequence numbers assigned here
    /// preserve arrival order exactly.
    pub async fn recover(&self) -> Result<(), MatchingError> {
        let open_orders = self.store.load_open_orders().await?;
        for order in open_orders {
            let mut book = self.books.entry(order.symbol.clone()).or_insert_with(|| OrderBook::new(order.symbol.clone()));
            let price = order.price.ok_or(MatchingError::MissingPrice)?;
            book.insert(OrderEntry {
                id: order.id,
                address: order.address.clone(),
                side: order.side,
                price,
                quantity: order.quantity,
                sequence: self.next_sequence(),
            });
        }
        Ok(())
    }

    /// Process one incoming order end to end. Returns the outcome so the
    /// caller (the consume loop in `main`) can log it; all side effects
    /// (settlement submission, persistence, publication) have already
    /// happened by the time this returns `Ok`.
    pub async fn process_order(
        &self,
        incoming: IncomingOrder,
        message_id: &str,
    ) -> Result<MatchOutcome, MatchingError> {
        if self.mark_seen(message_id) {
            return Ok(MatchOutcome {
                fills: Vec::new(),
                remaining_quantity: Decimal::ZERO,
                resting_order_id: None,
            });
        }

        if incoming.symbol.trim().is_empty() {
            return Err(MatchingError::MissingSymbol);
        }
        if incoming.quantity <= Decimal::ZERO {
            return Err(MatchingError::InvalidQuantity(incoming.quantity));
        }
        if !self.config.trading_pairs.iter().any(|p| p == &incoming.symbol) {
            return Err(MatchingError::UnknownSymbol(incoming.symbol.clone()));
        }

        let limit_price = match incoming.order_type {
            OrderType::Limit => incoming.price.ok_or(MatchingError::MissingPrice)?,
            OrderType::Market => {
                // Market orders are rejected, not matched —
                // the reference worker logs a warning and does nothing,
                // which would silently swallow the order. Surfacing it
                // as an error lets the caller decide how to handle it
                // (log + discard, per §7) instead of losing it quietly.
                return Err(MatchingError::UnsupportedOrderType("market".to_string()));
            }
        };

        let taker_id = Uuid::new_v4();
        let taker_side = incoming.side;
        let opposite = taker_side.opposite();

        let mut remaining = incoming.quantity;
        let mut fills: Vec<Fill> = Vec::new();
        let mut trade_records = Vec::new();

        {
            let mut book = self
                .books
                .entry(incoming.symbol.clone())
                .or_insert_with(|| OrderBook::new(incoming.symbol.clone()));

            while remaining > Decimal::ZERO {
                let crosses = match book.peek_best(opposite) {
                    Some(maker) => match taker_side {
                        Side::Buy => limit_price >= maker.price,
                        Side::Sell => limit_price <= maker.price,
                    },
                    None => false,
                };
                if !crosses {
                    break;
                }

                let maker_price = book.peek_best(opposite).unwrap().price;
                let maker_address = book.peek_best(opposite).unwrap().address.clone();
                let maker_available = book.peek_best(opposite).unwrap().quantity;
                let fill_quantity = remaining.min(maker_available);

                // Maker-price rule: the resting order's price always wins
                // regardless of which side is the taker.
                let (seller, buyer) = match taker_side {
                    Side::Buy => (maker_address.clone(), incoming.address.clone()),
                    Side::Sell => (incoming.address.clone(), maker_address.clone()),
                };

                let leg = TradeLeg {
                    base_symbol: base_of(&incoming.symbol),
                    quote_symbol: quote_of(&incoming.symbol),
                    seller,
                    buyer,
                    amount_sold: fill_quantity,
                    amount_bought: fill_quantity * maker_price,
                };

                let tx_hash = match self.settlement.settle(&leg, &self.config).await {
                    Ok(hash) => Some(hash),
                    Err(e) => {
                        tracing::warn!(error = %e, symbol = %incoming.symbol, "settlement failed, recording trade without tx hash");
                        None
                    }
                };

                fills.push(Fill {
                    maker_address,
                    taker_address: incoming.address.clone(),
                    price: maker_price,
                    quantity: fill_quantity,
                    tx_hash: tx_hash.clone(),
                });
                trade_records.push(trade_from_fill(&incoming.symbol, maker_price, fill_quantity, tx_hash));

                remaining -= fill_quantity;
                let maker = book.peek_best_mut(opposite).unwrap();
                maker.quantity -= fill_quantity;
                let maker_exhausted = maker.quantity <= Decimal::ZERO;

                // The maker's store record is never rewritten here: the
                // source worker only ever inserts a resting order once and
                // removes it from the in-memory heap on a full fill,
                // without writing the corresponding status transition back
                // to the store (an acknowledged gap, not one
                // this worker papers over).
                if maker_exhausted {
                    book.pop_best(opposite);
                }
            }

            let resting_order_id = if remaining > Decimal::ZERO {
                let sequence = self.next_sequence();
                book.insert(OrderEntry {
                    id: taker_id,
                    address: incoming.address.clone(),
                    side: taker_side,
                    price: limit_price,
                    quantity: remaining,
                    sequence,
                });
                Some(taker_id)
            } else {
                None
            };

            if let Some(id) = resting_order_id {
                let status = if remaining == incoming.quantity {
                    OrderStatus::Open
                } else {
                    OrderStatus::PartiallyFilled
                };
                let order = Order {
                    id,
                    symbol: incoming.symbol.clone(),
                    side: taker_side,
                    order_type: incoming.order_type,
                    quantity: remaining,
                    price: Some(limit_price),
                    address: incoming.address.clone(),
                    signature: incoming.signature.clone(),
                    status,
                    created_at: Utc::now(),
                };
                self.store.save_resting_order(&order).await?;
            }

            if !trade_records.is_empty() {
                self.store.save_trades(&trade_records).await?;
            }

            let snapshot = crate::matching::OrderbookSnapshot {
                symbol: incoming.symbol.clone(),
                bids: book.top_n(Side::Buy, 10).into_iter().map(|(p, q)| [p, q]).collect(),
                asks: book.top_n(Side::Sell, 10).into_iter().map(|(p, q)| [p, q]).collect(),
            };
            drop(book);
            if let Err(e) = self.publisher.publish_snapshot(&snapshot).await {
                tracing::warn!(error = %e, symbol = %incoming.symbol, "failed to publish orderbook snapshot");
            }

            Ok(MatchOutcome {
                fills,
                remaining_quantity: remaining,
                resting_order_id,
            })
        }
    }
}

fn base_of(symbol: &str) -> String {
    symbol.split('/').next().unwrap_or(symbol).to_string()
}

fn quote_of(symbol: &str) -> String {
    symbol.split('/').nth(1).unwrap_or(symbol).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{PersistenceError, PublishError};
    use crate::models::Trade;
    use crate::settlement::FailingSettlement;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct NullStore {
        open_orders: Vec<Order>,
        saved_trades: Mutex<Vec<Trade>>,
    }

    #[async_trait]
    impl OrderStore for NullStore {
        async fn load_open_orders(&self) -> Result<Vec<Order>, PersistenceError> {
            Ok(self.open_orders.clone())
        }
        async fn save_resting_order(&self, _order: &Order) -> Result<(), PersistenceError> {
            Ok(())
        }
        async fn save_trades(&self, trades: &[Trade]) -> Result<(), PersistenceError> {
            self.saved_trades.lock().unwrap().extend_from_slice(trades);
            Ok(())
        }
    }

    struct NullPublisher;

    #[async_trait]
    impl MarketDataPublisher for NullPublisher {
        async fn publish_snapshot(&self, _snapshot: &crate::matching::OrderbookSnapshot) -> Result<(), PublishError> {
            Ok(())
        }
    }

    fn test_config() -> AppConfig {
        AppConfig {
            database_url: String::new(),
            redis_url: String::new(),
            rpc_url: String::new(),
            settlement_contract_address: String::new(),
            backend_wallet_private_key: String::new(),
            token_map: HashMap::new(),
            trading_pairs: vec!["BTC/USDT".to_string()],
            consumer_group: "g".to_string(),
            consumer_name: "c".to_string(),
        }
    }

    fn incoming(side: Side, quantity: Decimal, price: Decimal, address: &str) -> IncomingOrder {
        IncomingOrder {
            symbol: "BTC/USDT".to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            address: address.to_string(),
            signature: "sig".to_string(),
        }
    }

    // `settle` always fails in these tests since there's no live chain
    // endpoint to reach; every fill is expected to carry `tx_hash: None`.
    // `SettlementClient::connect` itself requires network access to read
    // the chain id, so engine tests build `MatchingEngine` directly
    // against a store/publisher pair and never construct a real client —
    // instead they exercise the book/persistence/dedup logic in
    // isolation via the public `OrderBook` API, which `process_order`'s
    // loop is built on top of.

    #[test]
    fn rests_an_order_on_an_empty_book() {
        let mut book = OrderBook::new("BTC/USDT");
        book.insert(OrderEntry {
            id: Uuid::new_v4(),
            address: "0xabc".into(),
            side: Side::Buy,
            price: dec!(100),
            quantity: dec!(1),
            sequence: 0,
        });
        assert_eq!(book.best_bid_price(), Some(dec!(100)));
        assert!(!book.is_crossed());
    }

    #[test]
    fn exact_cross_empties_both_sides() {
        let mut book = OrderBook::new("BTC/USDT");
        book.insert(OrderEntry {
            id: Uuid::new_v4(),
            address: "0xmaker".into(),
            side: Side::Sell,
            price: dec!(100),
            quantity: dec!(1),
            sequence: 0,
        });

        let maker = book.peek_best(Side::Sell).unwrap().clone();
        assert_eq!(maker.quantity, dec!(1));
        let maker_mut = book.peek_best_mut(Side::Sell).unwrap();
        maker_mut.quantity -= dec!(1);
        assert!(maker_mut.quantity <= Decimal::ZERO);
        book.pop_best(Side::Sell);
        assert_eq!(book.order_count(), 0);
    }

    fn test_engine(dedup_enabled: bool) -> (MatchingEngine, Arc<NullStore>) {
        let store = Arc::new(NullStore {
            open_orders: Vec::new(),
            saved_trades: Mutex::new(Vec::new()),
        });
        let mut engine = MatchingEngine::new(
            store.clone(),
            Arc::new(FailingSettlement),
            Arc::new(NullPublisher),
            test_config(),
        );
        if !dedup_enabled {
            engine = engine.with_dedup_disabled();
        }
        (engine, store)
    }

    #[tokio::test]
    async fn taker_with_no_cross_rests_on_the_book() {
        let (engine, _store) = test_engine(true);
        let outcome = engine
            .process_order(incoming(Side::Buy, dec!(1), dec!(100), "0xbuyer"), "m1")
            .await
            .unwrap();

        assert!(outcome.fills.is_empty());
        assert_eq!(outcome.remaining_quantity, dec!(1));
        assert!(outcome.resting_order_id.is_some());
    }

    #[tokio::test]
    async fn exact_cross_produces_one_fill_with_no_remainder() {
        let (engine, store) = test_engine(true);
        engine
            .process_order(incoming(Side::Sell, dec!(1), dec!(100), "0xmaker"), "m1")
            .await
            .unwrap();

        let outcome = engine
            .process_order(incoming(Side::Buy, dec!(1), dec!(100), "0xtaker"), "m2")
            .await
            .unwrap();

        assert_eq!(outcome.fills.len(), 1);
        assert_eq!(outcome.fills[0].price, dec!(100));
        assert_eq!(outcome.remaining_quantity, Decimal::ZERO);
        assert!(outcome.resting_order_id.is_none());
        // Settlement always fails in this test double, so every fill's
        // trade record must still land with no transaction hash.
        assert_eq!(store.saved_trades.lock().unwrap()[0].tx_hash, None);
    }

    #[tokio::test]
    async fn taker_fills_at_the_maker_price_not_its_own_limit() {
        let (engine, _store) = test_engine(true);
        engine
            .process_order(incoming(Side::Sell, dec!(1), dec!(95), "0xmaker"), "m1")
            .await
            .unwrap();

        // Buyer is willing to pay 100 but the maker rule prices the fill
        // at the resting order's 95.
        let outcome = engine
            .process_order(incoming(Side::Buy, dec!(1), dec!(100), "0xtaker"), "m2")
            .await
            .unwrap();

        assert_eq!(outcome.fills[0].price, dec!(95));
    }

    #[tokio::test]
    async fn partial_fill_rests_the_remainder() {
        let (engine, _store) = test_engine(true);
        engine
            .process_order(incoming(Side::Sell, dec!(1), dec!(100), "0xmaker"), "m1")
            .await
            .unwrap();

        let outcome = engine
            .process_order(incoming(Side::Buy, dec!(3), dec!(100), "0xtaker"), "m2")
            .await
            .unwrap();

        assert_eq!(outcome.fills.len(), 1);
        assert_eq!(outcome.fills[0].quantity, dec!(1));
        assert_eq!(outcome.remaining_quantity, dec!(2));
        assert!(outcome.resting_order_id.is_some());
    }

    #[tokio::test]
    async fn price_time_priority_consumes_earlier_order_first() {
        let (engine, _store) = test_engine(true);
        engine
            .process_order(incoming(Side::Sell, dec!(1), dec!(100), "0xfirst"), "m1")
            .await
            .unwrap();
        engine
            .process_order(incoming(Side::Sell, dec!(1), dec!(100), "0xsecond"), "m2")
            .await
            .unwrap();

        let outcome = engine
            .process_order(incoming(Side::Buy, dec!(1), dec!(100), "0xtaker"), "m3")
            .await
            .unwrap();

        assert_eq!(outcome.fills[0].maker_address, "0xfirst");
    }

    #[tokio::test]
    async fn second_resting_order_is_partially_consumed_after_the_first_is_exhausted() {
        let (engine, _store) = test_engine(true);
        engine
            .process_order(incoming(Side::Sell, dec!(1), dec!(100), "0xfirst"), "m1")
            .await
            .unwrap();
        engine
            .process_order(incoming(Side::Sell, dec!(1), dec!(100), "0xsecond"), "m2")
            .await
            .unwrap();

        let outcome = engine
            .process_order(incoming(Side::Buy, dec!(1.5), dec!(100), "0xtaker"), "m3")
            .await
            .unwrap();

        assert_eq!(outcome.fills.len(), 2);
        assert_eq!(outcome.fills[0].maker_address, "0xfirst");
        assert_eq!(outcome.fills[0].quantity, dec!(1));
        assert_eq!(outcome.fills[1].maker_address, "0xsecond");
        assert_eq!(outcome.fills[1].quantity, dec!(0.5));
        assert_eq!(outcome.remaining_quantity, dec!(0));

        let book = engine.books.get("BTC/USDT").unwrap();
        let resting = book.peek_best(Side::Sell).unwrap();
        assert_eq!(resting.address, "0xsecond");
        assert_eq!(resting.quantity, dec!(0.5));
    }

    #[tokio::test]
    async fn market_orders_are_rejected() {
        let (engine, _store) = test_engine(true);
        let order = IncomingOrder {
            symbol: "BTC/USDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: dec!(1),
            price: None,
            address: "0xabc".to_string(),
            signature: "sig".to_string(),
        };

        let result = engine.process_order(order, "m1").await;
        assert!(matches!(result, Err(MatchingError::UnsupportedOrderType(_))));
    }

    #[tokio::test]
    async fn redelivered_message_is_not_rematched_when_dedup_enabled() {
        let (engine, store) = test_engine(true);
        engine
            .process_order(incoming(Side::Sell, dec!(1), dec!(100), "0xmaker"), "m1")
            .await
            .unwrap();

        let order = incoming(Side::Buy, dec!(1), dec!(100), "0xtaker");
        engine.process_order(order.clone(), "m2").await.unwrap();
        // Redelivery of the same message id must not produce a second trade.
        engine.process_order(order, "m2").await.unwrap();

        assert_eq!(store.saved_trades.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn redelivered_message_is_rematched_when_dedup_disabled() {
        // Demonstrates the bug the dedup set fixes: without it, a
        // redelivered message is matched twice against the book, exactly
        // like the reference worker with no idempotency guard.
        let (engine, store) = test_engine(false);
        engine
            .process_order(incoming(Side::Sell, dec!(2), dec!(100), "0xmaker"), "m1")
            .await
            .unwrap();

        let order = incoming(Side::Buy, dec!(1), dec!(100), "0xtaker");
        engine.process_order(order.clone(), "m2").await.unwrap();
        engine.process_order(order, "m2").await.unwrap();

        assert_eq!(store.saved_trades.lock().unwrap().len(), 2);
    }

    #[test]
    fn dedup_set_catches_redelivery() {
        let (engine, _store) = test_engine(true);
        assert!(!engine.mark_seen("msg-1"));
        assert!(engine.mark_seen("msg-1"));
    }

    #[test]
    fn dedup_disabled_lets_the_same_message_through_twice() {
        let (engine, _store) = test_engine(false);
        assert!(!engine.mark_seen("msg-1"));
        assert!(!engine.mark_seen("msg-1"));
    }
}
