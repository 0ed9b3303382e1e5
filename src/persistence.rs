//! Durable order and trade storage.
//!
//! The source system keeps orders and trades in document
//! collections; with no document-store client available, only
//! `sqlx`/Postgres, the `orders`/`trades` collections are modeled as
//! relational tables of the same name. The `OrderStore` trait keeps that
//! choice out of the engine itself.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use crate::errors::PersistenceError;
use crate::models::{Order, Trade};

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// All orders with status `open` or `partially_filled`, for recovery
    /// on boot (reinserted in `created_at` order).
    async fn load_open_orders(&self) -> Result<Vec<Order>, PersistenceError>;

    /// Insert a newly-resting order (invariant P1: it is durable before
    /// the engine acks the message that produced it). Matched-away
    /// maker orders are never rewritten here — see `engine.rs`.
    async fn save_resting_order(&self, order: &Order) -> Result<(), PersistenceError>;

    /// Persist every fill produced by one incoming order in a single
    /// transaction — partial failure here must not leave some fills
    /// recorded and others lost.
    async fn save_trades(&self, trades: &[Trade]) -> Result<(), PersistenceError>;
}

pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn load_open_orders(&self) -> Result<Vec<Order>, PersistenceError> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, symbol, side, order_type, quantity, price, address, signature, status, created_at
            FROM orders
            WHERE status IN ('open', 'partially_filled')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn save_resting_order(&self, order: &Order) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, symbol, side, order_type, quantity, price, address, signature, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(order.id)
        .bind(&order.symbol)
        .bind(order.side)
        .bind(order.order_type)
        .bind(order.quantity)
        .bind(order.price)
        .bind(&order.address)
        .bind(&order.signature)
        .bind(order.status)
        .bind(order.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_trades(&self, trades: &[Trade]) -> Result<(), PersistenceError> {
        if trades.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for trade in trades {
            sqlx::query(
                r#"
                INSERT INTO trades (symbol, price, quantity, tx_hash, timestamp)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&trade.symbol)
            .bind(trade.price)
            .bind(trade.quantity)
            .bind(&trade.tx_hash)
            .bind(trade.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }
}

/// Build a `Trade` ready for `save_trades`, stamping the current time —
/// pulled out of the engine so tests can construct trades without a clock.
pub fn trade_from_fill(symbol: &str, price: rust_decimal::Decimal, quantity: rust_decimal::Decimal, tx_hash: Option<String>) -> Trade {
    Trade {
        symbol: symbol.to_string(),
        price,
        quantity,
        tx_hash,
        timestamp: Utc::now(),
    }
}
