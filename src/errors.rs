//! Error taxonomy for the matching worker.
//!
//! Each component gets its own error enum; callers are expected to
//! no error variant escape the per-message handler in `main`, which
//! matches on these to decide log+ack / log+discard / log+proceed.

use uuid::Uuid;

/// Errors raised while matching or validating an incoming order.
#[derive(Debug, thiserror::Error)]
pub enum MatchingError {
    #[error("order is missing a symbol")]
    MissingSymbol,

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("order type not supported by this engine: {0}")]
    UnsupportedOrderType(String),

    #[error("limit order is missing a price")]
    MissingPrice,

    #[error("invalid quantity: {0}")]
    InvalidQuantity(rust_decimal::Decimal),

    #[error("order not found: {0}")]
    OrderNotFound(Uuid),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Errors from the on-chain settlement client.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("symbol {0} has no configured token mapping")]
    UnknownToken(String),

    #[error("failed to read nonce from chain node: {0}")]
    NonceFetch(String),

    #[error("failed to sign settlement transaction: {0}")]
    Signing(String),

    #[error("chain node rejected transaction: {0}")]
    Submission(String),
}

/// Errors from the durable order store.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to decode stored order: {0}")]
    Decode(String),
}

/// Errors from the durable order queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed queue message: {0}")]
    MalformedMessage(String),
}

/// Errors from the market-data publisher.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}
