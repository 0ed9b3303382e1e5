//! Market-data fan-out.
//!
//! Every book mutation (insert, fill, partial fill) is followed by a
//! best-effort broadcast of the top-of-book snapshot. Grounded in a
//! `cache::pubsub::Publisher` pattern, adapted to this worker's routing
//! key convention of `orderbook.<normalized-symbol>` (original_source's
//! `publish_order_book_update` used the same topic-exchange shape).

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::errors::PublishError;
use crate::matching::OrderbookSnapshot;

#[async_trait]
pub trait MarketDataPublisher: Send + Sync {
    async fn publish_snapshot(&self, snapshot: &OrderbookSnapshot) -> Result<(), PublishError>;
}

pub struct RedisMarketDataPublisher {
    client: redis::Client,
}

impl RedisMarketDataPublisher {
    pub fn new(redis_url: &str) -> Result<Self, PublishError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

/// `BTC/USDT` -> `orderbook.btcusdt`, matching the routing-key shape the
/// reference publisher derives from its symbol (`symbol.replace('/', '').lower()`).
pub fn channel_for_symbol(symbol: &str) -> String {
    format!("orderbook.{}", symbol.to_lowercase().replace('/', ""))
}

#[async_trait]
impl MarketDataPublisher for RedisMarketDataPublisher {
    async fn publish_snapshot(&self, snapshot: &OrderbookSnapshot) -> Result<(), PublishError> {
        let mut conn = self.client.get_async_connection().await?;
        let payload = serde_json::to_string(snapshot)?;
        let channel = channel_for_symbol(&snapshot.symbol);
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_normalizes_symbol() {
        assert_eq!(channel_for_symbol("BTC/USDT"), "orderbook.btcusdt");
    }
}
