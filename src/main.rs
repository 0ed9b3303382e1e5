use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod engine;
mod errors;
mod market_data;
mod matching;
mod models;
mod persistence;
mod queue;
mod settlement;

use crate::config::AppConfig;
use crate::engine::MatchingEngine;
use crate::market_data::RedisMarketDataPublisher;
use crate::persistence::PostgresOrderStore;
use crate::queue::{OrderQueue, RedisStreamQueue};
use crate::settlement::SettlementClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "settlement_matching_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load()?;
    tracing::info!("starting matching worker v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(pairs = ?config.trading_pairs, "configured trading pairs");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    tracing::info!("database connected");

    let store = Arc::new(PostgresOrderStore::new(pool));
    let settlement = Arc::new(SettlementClient::connect(&config).await?);
    tracing::info!(rpc = %config.rpc_url, "settlement client connected");

    let publisher = Arc::new(RedisMarketDataPublisher::new(&config.redis_url)?);

    let engine = Arc::new(MatchingEngine::new(store, settlement, publisher, config.clone()));

    match engine.recover().await {
        Ok(()) => tracing::info!("recovered open orders from the store"),
        Err(e) => {
            tracing::error!(error = %e, "failed to recover open orders, starting with empty books");
        }
    }

    let mut queue = RedisStreamQueue::connect(&config.redis_url, &config.consumer_group, &config.consumer_name).await?;
    tracing::info!(group = %config.consumer_group, consumer = %config.consumer_name, "listening for orders");

    loop {
        let queued = match queue.next().await {
            Ok(Some(q)) => q,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(error = %e, "failed to read from order queue, retrying");
                continue;
            }
        };

        let message_id = queued.handle.message_id.clone();
        match engine.process_order(queued.order, &message_id).await {
            Ok(outcome) => {
                tracing::info!(
                    message_id = %message_id,
                    fills = outcome.fills.len(),
                    remaining = %outcome.remaining_quantity,
                    "order processed"
                );
                if let Err(e) = queue.ack(queued.handle).await {
                    tracing::error!(error = %e, message_id = %message_id, "failed to ack processed message");
                }
            }
            Err(e) => {
                // Validation failures (unknown symbol, bad quantity, market
                // orders) are not transient: redelivering the same message
                // will fail again, so it is acked and dropped rather than
                // retried forever, so it is logged and discarded.
                tracing::error!(error = %e, message_id = %message_id, "order rejected, dropping");
                if let Err(ack_err) = queue.ack(queued.handle).await {
                    tracing::error!(error = %ack_err, message_id = %message_id, "failed to ack rejected message");
                }
            }
        }
    }
}
