//! Durable order intake.
//!
//! The source system consumes a RabbitMQ topic queue (`order_processing_queue`,
//! bound to `orders_exchange` on routing key `order.new`); with no AMQP
//! client available, durable, acknowledged delivery is modeled on a Redis
//! Stream consumer group instead — the closest primitive available for
//! "at-least-once, ack after processing".

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::streams::{StreamReadOptions, StreamReadReply};

use crate::errors::QueueError;
use crate::models::IncomingOrder;

/// Opaque handle identifying one delivered message, needed to ack it.
#[derive(Debug, Clone)]
pub struct AckHandle {
    pub message_id: String,
}

#[derive(Debug, Clone)]
pub struct QueuedOrder {
    pub order: IncomingOrder,
    pub handle: AckHandle,
}

#[async_trait]
pub trait OrderQueue: Send {
    /// Block until the next order is available. Returns `None` only if
    /// the queue has been closed out from under the worker.
    async fn next(&mut self) -> Result<Option<QueuedOrder>, QueueError>;

    /// Acknowledge a message, removing it from the consumer group's
    /// pending-entries list. Must only be called after the order has
    /// been fully matched, settled, and persisted.
    async fn ack(&mut self, handle: AckHandle) -> Result<(), QueueError>;
}

const STREAM_KEY: &str = "order_processing_queue";

pub struct RedisStreamQueue {
    conn: redis::aio::Connection,
    group: String,
    consumer: String,
}

impl RedisStreamQueue {
    pub async fn connect(redis_url: &str, group: &str, consumer: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_async_connection().await?;

        // XGROUP CREATE is idempotent in practice: BUSYGROUP just means
        // a previous worker already set the group up.
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(STREAM_KEY, group, "0")
            .await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(e.into());
            }
        }

        Ok(Self {
            conn,
            group: group.to_string(),
            consumer: consumer.to_string(),
        })
    }
}

#[async_trait]
impl OrderQueue for RedisStreamQueue {
    async fn next(&mut self) -> Result<Option<QueuedOrder>, QueueError> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
            .block(5_000);

        let reply: StreamReadReply = self
            .conn
            .xread_options(&[STREAM_KEY], &[">"], &opts)
            .await?;

        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let payload: String = entry
                    .map
                    .get("payload")
                    .and_then(|v| match v {
                        redis::Value::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
                        _ => None,
                    })
                    .ok_or_else(|| QueueError::MalformedMessage(format!("entry {} has no payload field", entry.id)))?;

                let order: IncomingOrder = serde_json::from_str(&payload)
                    .map_err(|e| QueueError::MalformedMessage(e.to_string()))?;

                return Ok(Some(QueuedOrder {
                    order,
                    handle: AckHandle { message_id: entry.id },
                }));
            }
        }

        Ok(None)
    }

    async fn ack(&mut self, handle: AckHandle) -> Result<(), QueueError> {
        let _: i64 = self
            .conn
            .xack(STREAM_KEY, &self.group, &[handle.message_id])
            .await?;
        Ok(())
    }
}
