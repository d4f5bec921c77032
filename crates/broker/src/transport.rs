//! Trait seam between broker topology logic and the broker client.
//!
//! The registry, publisher, and consumer only speak these traits; the
//! concrete client lives in [`crate::transport_amqp`] and the in-memory
//! double used by tests in [`crate::transport_memory`].

use {async_trait::async_trait, serde::Serialize};

use crate::error::Result;

/// One message pulled from a queue, pending acknowledgement.
#[derive(Debug)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
}

/// Live counters for one queue.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub messages: u32,
    pub consumers: u32,
}

/// Connection-owning broker client.
///
/// Operations other than [`Transport::ensure_open`] and
/// [`Transport::close`] assume the link was just validated by the caller
/// and fail fast; retry policy lives in callers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Validate the connection/channel pair, reconnecting with the
    /// last-known configuration if either side is closed. Returns `false`
    /// when reconnection also fails.
    async fn ensure_open(&self) -> bool;

    /// Passive existence check; must not disturb the queue.
    async fn queue_exists(&self, queue: &str) -> Result<bool>;

    /// Declare `queue` durable with the standard message TTL and bind it
    /// to the agent exchange under `routing_key`. Idempotent.
    async fn declare_and_bind(&self, queue: &str, routing_key: &str) -> Result<()>;

    /// Publish `body` to `routing_key` with persistent delivery.
    async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Live depth and consumer count for `queue`.
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats>;

    /// Open a dedicated consumer session on `queue` with prefetch 1.
    async fn open_consumer(&self, queue: &str) -> Result<Box<dyn ConsumerSession>>;

    /// Release the connection. Never raises; failures are logged.
    async fn close(&self);
}

/// A single consumer's view of one queue.
///
/// Acknowledgements go through the session that produced the delivery so
/// they land on the same channel.
#[async_trait]
pub trait ConsumerSession: Send {
    /// Wait for the next delivery. `Ok(None)` means the delivery stream
    /// ended, which consumers treat as connection loss.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>>;

    async fn ack(&mut self, tag: u64) -> Result<()>;

    /// Negative acknowledgement, message goes back on the queue.
    async fn nack_requeue(&mut self, tag: u64) -> Result<()>;

    /// Negative acknowledgement without requeue, message is dropped.
    async fn nack_discard(&mut self, tag: u64) -> Result<()>;

    /// Stop the server pushing further deliveries. Best-effort.
    async fn cancel(&mut self);
}
