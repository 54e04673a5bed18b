use std::time::Duration;

use async_trait::async_trait;

use equaforge_core::ForgeError;

/// One leased message. Stays invisible to other consumers until acked,
/// nacked, or its lease expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: i64,
    pub queue: String,
    /// Consumer holding the lease; only it can settle or extend it.
    pub consumer: String,
    pub payload: Vec<u8>,
    /// How many times this message has been handed out, this one included.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: usize,
    pub unacked: usize,
}

/// Durable point-to-point message broker with at-least-once delivery.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the queue if it does not exist. Idempotent.
    async fn declare_durable(&self, queue: &str) -> Result<(), ForgeError>;

    /// Persist a message on a declared queue.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), ForgeError>;

    /// Lease the oldest ready message, if any. Never blocks.
    async fn fetch(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>, ForgeError>;

    /// Remove the message. Returns false if the lease was no longer held by
    /// the delivery's consumer, in which case nothing changes.
    async fn ack(&self, delivery: &Delivery) -> Result<bool, ForgeError>;

    /// Release a lease. With `requeue` the message becomes ready again,
    /// otherwise it is discarded. Returns false for a lease no longer held.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<bool, ForgeError>;

    /// Restart the lease clock. Returns false if the lease was lost.
    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, ForgeError>;

    /// How long an unrenewed lease lasts before the message is redelivered.
    fn lease_timeout(&self) -> Duration;

    async fn depth(&self, queue: &str) -> Result<QueueDepth, ForgeError>;

    /// Sleep until something may have been published to `queue`, or `max` elapses.
    async fn wait_for_publish(&self, queue: &str, max: Duration);

    /// Return every lease held by `consumer` to the ready state.
    async fn release_consumer(&self, consumer: &str) -> Result<usize, ForgeError>;
}
