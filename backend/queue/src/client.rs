//! Queue client: bounded connection attempts, typed publish, and the
//! prefetch-1 consume loop every worker runs.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use equaforge_core::{Disposition, ForgeError, QueueMessage};

use crate::broker::{Broker, Delivery, QueueDepth};
use crate::retry::RetryPolicy;
use crate::sqlite::SqliteBroker;

/// Handles one decoded message and says how to settle its delivery.
#[async_trait]
pub trait MessageHandler<M: QueueMessage>: Send + Sync {
    async fn handle(&self, message: M) -> Result<Disposition, ForgeError>;
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// How long an idle consumer waits before polling again.
    pub poll_interval: Duration,
    /// Deliveries beyond this many redeliveries go to the dead-letter queue.
    /// Zero disables the cap.
    pub max_redeliveries: u32,
    /// Pause after a requeue, keyed by the delivery count.
    pub requeue_backoff: RetryPolicy,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_redeliveries: 0,
            requeue_backoff: RetryPolicy {
                max_attempts: u32::MAX,
                base_delay_ms: 200,
                backoff_factor: 2.0,
                max_delay_ms: 10_000,
                jitter: true,
            },
        }
    }
}

/// Counters reported when a consume loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    /// Deliveries whose lease expired before they could be settled.
    pub lost: u64,
}

pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}.dead-letter")
}

#[derive(Clone)]
pub struct QueueClient {
    broker: Arc<dyn Broker>,
    consumer_tag: String,
    options: ConsumeOptions,
}

impl QueueClient {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            consumer_tag: format!("consumer-{}", uuid::Uuid::new_v4()),
            options: ConsumeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ConsumeOptions) -> Self {
        self.options = options;
        self
    }

    /// Try `open` until it yields a broker. Exhausting `retry` is
    /// [`ForgeError::BrokerUnavailable`].
    pub async fn connect_with<F, Fut>(retry: &RetryPolicy, mut open: F) -> Result<Self, ForgeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<Arc<dyn Broker>>>,
    {
        let broker = retry
            .run("broker connect", || open())
            .await
            .map_err(|e| {
                ForgeError::BrokerUnavailable(format!(
                    "gave up after {} attempts: {e:#}",
                    retry.max_attempts
                ))
            })?;
        Ok(Self::new(broker))
    }

    /// Open the SQLite broker file at `path`.
    pub async fn connect(
        path: &Path,
        visibility_timeout: Duration,
        retry: &RetryPolicy,
    ) -> Result<Self, ForgeError> {
        let client = Self::connect_with(retry, || async {
            let broker: Arc<dyn Broker> = Arc::new(SqliteBroker::open(path, visibility_timeout)?);
            Ok(broker)
        })
        .await?;
        info!(path = ?path, consumer = %client.consumer_tag, "Connected to broker");
        Ok(client)
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub async fn declare_durable(&self, queue: &str) -> Result<(), ForgeError> {
        self.broker.declare_durable(queue).await
    }

    /// Publish a persistent message.
    pub async fn publish<M: QueueMessage>(&self, queue: &str, message: &M) -> Result<(), ForgeError> {
        let payload = message.encode()?;
        self.broker.publish(queue, &payload).await
    }

    pub async fn depth(&self, queue: &str) -> Result<QueueDepth, ForgeError> {
        self.broker.depth(queue).await
    }

    /// Consume `queue` one message at a time until `shutdown` flips to true
    /// or its sender is dropped. A message already being handled is settled
    /// before the loop exits.
    pub async fn consume<M, H>(
        &self,
        queue: &str,
        handler: &H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumeStats, ForgeError>
    where
        M: QueueMessage,
        H: MessageHandler<M> + ?Sized,
    {
        self.broker.declare_durable(queue).await?;
        let dead_letter = dead_letter_queue(queue);
        if self.options.max_redeliveries > 0 {
            self.broker.declare_durable(&dead_letter).await?;
        }
        info!(queue, consumer = %self.consumer_tag, "Consumer started");

        let mut stats = ConsumeStats::default();
        while !*shutdown.borrow() {
            let delivery = match self.broker.fetch(queue, &self.consumer_tag).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = self.broker.wait_for_publish(queue, self.options.poll_interval) => {}
                    }
                    if shutdown.has_changed().is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(queue, error = %e, "Fetch failed");
                    if pause(&mut shutdown, self.options.poll_interval).await {
                        break;
                    }
                    continue;
                }
            };

            if self.exceeds_redelivery_cap(&delivery) {
                warn!(
                    queue,
                    tag = delivery.tag,
                    deliveries = delivery.delivery_count,
                    "Redelivery cap reached, dead-lettering message"
                );
                self.broker.publish(&dead_letter, &delivery.payload).await?;
                self.broker.ack(&delivery).await?;
                stats.dead_lettered += 1;
                continue;
            }

            match self.dispatch_renewing::<M, H>(&delivery, handler).await {
                Disposition::Ack => {
                    if self.broker.ack(&delivery).await? {
                        stats.acked += 1;
                    } else {
                        stats.lost += 1;
                    }
                }
                Disposition::Requeue => {
                    if self.broker.nack(&delivery, true).await? {
                        stats.requeued += 1;
                    } else {
                        stats.lost += 1;
                    }
                    let backoff = self
                        .options
                        .requeue_backoff
                        .delay_for(delivery.delivery_count);
                    if pause(&mut shutdown, backoff).await {
                        break;
                    }
                }
            }
        }

        match self.broker.release_consumer(&self.consumer_tag).await {
            Ok(0) => {}
            Ok(n) => debug!(queue, released = n, "Released leases on shutdown"),
            Err(e) => warn!(queue, error = %e, "Failed to release leases on shutdown"),
        }
        info!(
            queue,
            acked = stats.acked,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            lost = stats.lost,
            "Consumer stopped"
        );
        Ok(stats)
    }

    fn exceeds_redelivery_cap(&self, delivery: &Delivery) -> bool {
        let cap = self.options.max_redeliveries;
        cap > 0 && delivery.delivery_count > cap.saturating_add(1)
    }

    /// Run the handler while extending the lease every third of the broker's
    /// lease timeout, so a slow handler keeps its message to itself.
    async fn dispatch_renewing<M, H>(&self, delivery: &Delivery, handler: &H) -> Disposition
    where
        M: QueueMessage,
        H: MessageHandler<M> + ?Sized,
    {
        let every = self.broker.lease_timeout() / 3;
        let work = self.dispatch::<M, H>(delivery, handler);
        if every.is_zero() {
            return work.await;
        }
        tokio::pin!(work);
        let mut renewals = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        renewals.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                disposition = &mut work => return disposition,
                _ = renewals.tick() => match self.broker.extend_lease(delivery).await {
                    Ok(true) => debug!(queue = %delivery.queue, tag = delivery.tag, "Lease extended"),
                    Ok(false) => warn!(
                        queue = %delivery.queue,
                        tag = delivery.tag,
                        "Lease lost while handling, message may be delivered again"
                    ),
                    Err(e) => warn!(queue = %delivery.queue, tag = delivery.tag, error = %e, "Lease extension failed"),
                },
            }
        }
    }

    async fn dispatch<M, H>(&self, delivery: &Delivery, handler: &H) -> Disposition
    where
        M: QueueMessage,
        H: MessageHandler<M> + ?Sized,
    {
        let outcome = match M::decode(&delivery.payload) {
            Ok(message) => handler.handle(message).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(disposition) => disposition,
            Err(e) => {
                let disposition = e.disposition();
                match disposition {
                    Disposition::Ack => warn!(
                        queue = %delivery.queue,
                        tag = delivery.tag,
                        error = %e,
                        "Dropping message that cannot succeed"
                    ),
                    Disposition::Requeue => error!(
                        queue = %delivery.queue,
                        tag = delivery.tag,
                        redelivered = delivery.redelivered(),
                        error = %e,
                        "Handler failed, requeueing"
                    ),
                }
                disposition
            }
        }
    }
}

/// Sleep for `duration` unless shutdown arrives first. Returns true on shutdown.
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(duration) => false,
    }
}
