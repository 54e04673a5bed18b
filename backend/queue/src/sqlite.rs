//! Broker persisted in a SQLite file.
//!
//! Several processes may share one broker file; WAL mode plus immediate
//! transactions serialize leases across them. Publishers in the same process
//! wake idle consumers directly, other processes are picked up by polling.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use equaforge_core::ForgeError;

use crate::broker::{Broker, Delivery, QueueDepth};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS queues (
        name        TEXT PRIMARY KEY,
        created_at  INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS messages (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        queue           TEXT NOT NULL REFERENCES queues(name),
        payload         BLOB NOT NULL,
        state           TEXT NOT NULL DEFAULT 'ready',
        consumer        TEXT,
        delivery_count  INTEGER NOT NULL DEFAULT 0,
        published_at    INTEGER NOT NULL,
        leased_at       INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_messages_ready ON messages(queue, state, seq);";

fn unavailable(err: impl std::fmt::Display) -> ForgeError {
    ForgeError::BrokerUnavailable(err.to_string())
}

pub struct SqliteBroker {
    conn: Mutex<Connection>,
    published: Notify,
    visibility_timeout: Duration,
}

impl SqliteBroker {
    pub fn open(path: impl AsRef<Path>, visibility_timeout: Duration) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open broker {:?}", path.as_ref()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize broker schema")?;
        info!(path = ?path.as_ref(), "Broker opened");
        Ok(Self::with_connection(conn, visibility_timeout))
    }

    /// In-memory broker (for tests and single-process runs).
    pub fn in_memory(visibility_timeout: Duration) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::with_connection(conn, visibility_timeout))
    }

    fn with_connection(conn: Connection, visibility_timeout: Duration) -> Self {
        Self {
            conn: Mutex::new(conn),
            published: Notify::new(),
            visibility_timeout,
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn declare_durable(&self, queue: &str) -> Result<(), ForgeError> {
        let conn = self.conn.lock().await;
        let created = conn
            .execute(
                "INSERT OR IGNORE INTO queues (name, created_at) VALUES (?1, ?2)",
                params![queue, Self::now_ms()],
            )
            .map_err(unavailable)?;
        if created > 0 {
            info!(queue, "Declared durable queue");
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), ForgeError> {
        {
            let conn = self.conn.lock().await;
            let declared: Option<String> = conn
                .query_row(
                    "SELECT name FROM queues WHERE name = ?1",
                    params![queue],
                    |row| row.get(0),
                )
                .optional()
                .map_err(unavailable)?;
            if declared.is_none() {
                return Err(unavailable(format!("queue '{queue}' is not declared")));
            }
            conn.execute(
                "INSERT INTO messages (queue, payload, published_at) VALUES (?1, ?2, ?3)",
                params![queue, payload, Self::now_ms()],
            )
            .map_err(unavailable)?;
        }
        debug!(queue, bytes = payload.len(), "Published message");
        self.published.notify_waiters();
        Ok(())
    }

    async fn fetch(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>, ForgeError> {
        let now = Self::now_ms();
        let expired_before = now - self.visibility_timeout.as_millis() as i64;

        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;

        let expired = tx
            .execute(
                "UPDATE messages SET state = 'ready', consumer = NULL, leased_at = NULL
                 WHERE queue = ?1 AND state = 'unacked' AND leased_at < ?2",
                params![queue, expired_before],
            )
            .map_err(unavailable)?;
        if expired > 0 {
            warn!(queue, count = expired, "Leases expired, messages returned to queue");
        }

        let next: Option<(i64, Vec<u8>, u32)> = tx
            .query_row(
                "SELECT seq, payload, delivery_count FROM messages
                 WHERE queue = ?1 AND state = 'ready' ORDER BY seq ASC LIMIT 1",
                params![queue],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(unavailable)?;

        let Some((tag, payload, previous)) = next else {
            tx.commit().map_err(unavailable)?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE messages SET state = 'unacked', consumer = ?2,
                    delivery_count = delivery_count + 1, leased_at = ?3
             WHERE seq = ?1",
            params![tag, consumer, now],
        )
        .map_err(unavailable)?;
        tx.commit().map_err(unavailable)?;

        Ok(Some(Delivery {
            tag,
            queue: queue.to_string(),
            consumer: consumer.to_string(),
            payload,
            delivery_count: previous + 1,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, ForgeError> {
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM messages WHERE seq = ?1 AND consumer = ?2 AND state = 'unacked'",
                params![delivery.tag, delivery.consumer],
            )
            .map_err(unavailable)?;
        if removed == 0 {
            warn!(
                queue = %delivery.queue,
                tag = delivery.tag,
                consumer = %delivery.consumer,
                "Ack for a lease that is no longer held"
            );
        }
        Ok(removed > 0)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<bool, ForgeError> {
        let released = {
            let conn = self.conn.lock().await;
            let sql = if requeue {
                "UPDATE messages SET state = 'ready', consumer = NULL, leased_at = NULL
                 WHERE seq = ?1 AND consumer = ?2 AND state = 'unacked'"
            } else {
                "DELETE FROM messages WHERE seq = ?1 AND consumer = ?2 AND state = 'unacked'"
            };
            conn.execute(sql, params![delivery.tag, delivery.consumer])
                .map_err(unavailable)?
        };
        if released == 0 {
            warn!(
                queue = %delivery.queue,
                tag = delivery.tag,
                consumer = %delivery.consumer,
                "Nack for a lease that is no longer held"
            );
        } else if requeue {
            self.published.notify_waiters();
        }
        Ok(released > 0)
    }

    async fn extend_lease(&self, delivery: &Delivery) -> Result<bool, ForgeError> {
        let conn = self.conn.lock().await;
        let extended = conn
            .execute(
                "UPDATE messages SET leased_at = ?3
                 WHERE seq = ?1 AND consumer = ?2 AND state = 'unacked'",
                params![delivery.tag, delivery.consumer, Self::now_ms()],
            )
            .map_err(unavailable)?;
        Ok(extended > 0)
    }

    fn lease_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth, ForgeError> {
        let conn = self.conn.lock().await;
        let (ready, unacked): (i64, i64) = conn
            .query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN state = 'ready' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state = 'unacked' THEN 1 ELSE 0 END), 0)
                 FROM messages WHERE queue = ?1",
                params![queue],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(unavailable)?;
        Ok(QueueDepth {
            ready: ready as usize,
            unacked: unacked as usize,
        })
    }

    async fn wait_for_publish(&self, _queue: &str, max: Duration) {
        let _ = tokio::time::timeout(max, self.published.notified()).await;
    }

    async fn release_consumer(&self, consumer: &str) -> Result<usize, ForgeError> {
        let released = {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE messages SET state = 'ready', consumer = NULL, leased_at = NULL
                 WHERE consumer = ?1 AND state = 'unacked'",
                params![consumer],
            )
            .map_err(unavailable)?
        };
        if released > 0 {
            self.published.notify_waiters();
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> SqliteBroker {
        SqliteBroker::in_memory(Duration::from_secs(60)).unwrap()
    }

    #[tokio::test]
    async fn publish_requires_declared_queue() {
        let broker = broker();
        let err = broker.publish("nowhere", b"x").await.unwrap_err();
        assert!(matches!(err, ForgeError::BrokerUnavailable(_)));

        broker.declare_durable("q").await.unwrap();
        broker.declare_durable("q").await.unwrap();
        broker.publish("q", b"x").await.unwrap();
        assert_eq!(broker.depth("q").await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn fifo_lease_and_ack() {
        let broker = broker();
        broker.declare_durable("q").await.unwrap();
        broker.publish("q", b"first").await.unwrap();
        broker.publish("q", b"second").await.unwrap();

        let first = broker.fetch("q", "c1").await.unwrap().unwrap();
        assert_eq!(first.payload, b"first");
        assert!(!first.redelivered());

        let second = broker.fetch("q", "c2").await.unwrap().unwrap();
        assert_eq!(second.payload, b"second");
        assert!(broker.fetch("q", "c3").await.unwrap().is_none());

        assert_eq!(
            broker.depth("q").await.unwrap(),
            QueueDepth { ready: 0, unacked: 2 }
        );
        broker.ack(&first).await.unwrap();
        broker.ack(&second).await.unwrap();
        assert_eq!(broker.depth("q").await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn requeue_redelivers_with_count() {
        let broker = broker();
        broker.declare_durable("q").await.unwrap();
        broker.publish("q", b"m").await.unwrap();

        let d = broker.fetch("q", "c").await.unwrap().unwrap();
        broker.nack(&d, true).await.unwrap();
        let again = broker.fetch("q", "c").await.unwrap().unwrap();
        assert_eq!(again.tag, d.tag);
        assert_eq!(again.delivery_count, 2);
        assert!(again.redelivered());

        broker.nack(&again, false).await.unwrap();
        assert!(broker.fetch("q", "c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_leases_are_redelivered() {
        let broker = SqliteBroker::in_memory(Duration::ZERO).unwrap();
        broker.declare_durable("q").await.unwrap();
        broker.publish("q", b"m").await.unwrap();

        let d = broker.fetch("q", "crashed").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let again = broker.fetch("q", "other").await.unwrap().unwrap();
        assert_eq!(again.tag, d.tag);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn stale_consumer_cannot_settle_a_new_lease() {
        let broker = SqliteBroker::in_memory(Duration::ZERO).unwrap();
        broker.declare_durable("q").await.unwrap();
        broker.publish("q", b"m").await.unwrap();

        let slow = broker.fetch("q", "slow-consumer").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let current = broker.fetch("q", "second-consumer").await.unwrap().unwrap();
        assert_eq!(current.tag, slow.tag);

        assert!(!broker.ack(&slow).await.unwrap());
        assert!(!broker.nack(&slow, true).await.unwrap());
        assert!(!broker.extend_lease(&slow).await.unwrap());
        assert_eq!(
            broker.depth("q").await.unwrap(),
            QueueDepth { ready: 0, unacked: 1 }
        );

        assert!(broker.ack(&current).await.unwrap());
        assert_eq!(broker.depth("q").await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn extended_lease_is_not_redelivered() {
        let broker = SqliteBroker::in_memory(Duration::from_millis(200)).unwrap();
        broker.declare_durable("q").await.unwrap();
        broker.publish("q", b"m").await.unwrap();

        let held = broker.fetch("q", "worker").await.unwrap().unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(broker.extend_lease(&held).await.unwrap());
        }
        assert!(broker.fetch("q", "other").await.unwrap().is_none());
        assert!(broker.ack(&held).await.unwrap());
    }

    #[tokio::test]
    async fn release_consumer_returns_leases() {
        let broker = broker();
        broker.declare_durable("q").await.unwrap();
        broker.publish("q", b"m").await.unwrap();
        broker.fetch("q", "gone").await.unwrap().unwrap();

        assert_eq!(broker.release_consumer("gone").await.unwrap(), 1);
        assert_eq!(broker.depth("q").await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn messages_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.db");
        {
            let broker = SqliteBroker::open(&path, Duration::from_secs(60)).unwrap();
            broker.declare_durable("q").await.unwrap();
            broker.publish("q", b"durable").await.unwrap();
        }
        let broker = SqliteBroker::open(&path, Duration::from_secs(60)).unwrap();
        let d = broker.fetch("q", "c").await.unwrap().unwrap();
        assert_eq!(d.payload, b"durable");
    }
}
