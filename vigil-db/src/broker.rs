//! Durable work queue kept in the `broker_messages` table.
//!
//! Fetching a message leases it to the fetching channel until the lease
//! expires. Ack deletes the row; nack with requeue (or closing the channel)
//! clears the lease so another consumer can take it. A channel that vanishes
//! without closing loses its leases when the visibility timeout passes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;
use vigil_job_queue::{Broker, BrokerChannel, BrokerError, Delivery};

use crate::pool::DbPool;
use crate::utils::format_timestamp;

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

fn io(err: sqlx::Error) -> BrokerError {
    BrokerError::Io(err.to_string())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// [`Broker`] backed by the shared SQLite database.
#[derive(Debug, Clone)]
pub struct SqlBroker {
    pool: DbPool,
    visibility_timeout: Duration,
}

impl SqlBroker {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Startup recovery: transient messages do not survive a restart and
    /// every lease from the previous run is released. Returns the number of
    /// dropped messages.
    pub async fn recover(&self) -> Result<u64, BrokerError> {
        let dropped = sqlx::query("DELETE FROM broker_messages WHERE durable = 0")
            .execute(&self.pool)
            .await
            .map_err(io)?
            .rows_affected();
        let released = sqlx::query(
            "UPDATE broker_messages SET lease_token = NULL, leased_until = NULL \
             WHERE lease_token IS NOT NULL",
        )
        .execute(&self.pool)
        .await
        .map_err(io)?
        .rows_affected();

        info!(dropped, released, "broker queue recovered");
        Ok(dropped)
    }
}

#[async_trait]
impl Broker for SqlBroker {
    fn describe(&self) -> String {
        "sqlite".to_owned()
    }

    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        Ok(Box::new(SqlChannel {
            pool: self.pool.clone(),
            id: Uuid::new_v4(),
            next_lease: AtomicU64::new(0),
            open: AtomicBool::new(true),
            visibility_timeout: self.visibility_timeout,
        }))
    }
}

struct SqlChannel {
    pool: DbPool,
    id: Uuid,
    next_lease: AtomicU64,
    open: AtomicBool,
    visibility_timeout: Duration,
}

impl SqlChannel {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn lease_token(&self) -> String {
        let seq = self.next_lease.fetch_add(1, Ordering::SeqCst);
        format!("{}-{seq}", self.id)
    }

    fn lease_until(&self) -> i64 {
        let timeout = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        now_millis().saturating_add(timeout)
    }

    /// Delivery tags are `{row id}:{lease token}`.
    fn parse_tag(delivery: &Delivery) -> Result<(i64, &str), BrokerError> {
        delivery
            .tag
            .split_once(':')
            .and_then(|(id, token)| id.parse().ok().map(|id| (id, token)))
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.tag.clone()))
    }
}

#[async_trait]
impl BrokerChannel for SqlChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        sqlx::query(
            "INSERT INTO broker_queues (name, declared_at) VALUES (?, ?) \
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(queue)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(io)?;
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], durable: bool) -> Result<(), BrokerError> {
        self.check_open()?;
        sqlx::query(
            "INSERT INTO broker_messages (queue, body, durable, enqueued_at) VALUES (?, ?, ?, ?)",
        )
        .bind(queue)
        .bind(body)
        .bind(durable)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(io)?;
        Ok(())
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.check_open()?;
        let token = self.lease_token();
        let now = now_millis();

        // One statement, so two channels can never lease the same row.
        let leased: Option<(i64, Vec<u8>, i64)> = sqlx::query_as(
            r#"
            UPDATE broker_messages
            SET lease_token = ?, leased_until = ?, delivery_count = delivery_count + 1
            WHERE id = (
                SELECT id FROM broker_messages
                WHERE queue = ? AND (lease_token IS NULL OR leased_until < ?)
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, body, delivery_count
            "#,
        )
        .bind(&token)
        .bind(self.lease_until())
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(io)?;

        Ok(leased.map(|(id, body, delivery_count)| Delivery {
            tag: format!("{id}:{token}"),
            body,
            redelivered: delivery_count > 1,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.check_open()?;
        let (id, token) = Self::parse_tag(delivery)?;
        let deleted = sqlx::query("DELETE FROM broker_messages WHERE id = ? AND lease_token = ?")
            .bind(id)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(io)?
            .rows_affected();

        if deleted == 0 {
            // The lease expired and the message went to someone else.
            return Err(BrokerError::UnknownDelivery(delivery.tag.clone()));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.check_open()?;
        let (id, token) = Self::parse_tag(delivery)?;
        let sql = if requeue {
            "UPDATE broker_messages SET lease_token = NULL, leased_until = NULL \
             WHERE id = ? AND lease_token = ?"
        } else {
            "DELETE FROM broker_messages WHERE id = ? AND lease_token = ?"
        };
        let affected = sqlx::query(sql)
            .bind(id)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(io)?
            .rows_affected();

        if affected == 0 {
            return Err(BrokerError::UnknownDelivery(delivery.tag.clone()));
        }
        Ok(())
    }

    async fn extend(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.check_open()?;
        let (id, token) = Self::parse_tag(delivery)?;
        let affected = sqlx::query(
            "UPDATE broker_messages SET leased_until = ? WHERE id = ? AND lease_token = ?",
        )
        .bind(self.lease_until())
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(io)?
        .rows_affected();

        if affected == 0 {
            return Err(BrokerError::UnknownDelivery(delivery.tag.clone()));
        }
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        self.check_open()?;
        let (depth,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM broker_messages \
             WHERE queue = ? AND (lease_token IS NULL OR leased_until < ?)",
        )
        .bind(queue)
        .bind(now_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(io)?;
        Ok(u64::try_from(depth).unwrap_or_default())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let released = sqlx::query(
            "UPDATE broker_messages SET lease_token = NULL, leased_until = NULL \
             WHERE lease_token LIKE ?",
        )
        .bind(format!("{}-%", self.id))
        .execute(&self.pool)
        .await
        .map_err(io)?
        .rows_affected();

        if released > 0 {
            debug!(channel = %self.id, released, "returned unacknowledged messages to the queue");
        }
        Ok(())
    }
}
