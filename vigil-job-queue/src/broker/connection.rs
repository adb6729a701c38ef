//! Reconnecting wrapper around one broker channel.
//!
//! Publishing and fetching reconnect on demand under the retry policy in
//! [`BrokerSettings`]. Settling a delivery never reconnects: a delivery
//! belongs to the channel that fetched it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{Broker, BrokerChannel, Delivery};
use crate::error::{BrokerError, JobQueueError};

pub const DEFAULT_QUEUE_NAME: &str = "vulnerability_analysis";
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Queue name and reconnection policy for a [`BrokerConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub queue: String,
    /// Total connection attempts before giving up (at least one is made).
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub retry_delay: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE_NAME.to_owned(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl BrokerSettings {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

type ChannelSlot = Option<Box<dyn BrokerChannel>>;

/// Owns one channel to the broker and its reconnection policy.
///
/// The connection is either disconnected (no channel) or connected. An I/O
/// error on any operation drops the channel; the next operation reconnects on
/// demand. There is no background reconnection.
pub struct BrokerConnection {
    broker: Arc<dyn Broker>,
    settings: BrokerSettings,
    channel: Mutex<ChannelSlot>,
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("broker", &self.broker.describe())
            .field("settings", &self.settings)
            .finish()
    }
}

impl BrokerConnection {
    pub fn new(broker: Arc<dyn Broker>, settings: BrokerSettings) -> Self {
        Self {
            broker,
            settings,
            channel: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn queue(&self) -> &str {
        &self.settings.queue
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    /// Open a channel and declare the work queue, retrying with a fixed delay.
    pub async fn connect(&self) -> Result<(), JobQueueError> {
        let mut slot = self.channel.lock().await;
        self.ensure_open(&mut slot).await.map(|_| ())
    }

    /// Publish one message with the persistence flag set.
    pub async fn publish(&self, body: &[u8]) -> Result<(), JobQueueError> {
        let mut slot = self.channel.lock().await;
        let channel = self.ensure_open(&mut slot).await?;
        match channel.publish(&self.settings.queue, body, true).await {
            Ok(()) => Ok(()),
            Err(err) => {
                Self::invalidate(&mut slot, &err).await;
                Err(JobQueueError::Publish(err.to_string()))
            }
        }
    }

    /// Take the next ready message, or `None` when the queue is empty.
    pub async fn next_delivery(&self) -> Result<Option<Delivery>, JobQueueError> {
        let mut slot = self.channel.lock().await;
        let channel = self.ensure_open(&mut slot).await?;
        match channel.fetch(&self.settings.queue).await {
            Ok(delivery) => Ok(delivery),
            Err(err) => {
                Self::invalidate(&mut slot, &err).await;
                Err(err.into())
            }
        }
    }

    /// Acknowledge a delivery. Fails if the channel that received it is gone.
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), JobQueueError> {
        let mut slot = self.channel.lock().await;
        let Some(channel) = slot.as_deref() else {
            return Err(BrokerError::ChannelClosed.into());
        };
        match channel.ack(delivery).await {
            Ok(()) => Ok(()),
            Err(err) => {
                Self::invalidate(&mut slot, &err).await;
                Err(err.into())
            }
        }
    }

    /// Reject a delivery, optionally asking the broker to redeliver it.
    pub async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), JobQueueError> {
        let mut slot = self.channel.lock().await;
        let Some(channel) = slot.as_deref() else {
            return Err(BrokerError::ChannelClosed.into());
        };
        match channel.nack(delivery, requeue).await {
            Ok(()) => Ok(()),
            Err(err) => {
                Self::invalidate(&mut slot, &err).await;
                Err(err.into())
            }
        }
    }

    /// Renew the lease on a delivery that is still being processed.
    pub async fn extend(&self, delivery: &Delivery) -> Result<(), JobQueueError> {
        let mut slot = self.channel.lock().await;
        let Some(channel) = slot.as_deref() else {
            return Err(BrokerError::ChannelClosed.into());
        };
        match channel.extend(delivery).await {
            Ok(()) => Ok(()),
            Err(err) => {
                Self::invalidate(&mut slot, &err).await;
                Err(err.into())
            }
        }
    }

    /// Passive depth query against the work queue.
    pub async fn queue_depth(&self) -> Result<u64, JobQueueError> {
        let mut slot = self.channel.lock().await;
        let channel = self.ensure_open(&mut slot).await?;
        match channel.queue_depth(&self.settings.queue).await {
            Ok(depth) => Ok(depth),
            Err(err) => {
                Self::invalidate(&mut slot, &err).await;
                Err(err.into())
            }
        }
    }

    /// Best-effort shutdown. Errors are logged, never returned.
    pub async fn close(&self) {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.take() {
            match channel.close().await {
                Ok(()) => debug!(queue = %self.settings.queue, "broker channel closed"),
                Err(err) => {
                    warn!(%err, queue = %self.settings.queue, "error while closing broker channel")
                }
            }
        }
    }

    async fn ensure_open<'a>(
        &self,
        slot: &'a mut MutexGuard<'_, ChannelSlot>,
    ) -> Result<&'a dyn BrokerChannel, JobQueueError> {
        if slot.is_none() {
            **slot = Some(self.open_with_retry().await?);
        }
        slot.as_deref().ok_or(JobQueueError::Broker(BrokerError::ChannelClosed))
    }

    async fn open_with_retry(&self) -> Result<Box<dyn BrokerChannel>, JobQueueError> {
        let attempts = self.settings.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.open_once().await {
                Ok(channel) => {
                    info!(
                        broker = %self.broker.describe(),
                        queue = %self.settings.queue,
                        attempt,
                        "connected to broker"
                    );
                    return Ok(channel);
                }
                Err(err) => {
                    warn!(
                        %err,
                        broker = %self.broker.describe(),
                        attempt,
                        max_attempts = attempts,
                        "broker connection attempt failed"
                    );
                    last_error = err.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        Err(JobQueueError::BrokerUnavailable {
            attempts,
            reason: last_error,
        })
    }

    async fn open_once(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let channel = self.broker.connect().await?;
        if let Err(err) = channel.declare_queue(&self.settings.queue).await {
            let _ = channel.close().await;
            return Err(err);
        }
        Ok(channel)
    }

    async fn invalidate(slot: &mut MutexGuard<'_, ChannelSlot>, cause: &BrokerError) {
        warn!(%cause, "broker channel failed; disconnecting");
        if let Some(channel) = slot.take() {
            if let Err(err) = channel.close().await {
                debug!(%err, "error while discarding failed broker channel");
            }
        }
    }
}
