//! Broker contract: durable work queues with per-message acknowledgement.
//!
//! A [`Broker`] opens [`BrokerChannel`]s. A delivery fetched on a channel is
//! owned by that channel until it is acked or nacked; if the channel goes away
//! first the broker hands the message to another consumer. That ownership is
//! the only mutual exclusion the queue relies on.

mod connection;
mod memory;

use async_trait::async_trait;

use crate::error::BrokerError;

pub use connection::{
    BrokerConnection, BrokerSettings, DEFAULT_MAX_RETRIES, DEFAULT_QUEUE_NAME, DEFAULT_RETRY_DELAY,
};
pub use memory::InMemoryBroker;

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Opaque tag identifying this delivery on the channel that fetched it.
    pub tag: String,
    pub body: Vec<u8>,
    /// Set when the message was delivered before and not acknowledged.
    pub redelivered: bool,
}

/// Connection factory for a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Human-readable location used in logs.
    fn describe(&self) -> String;

    /// Open a new channel.
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;
}

/// One logical channel on a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable queue; idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, body: &[u8], durable: bool) -> Result<(), BrokerError>;

    /// Take the next ready message, if any, without blocking.
    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    /// Keep an unsettled delivery owned by this channel. Brokers that hold
    /// deliveries until the channel closes have nothing to do.
    async fn extend(&self, _delivery: &Delivery) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Number of ready messages. Passive: never consumes anything.
    async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError>;

    /// Close the channel; unacknowledged deliveries become ready again.
    async fn close(&self) -> Result<(), BrokerError>;
}
