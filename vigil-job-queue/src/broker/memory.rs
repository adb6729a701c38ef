//! In-process broker.
//!
//! Unacked deliveries go back to the front of their queue when the owning
//! channel closes. Fault injection hooks let tests simulate an unreachable
//! broker or a refused publish.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Broker, BrokerChannel, Delivery};
use crate::error::BrokerError;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    durable: bool,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    /// delivery tag -> (owning channel, message)
    unacked: HashMap<String, (u64, StoredMessage)>,
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, QueueState>>,
    next_channel: AtomicU64,
    next_tag: AtomicU64,
    connect_attempts: AtomicU32,
    fail_connects: AtomicU32,
    fail_publishes: AtomicU32,
    published: AtomicU64,
}

impl BrokerState {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Consume one unit of an injected failure budget.
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Return every delivery owned by `channel` to the front of its queue.
    fn release_channel(&self, channel: u64) {
        let mut queues = self.queues();
        for queue in queues.values_mut() {
            let tags: Vec<String> = queue
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == channel)
                .map(|(tag, _)| tag.clone())
                .collect();
            for tag in tags {
                if let Some((_, mut message)) = queue.unacked.remove(&tag) {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }
    }
}

/// Process-local broker with AMQP-like delivery semantics.
///
/// Used by tests and single-node development. Messages unacknowledged when
/// their channel closes (or is dropped) are redelivered. Failure injection
/// helpers simulate an unreachable broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("published", &self.published_count())
            .finish()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` publishes fail with an I/O error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.state.fail_publishes.store(n, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Messages accepted since creation.
    pub fn published_count(&self) -> u64 {
        self.state.published.load(Ordering::SeqCst)
    }

    /// Ready messages in `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        self.state.queues().get(queue).map_or(0, |q| q.ready.len())
    }

    /// Delivered but not yet acknowledged messages in `queue`.
    pub fn unacked(&self, queue: &str) -> usize {
        self.state.queues().get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Put a raw body on a queue, bypassing any channel.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.state
            .queues()
            .entry(queue.to_owned())
            .or_default()
            .ready
            .push_back(StoredMessage {
                body: body.into(),
                durable: true,
                redelivered: false,
            });
    }

    /// Simulate a broker restart: transient messages are lost, in-flight
    /// deliveries become ready again.
    pub fn restart(&self) {
        let mut queues = self.state.queues();
        for queue in queues.values_mut() {
            let inflight: Vec<StoredMessage> = queue
                .unacked
                .drain()
                .map(|(_, (_, mut message))| {
                    message.redelivered = true;
                    message
                })
                .collect();
            queue.ready.extend(inflight);
            queue.ready.retain(|m| m.durable);
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn describe(&self) -> String {
        "memory://".to_owned()
    }

    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if BrokerState::take_failure(&self.state.fail_connects) {
            return Err(BrokerError::Connect("connection refused".to_owned()));
        }
        let id = self.state.next_channel.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryChannel {
            state: Arc::clone(&self.state),
            id,
            open: AtomicBool::new(true),
        }))
    }
}

struct InMemoryChannel {
    state: Arc<BrokerState>,
    id: u64,
    open: AtomicBool,
}

impl InMemoryChannel {
    fn check_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.state.release_channel(self.id);
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        self.state.queues().entry(queue.to_owned()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], durable: bool) -> Result<(), BrokerError> {
        self.check_open()?;
        if BrokerState::take_failure(&self.state.fail_publishes) {
            return Err(BrokerError::Io("connection reset by peer".to_owned()));
        }
        self.state
            .queues()
            .entry(queue.to_owned())
            .or_default()
            .ready
            .push_back(StoredMessage {
                body: body.to_vec(),
                durable,
                redelivered: false,
            });
        self.state.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.check_open()?;
        let mut queues = self.state.queues();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some(message) = state.ready.pop_front() else {
            return Ok(None);
        };
        let tag = self.state.next_tag.fetch_add(1, Ordering::SeqCst).to_string();
        let delivery = Delivery {
            tag: tag.clone(),
            body: message.body.clone(),
            redelivered: message.redelivered,
        };
        state.unacked.insert(tag, (self.id, message));
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut queues = self.state.queues();
        for state in queues.values_mut() {
            if matches!(state.unacked.get(&delivery.tag), Some((owner, _)) if *owner == self.id) {
                state.unacked.remove(&delivery.tag);
                return Ok(());
            }
        }
        Err(BrokerError::UnknownDelivery(delivery.tag.clone()))
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut queues = self.state.queues();
        for state in queues.values_mut() {
            if matches!(state.unacked.get(&delivery.tag), Some((owner, _)) if *owner == self.id) {
                if let Some((_, mut message)) = state.unacked.remove(&delivery.tag) {
                    if requeue {
                        message.redelivered = true;
                        state.ready.push_front(message);
                    }
                }
                return Ok(());
            }
        }
        Err(BrokerError::UnknownDelivery(delivery.tag.clone()))
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        self.check_open()?;
        Ok(self
            .state
            .queues()
            .get(queue)
            .map_or(0, |q| q.ready.len() as u64))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.state.release_channel(self.id);
        }
        Ok(())
    }
}
