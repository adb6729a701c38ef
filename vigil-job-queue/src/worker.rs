//! Worker pool draining the work queue.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerConnection, BrokerSettings, Delivery};
use crate::clock::Clock;
use crate::error::{JobQueueError, SearchError, StoreError};
use crate::search::SearchClient;
use crate::store::StateStore;
use crate::types::{JobMessage, JobRecord};

/// Tuning knobs for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Number of concurrent workers, each with its own channel.
    pub count: usize,
    /// Pause after finding the queue empty.
    pub poll_interval: Duration,
    /// Upper bound on a single search call.
    pub search_timeout: Duration,
    /// Pause before handing a message back after a store failure.
    pub persistence_retry_delay: Duration,
    /// How often an in-flight delivery's lease is renewed. Must be shorter
    /// than the broker's visibility timeout.
    pub lease_renewal: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 1,
            poll_interval: Duration::from_millis(500),
            search_timeout: Duration::from_secs(30),
            persistence_retry_delay: Duration::from_secs(1),
            lease_renewal: Duration::from_secs(30),
        }
    }
}

/// What happened to one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Failed,
    /// The job was already terminal; redelivery is a no-op.
    AlreadyTerminal,
}

/// Executes one job: record progress, search, record the outcome.
pub struct JobProcessor {
    store: Arc<dyn StateStore>,
    search: Arc<dyn SearchClient>,
    clock: Arc<dyn Clock>,
    settings: WorkerSettings,
}

impl fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobProcessor")
            .field("search", &self.search.source())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn StateStore>,
        search: Arc<dyn SearchClient>,
        clock: Arc<dyn Clock>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            search,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Run one decoded message to a terminal state.
    ///
    /// Store failures are returned so the caller can leave the message
    /// unacknowledged; search failures are recorded on the job.
    pub async fn process(
        &self,
        worker: &str,
        message: &JobMessage,
    ) -> Result<ProcessOutcome, StoreError> {
        let job_id = message.job_id;
        let mut record = match self.store.get(job_id).await? {
            Some(record) if record.status.is_terminal() => {
                debug!(%job_id, status = %record.status, "job already finished; ignoring redelivery");
                return Ok(ProcessOutcome::AlreadyTerminal);
            }
            Some(record) => record,
            None => {
                info!(%job_id, keyword = %message.keyword, "no stored record; resuming job from message");
                JobRecord::resumed(message)
            }
        };

        record.start(self.clock.now().await);
        self.store.transition(&record).await?;
        debug!(%job_id, worker, "job processing");

        let search = self.search.search(&record.keyword);
        let result = match tokio::time::timeout(self.settings.search_timeout, search).await {
            Ok(result) => result,
            Err(_) => Err(SearchError::Timeout),
        };

        let via = format!("{worker}/{}", self.search.source());
        let finished = self.clock.now().await;
        let outcome = match result {
            Ok(results) => {
                info!(%job_id, total_results = results.total_results, "job completed");
                record.complete(results, via, finished);
                ProcessOutcome::Completed
            }
            Err(err) => {
                let err = JobQueueError::from(err);
                warn!(%job_id, %err, "search failed; job marked failed");
                record.fail(err.to_string(), via, finished);
                ProcessOutcome::Failed
            }
        };

        self.store.transition(&record).await?;
        Ok(outcome)
    }

    /// Handle one delivery end to end, including ack/nack. Errors are logged
    /// and settled here; nothing propagates to the worker loop.
    pub async fn handle(&self, worker: &str, connection: &BrokerConnection, delivery: Delivery) {
        let message = match JobMessage::parse(&delivery.body) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, worker, "dropping malformed message");
                Self::settle(connection, &delivery, true).await;
                return;
            }
        };

        let work = self.process(worker, &message);
        tokio::pin!(work);
        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = tokio::time::sleep(self.settings.lease_renewal) => {
                    if let Err(err) = connection.extend(&delivery).await {
                        warn!(
                            %err,
                            job_id = %message.job_id,
                            worker,
                            "failed to renew delivery lease"
                        );
                    }
                }
            }
        };

        match result {
            Ok(_) => Self::settle(connection, &delivery, true).await,
            Err(err) => {
                error!(
                    %err,
                    job_id = %message.job_id,
                    worker,
                    "failed to persist job state; leaving message for redelivery"
                );
                tokio::time::sleep(self.settings.persistence_retry_delay).await;
                Self::settle(connection, &delivery, false).await;
            }
        }
    }

    async fn settle(connection: &BrokerConnection, delivery: &Delivery, ack: bool) {
        let result = if ack {
            connection.ack(delivery).await
        } else {
            connection.nack(delivery, true).await
        };
        if let Err(err) = result {
            // The broker redelivers anything it did not see settled.
            warn!(%err, tag = %delivery.tag, ack, "failed to settle delivery");
        }
    }
}

struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

/// Background consumers, started and stopped administratively.
pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    broker_settings: BrokerSettings,
    processor: Arc<JobProcessor>,
    group: Mutex<Option<WorkerGroup>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("broker", &self.broker.describe())
            .field("broker_settings", &self.broker_settings)
            .field("processor", &self.processor)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        broker_settings: BrokerSettings,
        processor: Arc<JobProcessor>,
    ) -> Self {
        Self {
            broker,
            broker_settings,
            processor,
            group: Mutex::new(None),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.processor.settings.count.max(1)
    }

    pub async fn is_running(&self) -> bool {
        self.group.lock().await.is_some()
    }

    /// Spawn the workers. Returns `false` if the pool was already running.
    pub async fn start(&self) -> bool {
        let mut group = self.group.lock().await;
        if group.is_some() {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let count = self.worker_count();
        let mut joins = Vec::with_capacity(count);
        for index in 0..count {
            let connection =
                BrokerConnection::new(Arc::clone(&self.broker), self.broker_settings.clone());
            let processor = Arc::clone(&self.processor);
            let rx = shutdown_rx.clone();
            joins.push(tokio::spawn(run_worker(
                format!("worker-{index}"),
                connection,
                processor,
                rx,
            )));
        }

        info!(workers = count, queue = %self.broker_settings.queue, "worker pool started");
        *group = Some(WorkerGroup { shutdown_tx, joins });
        true
    }

    /// Signal shutdown and wait for workers to finish their current job.
    /// Returns `false` if the pool was not running.
    pub async fn stop(&self) -> bool {
        let Some(group) = self.group.lock().await.take() else {
            return false;
        };

        // Receivers may already be gone if every worker exited.
        let _ = group.shutdown_tx.send(true);
        for join in group.joins {
            if let Err(err) = join.await {
                error!(%err, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
        true
    }
}

async fn run_worker(
    name: String,
    connection: BrokerConnection,
    processor: Arc<JobProcessor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let idle = processor.settings.poll_interval;
    info!(worker = %name, "queue worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let fetched = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            fetched = connection.next_delivery() => fetched,
        };

        match fetched {
            Ok(Some(delivery)) => processor.handle(&name, &connection, delivery).await,
            Ok(None) => {
                if wait_or_shutdown(&mut shutdown, idle).await {
                    break;
                }
            }
            Err(err) => {
                log_fetch_error(&name, &err);
                if wait_or_shutdown(&mut shutdown, idle).await {
                    break;
                }
            }
        }
    }

    connection.close().await;
    info!(worker = %name, "queue worker stopped");
}

/// Sleep for `delay`; returns true if shutdown was requested meanwhile.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

fn log_fetch_error(worker: &str, err: &JobQueueError) {
    match err {
        JobQueueError::BrokerUnavailable { .. } => {
            error!(%err, worker, "broker unavailable; worker will keep retrying")
        }
        _ => warn!(%err, worker, "failed to fetch next delivery"),
    }
}
