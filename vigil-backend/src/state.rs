use std::sync::Arc;

use vigil_config::Config;
use vigil_job_queue::{
    Broker, BrokerConnection, Clock, JobProcessor, JobProducer, QueueStatusReporter,
    SearchClient, StateStore, WorkerPool,
};

use crate::config_helpers::{broker_settings_from_config, worker_settings_from_config};

/// Shared application state passed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub producer: Arc<JobProducer>,
    pub reporter: Arc<QueueStatusReporter>,
    pub workers: Arc<WorkerPool>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn StateStore>,
        producer: JobProducer,
        reporter: QueueStatusReporter,
        workers: Arc<WorkerPool>,
    ) -> Self {
        Self {
            store,
            producer: Arc::new(producer),
            reporter: Arc::new(reporter),
            workers,
        }
    }

    /// Wire the producer, worker pool and status reporter around one store
    /// and one broker. Workers are created stopped.
    ///
    /// The producer and the reporter each get their own connection; the
    /// reporter's only tries once so a status request never waits out the
    /// full reconnection policy.
    pub fn assemble(
        cfg: &Config,
        store: Arc<dyn StateStore>,
        broker: Arc<dyn Broker>,
        search: Arc<dyn SearchClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let broker_settings = broker_settings_from_config(cfg);

        let producer = JobProducer::new(
            Arc::clone(&store),
            BrokerConnection::new(Arc::clone(&broker), broker_settings.clone()),
            Arc::clone(&clock),
        );

        let processor = Arc::new(JobProcessor::new(
            Arc::clone(&store),
            search,
            clock,
            worker_settings_from_config(cfg),
        ));
        let workers = Arc::new(WorkerPool::new(
            Arc::clone(&broker),
            broker_settings.clone(),
            processor,
        ));

        let reporter = QueueStatusReporter::new(
            Arc::clone(&store),
            BrokerConnection::new(broker, broker_settings.with_max_retries(1)),
        )
        .with_workers(Arc::clone(&workers));

        Self::new(store, producer, reporter, workers)
    }

    /// Stop the workers and release the producer's channel.
    pub async fn shutdown(&self) {
        self.workers.stop().await;
        self.producer.broker().close().await;
    }
}
