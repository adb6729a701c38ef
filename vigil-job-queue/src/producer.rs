//! Turns a keyword into a durable, queryable job.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::BrokerConnection;
use crate::clock::Clock;
use crate::error::JobQueueError;
use crate::store::StateStore;
use crate::types::{JobMessage, JobRecord, Metadata};

/// Provenance tag for records failed on the enqueue path.
pub const PRODUCER_VIA: &str = "producer";

/// Enqueues jobs: persist first, publish second.
pub struct JobProducer {
    store: Arc<dyn StateStore>,
    broker: BrokerConnection,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for JobProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobProducer")
            .field("broker", &self.broker)
            .finish_non_exhaustive()
    }
}

impl JobProducer {
    pub fn new(
        store: Arc<dyn StateStore>,
        broker: BrokerConnection,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
        }
    }

    pub fn broker(&self) -> &BrokerConnection {
        &self.broker
    }

    /// Enqueue a keyword search and return its job id.
    ///
    /// The pending record is committed before the message is published, so no
    /// consumer can ever see a message without a record. If publishing fails
    /// the record is marked failed before the error is returned, so a
    /// `pending` record always has a message in flight.
    pub async fn enqueue(&self, keyword: &str, metadata: Metadata) -> Result<Uuid, JobQueueError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(JobQueueError::InvalidKeyword(
                "keyword must not be empty".to_owned(),
            ));
        }

        let job_id = Uuid::new_v4();
        let created_at = self.clock.now().await;
        let record = JobRecord::pending(job_id, keyword, metadata, created_at);

        if let Err(err) = self.store.create(&record).await {
            error!(%err, %job_id, keyword, "failed to persist pending job; nothing published");
            return Err(err.into());
        }

        if let Err(err) = self.publish(&record).await {
            warn!(%err, %job_id, keyword, "publish failed; marking job as failed");
            self.mark_unpublished(record, &err).await;
            return Err(err);
        }

        info!(%job_id, keyword, queue = %self.broker.queue(), "job enqueued");
        Ok(job_id)
    }

    async fn publish(&self, record: &JobRecord) -> Result<(), JobQueueError> {
        let body = JobMessage::from_record(record).to_bytes()?;
        self.broker.publish(&body).await
    }

    async fn mark_unpublished(&self, mut record: JobRecord, cause: &JobQueueError) {
        let now = self.clock.now().await;
        record.fail(
            format!("failed to publish job to broker: {cause}"),
            PRODUCER_VIA,
            now,
        );
        if let Err(err) = self.store.transition(&record).await {
            error!(%err, job_id = %record.job_id, "could not mark unpublished job as failed");
        }
    }
}
