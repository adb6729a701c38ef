use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;
use vigil_job_queue::{
    async_trait, BrokerConnection, BrokerSettings, ClockService, InMemoryBroker,
    InMemoryStateStore, JobMessage, JobProcessor, JobProducer, JobQueueError, JobRecord,
    JobStatus, Metadata, ProcessOutcome, SearchClient, SearchError, SearchResult, SearchResults,
    StateStore, StatusCounts, StoreError, TransitionOutcome, WorkerSettings,
};

const QUEUE: &str = "lifecycle-test";

/// Five hits for most keywords, hangs for "xyz-unfindable", refuses "offline".
#[derive(Default)]
struct ScriptedSearch {
    calls: AtomicUsize,
}

#[async_trait]
impl SearchClient for ScriptedSearch {
    fn source(&self) -> &str {
        "scripted"
    }

    async fn search(&self, keyword: &str) -> Result<SearchResults, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match keyword {
            "xyz-unfindable" => {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(SearchResults::default())
            }
            "offline" => Err(SearchError::Unavailable("upstream returned 503".into())),
            _ => Ok(SearchResults {
                total_results: 5,
                results: (0..5)
                    .map(|i| SearchResult::new(format!("CVE-2024-{i:04}")))
                    .collect(),
            }),
        }
    }
}

/// Wraps the in-memory store with switchable failures.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStateStore,
    fail_creates: AtomicU32,
    fail_transitions: AtomicU32,
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn create(&self, record: &JobRecord) -> Result<(), StoreError> {
        if take(&self.fail_creates) {
            return Err(StoreError::Backend("disk full".into()));
        }
        self.inner.create(record).await
    }

    async fn transition(&self, record: &JobRecord) -> Result<TransitionOutcome, StoreError> {
        if take(&self.fail_transitions) {
            return Err(StoreError::Backend("database is locked".into()));
        }
        self.inner.transition(record).await
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        self.inner.get(job_id).await
    }

    async fn get_all(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.get_all().await
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        self.inner.counts_by_status().await
    }
}

struct Harness {
    broker: InMemoryBroker,
    store: Arc<FlakyStore>,
    search: Arc<ScriptedSearch>,
    producer: JobProducer,
    processor: JobProcessor,
    consumer: BrokerConnection,
}

fn settings() -> BrokerSettings {
    BrokerSettings::new(QUEUE)
        .with_max_retries(1)
        .with_retry_delay(Duration::from_millis(1))
}

fn setup() -> Harness {
    let broker = InMemoryBroker::new();
    let store = Arc::new(FlakyStore::default());
    let search = Arc::new(ScriptedSearch::default());
    let clock = Arc::new(ClockService::local());

    let producer = JobProducer::new(
        store.clone(),
        BrokerConnection::new(Arc::new(broker.clone()), settings()),
        clock.clone(),
    );
    let processor = JobProcessor::new(
        store.clone(),
        search.clone(),
        clock,
        WorkerSettings {
            count: 1,
            poll_interval: Duration::from_millis(5),
            search_timeout: Duration::from_millis(50),
            persistence_retry_delay: Duration::from_millis(1),
            lease_renewal: Duration::from_millis(20),
        },
    );
    let consumer = BrokerConnection::new(Arc::new(broker.clone()), settings());

    Harness {
        broker,
        store,
        search,
        producer,
        processor,
        consumer,
    }
}

impl Harness {
    /// Deliver every ready message to the processor, as a single worker would.
    async fn drain(&self) {
        while let Some(delivery) = self.consumer.next_delivery().await.expect("fetch") {
            self.processor.handle("worker-0", &self.consumer, delivery).await;
        }
    }

    async fn record(&self, job_id: Uuid) -> JobRecord {
        self.store
            .get(job_id)
            .await
            .expect("get")
            .expect("record exists")
    }
}

#[tokio::test]
async fn enqueued_job_is_pending_before_consumption() {
    let h = setup();
    let job_id = h
        .producer
        .enqueue("openssl", Metadata::new())
        .await
        .expect("enqueue");

    let record = h.record(job_id).await;
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.keyword, "openssl");
    assert!(record.processed_at.is_none());
    assert_eq!(h.broker.depth(QUEUE), 1);
}

#[tokio::test]
async fn keyword_is_trimmed_and_metadata_kept() {
    let h = setup();
    let mut metadata = Metadata::new();
    metadata.insert("requested_by".into(), json!("scanner"));

    let job_id = h
        .producer
        .enqueue("  log4j  ", metadata.clone())
        .await
        .expect("enqueue");

    let record = h.record(job_id).await;
    assert_eq!(record.keyword, "log4j");
    assert_eq!(record.metadata, metadata);
}

#[tokio::test]
async fn empty_keyword_is_rejected_without_side_effects() {
    let h = setup();
    let err = h.producer.enqueue("   ", Metadata::new()).await.unwrap_err();
    assert!(matches!(err, JobQueueError::InvalidKeyword(_)));
    assert_eq!(h.broker.published_count(), 0);
    assert_eq!(h.store.counts_by_status().await.unwrap().total(), 0);
}

#[tokio::test]
async fn apache_search_completes_with_five_results() {
    let h = setup();
    let job_id = h
        .producer
        .enqueue("apache", Metadata::new())
        .await
        .expect("enqueue");
    h.drain().await;

    let record = h.record(job_id).await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.total_results, Some(5));
    assert_eq!(
        record.results_payload.as_ref().and_then(|v| v.as_array()).map(Vec::len),
        Some(5)
    );
    assert!(record.error.is_none());
    assert_eq!(record.processed_via.as_deref(), Some("worker-0/scripted"));
    assert_eq!(h.broker.unacked(QUEUE), 0);
}

#[tokio::test]
async fn search_timeout_fails_the_job() {
    let h = setup();
    let job_id = h
        .producer
        .enqueue("xyz-unfindable", Metadata::new())
        .await
        .expect("enqueue");
    h.drain().await;

    let record = h.record(job_id).await;
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("timeout"));
    assert!(record.total_results.is_none());
    assert_eq!(h.broker.depth(QUEUE), 0);
}

#[tokio::test]
async fn search_unavailable_fails_the_job() {
    let h = setup();
    let job_id = h
        .producer
        .enqueue("offline", Metadata::new())
        .await
        .expect("enqueue");
    h.drain().await;

    let record = h.record(job_id).await;
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().contains("503"));
}

#[tokio::test]
async fn one_failed_job_does_not_block_the_next() {
    let h = setup();
    let a = h
        .producer
        .enqueue("xyz-unfindable", Metadata::new())
        .await
        .expect("enqueue a");
    let b = h
        .producer
        .enqueue("nginx", Metadata::new())
        .await
        .expect("enqueue b");
    h.drain().await;

    assert_eq!(h.record(a).await.status, JobStatus::Failed);
    assert_eq!(h.record(b).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn redelivery_of_a_finished_job_is_a_no_op() {
    let h = setup();
    let job_id = h
        .producer
        .enqueue("apache", Metadata::new())
        .await
        .expect("enqueue");
    h.drain().await;
    let finished = h.record(job_id).await;
    assert_eq!(h.search.calls.load(Ordering::SeqCst), 1);

    // Simulate the broker handing the same message out again.
    let body = JobMessage::from_record(&finished).to_bytes().unwrap();
    h.broker.inject(QUEUE, body.clone());
    h.broker.inject(QUEUE, body);
    h.drain().await;

    assert_eq!(h.record(job_id).await, finished);
    assert_eq!(h.search.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.counts_by_status().await.unwrap().completed, 1);

    let outcome = h
        .processor
        .process("worker-1", &JobMessage::from_record(&finished))
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::AlreadyTerminal);
}

#[tokio::test]
async fn failed_create_never_publishes() {
    let h = setup();
    h.store.fail_creates.store(1, Ordering::SeqCst);

    let err = h
        .producer
        .enqueue("apache", Metadata::new())
        .await
        .unwrap_err();
    assert!(matches!(err, JobQueueError::Persistence(_)));
    assert_eq!(h.broker.published_count(), 0);
    assert_eq!(h.broker.depth(QUEUE), 0);
    assert_eq!(h.store.counts_by_status().await.unwrap().total(), 0);
}

#[tokio::test]
async fn publish_failure_marks_the_record_failed() {
    let h = setup();
    h.broker.fail_next_publishes(1);

    let err = h
        .producer
        .enqueue("apache", Metadata::new())
        .await
        .unwrap_err();
    assert!(err.is_broker_failure());

    let all = h.store.get_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, JobStatus::Failed);
    assert_eq!(all[0].processed_via.as_deref(), Some("producer"));
    assert!(all[0]
        .error
        .as_deref()
        .unwrap()
        .starts_with("failed to publish job to broker"));
}

#[tokio::test]
async fn unreachable_broker_is_a_hard_failure() {
    let h = setup();
    h.broker.fail_next_connects(5);

    let err = h
        .producer
        .enqueue("apache", Metadata::new())
        .await
        .unwrap_err();
    assert!(matches!(err, JobQueueError::BrokerUnavailable { .. }));

    let counts = h.store.counts_by_status().await.unwrap();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.failed, 1);
}

#[tokio::test]
async fn store_failure_during_processing_redelivers() {
    let h = setup();
    let job_id = h
        .producer
        .enqueue("apache", Metadata::new())
        .await
        .expect("enqueue");
    h.store.fail_transitions.store(1, Ordering::SeqCst);

    h.drain().await;

    let record = h.record(job_id).await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(h.broker.depth(QUEUE), 0);
    assert_eq!(h.broker.unacked(QUEUE), 0);
}

#[tokio::test]
async fn malformed_messages_are_dropped() {
    let h = setup();
    h.broker.inject(QUEUE, b"not json".to_vec());
    h.broker.inject(QUEUE, br#"{"keyword":"apache"}"#.to_vec());
    h.broker.inject(
        QUEUE,
        json!({"job_id": Uuid::new_v4(), "keyword": ""}).to_string(),
    );

    h.drain().await;

    assert_eq!(h.broker.depth(QUEUE), 0);
    assert_eq!(h.broker.unacked(QUEUE), 0);
    assert_eq!(h.search.calls.load(Ordering::SeqCst), 0);
    assert!(h.store.get_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn message_without_a_record_is_resumed() {
    let h = setup();
    let job_id = Uuid::new_v4();
    h.broker.inject(
        QUEUE,
        json!({"job_id": job_id, "keyword": "struts"}).to_string(),
    );

    h.drain().await;

    let record = h.record(job_id).await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.keyword, "struts");
}

#[tokio::test]
async fn timestamps_and_counts_stay_consistent() {
    let h = setup();
    let keywords = ["apache", "xyz-unfindable", "nginx", "offline", "openssl"];
    for keyword in keywords {
        h.producer
            .enqueue(keyword, Metadata::new())
            .await
            .expect("enqueue");
    }
    assert_eq!(
        h.store.counts_by_status().await.unwrap().total(),
        keywords.len() as u64
    );

    h.drain().await;

    let counts = h.store.counts_by_status().await.unwrap();
    assert_eq!(counts.total(), keywords.len() as u64);
    assert_eq!(counts.completed, 3);
    assert_eq!(counts.failed, 2);

    for record in h.store.get_all().await.unwrap() {
        let started = record.started_at.expect("started_at");
        let finished = record.processed_at.expect("processed_at");
        assert!(started <= finished, "job {} finished before it started", record.job_id);
        assert!(record.created_at <= started);
    }
}
