use std::sync::Arc;
use std::time::Duration;

use vigil_job_queue::{
    async_trait, BrokerConnection, BrokerSettings, CachedStateStore, ClockService,
    InMemoryBroker, InMemoryStateStore, JobProcessor, JobProducer, JobStatus, Metadata,
    QueueStatusReporter, SearchClient, SearchError, SearchResult, SearchResults, StateStore,
    WorkerPool, WorkerSettings,
};

const QUEUE: &str = "pool-test";

struct SlowSearch;

#[async_trait]
impl SearchClient for SlowSearch {
    fn source(&self) -> &str {
        "slow"
    }

    async fn search(&self, keyword: &str) -> Result<SearchResults, SearchError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(SearchResults {
            total_results: 1,
            results: vec![SearchResult::new(format!("CVE-{keyword}"))],
        })
    }
}

fn settings() -> BrokerSettings {
    BrokerSettings::new(QUEUE)
        .with_max_retries(2)
        .with_retry_delay(Duration::from_millis(1))
}

struct Setup {
    broker: InMemoryBroker,
    store: Arc<dyn StateStore>,
    producer: JobProducer,
    pool: Arc<WorkerPool>,
}

fn setup(workers: usize) -> Setup {
    let broker = InMemoryBroker::new();
    let store: Arc<dyn StateStore> =
        Arc::new(CachedStateStore::new(Arc::new(InMemoryStateStore::new())));
    let clock = Arc::new(ClockService::local());

    let producer = JobProducer::new(
        store.clone(),
        BrokerConnection::new(Arc::new(broker.clone()), settings()),
        clock.clone(),
    );
    let processor = Arc::new(JobProcessor::new(
        store.clone(),
        Arc::new(SlowSearch),
        clock,
        WorkerSettings {
            count: workers,
            poll_interval: Duration::from_millis(5),
            search_timeout: Duration::from_secs(1),
            persistence_retry_delay: Duration::from_millis(1),
            lease_renewal: Duration::from_millis(20),
        },
    ));
    let pool = Arc::new(WorkerPool::new(
        Arc::new(broker.clone()),
        settings(),
        processor,
    ));

    Setup {
        broker,
        store,
        producer,
        pool,
    }
}

async fn wait_for_terminal(store: &Arc<dyn StateStore>, expected: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let counts = store.counts_by_status().await.expect("counts");
        if counts.completed + counts.failed == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs did not finish in time: {counts:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_processes_every_job_once() {
    let s = setup(3);
    assert!(s.pool.start().await);

    let mut ids = Vec::new();
    for i in 0..12 {
        let id = s
            .producer
            .enqueue(&format!("pkg-{i}"), Metadata::new())
            .await
            .expect("enqueue");
        ids.push(id);
    }

    wait_for_terminal(&s.store, 12).await;
    assert!(s.pool.stop().await);

    for id in ids {
        let record = s.store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.total_results, Some(1));
        assert!(record
            .processed_via
            .as_deref()
            .unwrap()
            .starts_with("worker-"));
    }
    assert_eq!(s.broker.depth(QUEUE), 0);
    assert_eq!(s.broker.unacked(QUEUE), 0);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let s = setup(1);
    assert!(!s.pool.is_running().await);
    assert!(!s.pool.stop().await);

    assert!(s.pool.start().await);
    assert!(!s.pool.start().await);
    assert!(s.pool.is_running().await);

    assert!(s.pool.stop().await);
    assert!(!s.pool.is_running().await);

    // A stopped pool can be restarted.
    assert!(s.pool.start().await);
    assert!(s.pool.stop().await);
}

#[tokio::test]
async fn jobs_wait_in_the_queue_while_the_pool_is_stopped() {
    let s = setup(1);
    let id = s
        .producer
        .enqueue("redis", Metadata::new())
        .await
        .expect("enqueue");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        s.store.get(id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
    assert_eq!(s.broker.depth(QUEUE), 1);

    s.pool.start().await;
    wait_for_terminal(&s.store, 1).await;
    s.pool.stop().await;
    assert_eq!(
        s.store.get(id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn status_report_tracks_the_pool() {
    let s = setup(1);
    let reporter = QueueStatusReporter::new(
        s.store.clone(),
        BrokerConnection::new(Arc::new(s.broker.clone()), settings().with_max_retries(1)),
    )
    .with_workers(s.pool.clone());

    s.producer
        .enqueue("curl", Metadata::new())
        .await
        .expect("enqueue");
    let before = reporter.status().await.unwrap();
    assert_eq!(before.queue, QUEUE);
    assert_eq!(before.broker_depth, 1);
    assert_eq!(before.pending_count, 1);
    assert!(!before.consumer_running);

    s.pool.start().await;
    wait_for_terminal(&s.store, 1).await;
    let during = reporter.status().await.unwrap();
    assert!(during.consumer_running);
    assert_eq!(during.completed_count, 1);
    assert_eq!(during.broker_depth, 0);
    assert_eq!(during.total, 1);

    s.pool.stop().await;
}
