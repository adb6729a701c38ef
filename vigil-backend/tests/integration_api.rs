use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use vigil_backend::build_router;
use vigil_backend::state::AppState;
use vigil_config::Config;
use vigil_job_queue::{
    async_trait, ClockService, InMemoryBroker, InMemoryStateStore, SearchClient, SearchError,
    SearchResult, SearchResults,
};

struct FixedSearch;

#[async_trait]
impl SearchClient for FixedSearch {
    fn source(&self) -> &str {
        "fixed"
    }

    async fn search(&self, keyword: &str) -> Result<SearchResults, SearchError> {
        if keyword == "offline" {
            return Err(SearchError::Unavailable("upstream returned 503".into()));
        }
        Ok(SearchResults {
            total_results: 3,
            results: (0..3)
                .map(|i| SearchResult::new(format!("CVE-2025-{i:04}")))
                .collect(),
        })
    }
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.broker.url = "memory://".into();
    cfg.broker.queue = "api-test".into();
    cfg.broker.max_retries = 2;
    cfg.broker.retry_delay_ms = 5;
    cfg.broker.poll_interval_ms = 10;
    cfg.workers.persistence_retry_delay_ms = 10;
    cfg.workers.count = 2;
    cfg
}

fn setup() -> (Router, Arc<AppState>, Arc<InMemoryBroker>) {
    let broker = Arc::new(InMemoryBroker::new());
    let state = Arc::new(AppState::assemble(
        &test_config(),
        Arc::new(InMemoryStateStore::new()),
        broker.clone(),
        Arc::new(FixedSearch),
        Arc::new(ClockService::local()),
    ));
    (build_router(state.clone()), state, broker)
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn enqueue(router: &Router, keyword: &str) -> String {
    let (status, body) = call(router, "POST", "/api/jobs", Some(json!({ "keyword": keyword }))).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    body["job_id"].as_str().unwrap().to_string()
}

async fn wait_for_terminal(router: &Router, job_id: &str) -> Value {
    for _ in 0..200 {
        let (_, body) = call(router, "GET", &format!("/api/jobs/{job_id}"), None).await;
        if matches!(body["status"].as_str(), Some("completed" | "failed")) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test]
async fn health_and_ready() {
    let (router, _, _) = setup();
    let response = router
        .clone()
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(Request::get("/api/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn enqueue_returns_pending_job() {
    let (router, _, broker) = setup();
    let (status, body) = call(
        &router,
        "POST",
        "/api/jobs",
        Some(json!({ "keyword": "  apache ", "metadata": { "requested_by": "ci" } })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    let job_id = body["job_id"].as_str().unwrap();

    let (status, job) = call(&router, "GET", &format!("/api/jobs/{job_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "pending");
    assert_eq!(job["keyword"], "apache");
    assert_eq!(job["metadata"]["requested_by"], "ci");
    assert_eq!(broker.depth("api-test"), 1);
}

#[tokio::test]
async fn enqueue_validation_errors() {
    let (router, _, broker) = setup();

    let (status, body) = call(&router, "POST", "/api/jobs", Some(json!({ "keyword": "   " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("keyword"));

    let (status, _) = call(&router, "POST", "/api/jobs", Some(json!({ "metadata": {} }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&router, "POST", "/api/jobs", Some(json!({ "keyword": 42 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(broker.published_count(), 0);
}

#[tokio::test]
async fn unknown_and_invalid_job_ids() {
    let (router, _, _) = setup();
    let (status, body) = call(
        &router,
        "GET",
        "/api/jobs/00000000-0000-4000-8000-000000000000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = call(&router, "GET", "/api/jobs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn broker_outage_fails_enqueue_with_503() {
    let (router, state, broker) = setup();
    broker.fail_next_connects(10);

    let (status, body) = call(&router, "POST", "/api/jobs", Some(json!({ "keyword": "nginx" }))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("broker"));

    // The record exists but never sits in pending without a message.
    let counts = state.store.counts_by_status().await.unwrap();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumer_processes_jobs_end_to_end() {
    let (router, _, _) = setup();
    let ok = enqueue(&router, "openssl").await;
    let bad = enqueue(&router, "offline").await;

    let (status, body) = call(&router, "POST", "/api/consumer/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "running": true, "workers": 2, "changed": true }));

    let done = wait_for_terminal(&router, &ok).await;
    assert_eq!(done["status"], "completed");
    assert_eq!(done["total_results"], 3);
    assert!(done["processed_via"].as_str().unwrap().ends_with("/fixed"));

    let failed = wait_for_terminal(&router, &bad).await;
    assert_eq!(failed["status"], "failed");
    assert!(failed["error"].as_str().unwrap().contains("503"));

    let (_, body) = call(&router, "POST", "/api/consumer/stop", None).await;
    assert_eq!(body["running"], false);
    assert_eq!(body["changed"], true);
}

#[tokio::test]
async fn consumer_start_and_stop_are_idempotent() {
    let (router, _, _) = setup();

    let (_, body) = call(&router, "GET", "/api/consumer", None).await;
    assert_eq!(body, json!({ "running": false, "workers": 2 }));

    let (_, body) = call(&router, "POST", "/api/consumer/stop", None).await;
    assert_eq!(body["changed"], false);

    call(&router, "POST", "/api/consumer/start", None).await;
    let (_, body) = call(&router, "POST", "/api/consumer/start", None).await;
    assert_eq!(body["running"], true);
    assert_eq!(body["changed"], false);

    let (_, body) = call(&router, "POST", "/api/consumer/stop", None).await;
    assert_eq!(body["running"], false);
    assert_eq!(body["changed"], true);
}

#[tokio::test]
async fn queue_status_reports_depth_and_counts() {
    let (router, _, _) = setup();
    enqueue(&router, "log4j").await;
    enqueue(&router, "struts").await;

    let (status, body) = call(&router, "GET", "/api/queue/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue"], "api-test");
    assert_eq!(body["broker_depth"], 2);
    assert_eq!(body["pending_count"], 2);
    assert_eq!(body["processing_count"], 0);
    assert_eq!(body["total"], 2);
    assert_eq!(body["consumer_running"], false);
    assert!(body.get("broker_error").is_none());
}

#[tokio::test]
async fn queue_status_survives_broker_outage() {
    let (router, _, broker) = setup();
    enqueue(&router, "log4j").await;
    broker.fail_next_connects(10);

    let (status, body) = call(&router, "GET", "/api/queue/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["broker_depth"], 0);
    assert_eq!(body["pending_count"], 1);
    assert!(body["broker_error"].is_string());
}

#[tokio::test]
async fn list_jobs_paginates_and_filters() {
    let (router, _, _) = setup();
    for keyword in ["a", "b", "c"] {
        enqueue(&router, keyword).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let (status, body) = call(&router, "GET", "/api/jobs?page=1&perPage=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert_eq!(body["items"][0]["keyword"], "c");
    assert_eq!(body["pagination"]["total"], 3);

    let (_, body) = call(&router, "GET", "/api/jobs?page=2&perPage=2", None).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["items"][0]["keyword"], "a");

    let (_, body) = call(&router, "GET", "/api/jobs?status=completed", None).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 0);
    assert_eq!(body["pagination"]["total"], 0);

    let (status, _) = call(&router, "GET", "/api/jobs?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(&router, "GET", "/api/jobs?perPage=0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
