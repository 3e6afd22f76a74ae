use async_trait::async_trait;
use serde::ser::Error as _;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use indexserve::config::Config;
use indexserve::error::{QueryError, QUERY_TOO_LONG};
use indexserve::server::{self, AppState};
use indexserve::traits::{QueryExecutor, ResultSequence};

// ============ Test collaborators ============

#[derive(Clone)]
enum Item {
    Ok(Value),
    Broken,
}

impl Serialize for Item {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Item::Ok(value) => value.serialize(serializer),
            Item::Broken => Err(S::Error::custom("record cannot be encoded")),
        }
    }
}

/// Answers known queries from a table and counts every call.
#[derive(Default)]
struct SpyExecutor {
    results: HashMap<String, Vec<Item>>,
    calls: AtomicUsize,
    pulls: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    double_releases: Arc<AtomicUsize>,
}

impl SpyExecutor {
    fn with(mut self, query: &str, items: Vec<Item>) -> Self {
        self.results.insert(query.to_string(), items);
        self
    }
}

#[async_trait]
impl QueryExecutor for SpyExecutor {
    type Sequence = SpySequence;

    async fn execute(&self, query: &str) -> Result<SpySequence, QueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let items = self
            .results
            .get(query)
            .ok_or_else(|| QueryError::new(format!("unknown query: {}", query)))?;
        Ok(SpySequence {
            items: items.iter().cloned().collect(),
            released: false,
            pulls: self.pulls.clone(),
            releases: self.releases.clone(),
            double_releases: self.double_releases.clone(),
        })
    }
}

struct SpySequence {
    items: VecDeque<Item>,
    released: bool,
    pulls: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    double_releases: Arc<AtomicUsize>,
}

#[async_trait]
impl ResultSequence for SpySequence {
    type Record = Item;

    async fn next_record(&mut self) -> anyhow::Result<Option<Item>> {
        anyhow::ensure!(!self.released, "pulled after release");
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.pop_front())
    }

    fn release(&mut self) {
        if self.released {
            self.double_releases.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.released = true;
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

fn records(values: impl IntoIterator<Item = Value>) -> Vec<Item> {
    values.into_iter().map(Item::Ok).collect()
}

async fn spawn_server<E: QueryExecutor>(executor: Arc<E>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(&Config::default(), executor);
    tokio::spawn(server::serve(listener, state, std::future::pending()));
    format!("http://{}/", addr)
}

async fn post(url: &str, body: impl Into<reqwest::Body>) -> reqwest::Response {
    reqwest::Client::new()
        .post(url)
        .body(body)
        .send()
        .await
        .unwrap()
}

/// Waits until a counter reaches `expected`, for work done on spawned tasks.
async fn wait_for(counter: &AtomicUsize, expected: usize) {
    for _ in 0..500 {
        if counter.load(Ordering::SeqCst) >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(counter.load(Ordering::SeqCst), expected);
}

fn assert_common_headers(resp: &reqwest::Response) {
    let headers = resp.headers();
    assert_eq!(headers["content-type"], "application/json");
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(headers["access-control-allow-methods"], "POST");
}

// ============ Success ============

#[tokio::test]
async fn test_streams_pretty_printed_array() {
    let executor = Arc::new(
        SpyExecutor::default().with("cat", records([json!({"id": 1}), json!({"id": 2})])),
    );
    let url = spawn_server(executor.clone()).await;

    let resp = post(&url, "cat").await;
    assert_eq!(resp.status(), 200);
    assert_common_headers(&resp);

    let body = resp.text().await.unwrap();
    assert_eq!(body, "[\n{\n  \"id\": 1\n},\n{\n  \"id\": 2\n}\n]");

    wait_for(&executor.releases, 1).await;
    assert_eq!(executor.double_releases.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_any_path_is_accepted() {
    let executor = Arc::new(SpyExecutor::default().with("cat", records([json!(1)])));
    let url = spawn_server(executor).await;

    let resp = post(&format!("{}some/other/path?x=1", url), "cat").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "[\n1\n]");
}

#[tokio::test]
async fn test_empty_result_is_empty_array() {
    let executor = Arc::new(SpyExecutor::default().with("nothing", vec![]));
    let url = spawn_server(executor.clone()).await;

    let resp = post(&url, "nothing").await;
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert_eq!(body, "[\n]");
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!([]));

    wait_for(&executor.releases, 1).await;
}

#[tokio::test]
async fn test_large_result_keeps_order() {
    let values: Vec<Value> = (0..500)
        .map(|i| json!({"n": i, "text": "lorem ipsum ".repeat(20)}))
        .collect();
    let executor = Arc::new(SpyExecutor::default().with("many", records(values.clone())));
    let url = spawn_server(executor).await;

    let body = post(&url, "many").await.text().await.unwrap();
    let parsed: Vec<Value> = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed, values);
}

// ============ Rejected before commit ============

#[tokio::test]
async fn test_oversized_query_is_413_and_never_executes() {
    let executor = Arc::new(SpyExecutor::default());
    let url = spawn_server(executor.clone()).await;

    let resp = post(&url, "x".repeat(4097)).await;
    assert_eq!(resp.status(), 413);
    assert_common_headers(&resp);
    assert_eq!(
        resp.text().await.unwrap(),
        format!("{{\"error\":\"{}\"}}", QUERY_TOO_LONG)
    );
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_query_at_limit_is_executed() {
    let query = "y".repeat(4096);
    let executor = Arc::new(SpyExecutor::default().with(&query, vec![]));
    let url = spawn_server(executor.clone()).await;

    let resp = post(&url, query).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_query_error_is_400_envelope() {
    let executor = Arc::new(SpyExecutor::default());
    let url = spawn_server(executor.clone()).await;

    let resp = post(&url, "dog").await;
    assert_eq!(resp.status(), 400);
    assert_common_headers(&resp);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"error": "unknown query: dog"}));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.releases.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_non_post_is_405() {
    let executor = Arc::new(SpyExecutor::default());
    let url = spawn_server(executor.clone()).await;

    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 405);
    assert_eq!(resp.headers()["allow"], "POST");
    assert_common_headers(&resp);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"error": "Only POST is supported."}));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_preflight_is_204() {
    let url = spawn_server(Arc::new(SpyExecutor::default())).await;

    let resp = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, &url)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    assert_eq!(resp.headers()["access-control-allow-methods"], "POST");
}

// ============ Failure after commit ============

#[tokio::test]
async fn test_serialization_failure_truncates_and_releases_once() {
    let executor = Arc::new(SpyExecutor::default().with(
        "bad",
        vec![
            Item::Ok(json!({"id": 1})),
            Item::Broken,
            Item::Ok(json!({"id": 3})),
        ],
    ));
    let url = spawn_server(executor.clone()).await;

    let resp = post(&url, "bad").await;
    // The status was committed before the bad record was reached.
    assert_eq!(resp.status(), 200);

    match resp.bytes().await {
        Err(_) => {}
        Ok(body) => {
            assert!(serde_json::from_slice::<Value>(&body).is_err());
            assert!(!body.ends_with(b"]"));
        }
    }

    wait_for(&executor.releases, 1).await;
    assert_eq!(executor.double_releases.load(Ordering::SeqCst), 0);
    // Nothing is pulled past the broken record.
    assert_eq!(executor.pulls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_slow_client_throttles_and_disconnect_releases() {
    let total = 20_000;
    let values = (0..total).map(|i| json!({"n": i, "pad": "z".repeat(2048)}));
    let executor = Arc::new(SpyExecutor::default().with("flood", records(values)));
    let url = spawn_server(executor.clone()).await;

    let resp = post(&url, "flood").await;
    assert_eq!(resp.status(), 200);

    // Never read the body: socket buffers fill and the writer stops pulling.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let pulled = executor.pulls.load(Ordering::SeqCst);
    assert!(pulled < total, "pulled {} of {} records", pulled, total);
    assert_eq!(executor.releases.load(Ordering::SeqCst), 0);

    drop(resp);
    wait_for(&executor.releases, 1).await;
    assert_eq!(executor.double_releases.load(Ordering::SeqCst), 0);
}

// ============ Concurrency ============

#[tokio::test]
async fn test_concurrent_responses_do_not_interleave() {
    let a: Vec<Value> = (0..300).map(|i| json!({"q": "a", "n": i})).collect();
    let b: Vec<Value> = (0..300).map(|i| json!({"q": "b", "n": i})).collect();
    let executor = Arc::new(
        SpyExecutor::default()
            .with("a", records(a.clone()))
            .with("b", records(b.clone())),
    );
    let url = spawn_server(executor.clone()).await;

    let (resp_a, resp_b) = tokio::join!(post(&url, "a"), post(&url, "b"));
    let (body_a, body_b) = tokio::join!(resp_a.text(), resp_b.text());

    let parsed_a: Vec<Value> = serde_json::from_str(&body_a.unwrap()).unwrap();
    let parsed_b: Vec<Value> = serde_json::from_str(&body_b.unwrap()).unwrap();
    assert_eq!(parsed_a, a);
    assert_eq!(parsed_b, b);

    wait_for(&executor.releases, 2).await;
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
}
