use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use ticket_sync::{
    Backoff, ConnectionEvent, ConnectionState, Generation, HttpEventSource, HttpPageSource,
    PageSource, ReconciliationStore, StatusCommand, StreamConfig, StreamConsumer, StreamHandle,
    SyncError,
};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

#[derive(Clone, Default)]
struct Recorded {
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    status_posts: Arc<Mutex<Vec<Value>>>,
    garbled_connects: Arc<AtomicUsize>,
}

async fn list_items(
    State(recorded): State<Recorded>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let page: u32 = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    recorded.queries.lock().push(query);
    let last = page >= 2;
    let previous = if page > 1 { Some(page - 1) } else { None };
    let next = if last { None } else { Some(page + 1) };
    Json(json!({
        "data": [{"id": format!("t-{page}"), "status": 1}],
        "meta": {
            "isFirstPage": page == 1,
            "isLastPage": last,
            "currentPage": page,
            "previousPage": previous,
            "nextPage": next,
        }
    }))
}

async fn broken_listing() -> &'static str {
    "<html>maintenance</html>"
}

async fn post_status(State(recorded): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
    let success = body["ticketId"] != "locked";
    recorded.status_posts.lock().push(body);
    Json(json!({ "success": success }))
}

async fn sse_feed() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let frames = vec![
        json!({"type": "connected"}).to_string(),
        json!({"type": "upsert", "data": {"id": "a"}}).to_string(),
        "{this is not json".to_string(),
        json!({"type": "issue_update", "action": "updated", "data": {"id": "b"}}).to_string(),
    ];
    let events = stream::iter(frames)
        .map(|frame| Ok::<_, Infallible>(Event::default().data(frame)))
        .chain(stream::pending());
    Sse::new(events)
}

async fn plain_feed() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain")],
        "data: {\"type\":\"upsert\",\"data\":{\"id\":\"plain\"}}\n\n",
    )
}

async fn json_typed_feed() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json")],
        "data: {\"type\":\"upsert\",\"data\":{\"id\":\"odd\"}}\n\n",
    )
}

async fn garbled_feed(State(recorded): State<Recorded>) -> impl IntoResponse {
    recorded.garbled_connects.fetch_add(1, Ordering::SeqCst);
    let chunks: Vec<Vec<u8>> = vec![
        b"data: {\"type\":\"upsert\",\"data\":{\"id\":\"a\"}}\n\n".to_vec(),
        b"data: \xff\xfe\n\n".to_vec(),
        b"data: {\"type\":\"upsert\",\"data\":{\"id\":\"b\"}}\n\n".to_vec(),
    ];
    let body = stream::iter(chunks)
        .map(Ok::<_, Infallible>)
        .chain(stream::pending());
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(body),
    )
}

async fn unavailable_feed() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn serve() -> (SocketAddr, Recorded) {
    let recorded = Recorded::default();
    let router = Router::new()
        .route("/items", get(list_items))
        .route("/broken", get(broken_listing))
        .route("/status", post(post_status))
        .route("/stream/issues", get(sse_feed))
        .route("/stream/plain", get(plain_feed))
        .route("/stream/json", get(json_typed_feed))
        .route("/stream/down", get(unavailable_feed))
        .route("/stream/garbled", get(garbled_feed))
        .with_state(recorded.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (addr, recorded)
}

fn consume(url: String, store: &ReconciliationStore) -> StreamHandle {
    StreamConsumer::new(
        Arc::new(HttpEventSource::new(url)),
        store.clone(),
        StreamConfig {
            backoff: Backoff::fixed(Duration::from_millis(20)),
            handshake_timeout: Duration::from_secs(2),
            liveness_timeout: None,
        },
        Generation::root(),
    )
    .start()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn fetches_pages_with_limit_and_page_query() {
    let (addr, recorded) = serve().await;
    let source = HttpPageSource::new(format!("http://{addr}/"), "items", 5);

    let first = source.fetch_page(1).await.expect("page 1");
    assert_eq!(first.data[0].id, "t-1");
    assert!(first.has_more());

    let second = source.fetch_page(2).await.expect("page 2");
    assert_eq!(second.meta.current_page, 2);
    assert_eq!(second.meta.previous_page, Some(1));
    assert!(!second.has_more());

    let queries = recorded.queries.lock().clone();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[1].get("limit").map(String::as_str), Some("5"));
    assert_eq!(queries[1].get("page").map(String::as_str), Some("2"));
}

#[tokio::test]
async fn listing_failures_are_classified() {
    let (addr, _) = serve().await;

    let missing = HttpPageSource::new(format!("http://{addr}"), "nowhere", 10);
    let err = missing.fetch_page(1).await.unwrap_err();
    assert!(matches!(err, SyncError::Protocol { status: 404, .. }));
    assert!(err.is_fatal());

    let broken = HttpPageSource::new(format!("http://{addr}"), "broken", 10);
    assert!(matches!(
        broken.fetch_page(1).await.unwrap_err(),
        SyncError::Decode(_)
    ));

    let unreachable = HttpPageSource::new("http://127.0.0.1:9", "items", 10);
    assert!(matches!(
        unreachable.fetch_page(1).await.unwrap_err(),
        SyncError::Transport(_)
    ));
}

#[tokio::test]
async fn status_command_posts_ticket_id_and_status() {
    let (addr, recorded) = serve().await;
    let client = HttpPageSource::new(format!("http://{addr}"), "items", 10);

    assert!(client.update_status("t-1", 4).await.expect("accepted"));
    assert!(!client.update_status("locked", 4).await.expect("declined"));

    let posts = recorded.status_posts.lock().clone();
    assert_eq!(posts[0], json!({"ticketId": "t-1", "status": 4}));
}

#[tokio::test]
async fn event_stream_survives_malformed_frame() {
    let (addr, _) = serve().await;
    let store = ReconciliationStore::default();
    let handle = consume(format!("http://{addr}/stream/issues"), &store);

    eventually(|| store.len() == 2).await;
    assert_eq!(handle.state(), ConnectionState::Open);
    let ids: Vec<String> = store.snapshot().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, ["b", "a"]);
    handle.stop();
}

#[tokio::test]
async fn invalid_utf8_frame_does_not_stall_stream() {
    let (addr, recorded) = serve().await;
    let store = ReconciliationStore::default();
    let handle = consume(format!("http://{addr}/stream/garbled"), &store);

    eventually(|| store.get("a").is_some() && store.get("b").is_some()).await;
    assert_eq!(handle.state(), ConnectionState::Open);
    assert_eq!(store.len(), 2);
    assert_eq!(recorded.garbled_connects.load(Ordering::SeqCst), 1);
    handle.stop();
}

#[tokio::test]
async fn missing_stream_endpoint_is_not_retried() {
    let (addr, _) = serve().await;
    let store = ReconciliationStore::default();
    let handle = consume(format!("http://{addr}/stream/gone"), &store);

    eventually(|| handle.is_finished()).await;
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert!(matches!(
        handle.last_error(),
        Some(SyncError::Protocol { status: 404, .. })
    ));
}

#[tokio::test]
async fn unavailable_stream_keeps_retrying() {
    let (addr, _) = serve().await;
    let store = ReconciliationStore::default();
    let handle = consume(format!("http://{addr}/stream/down"), &store);
    let mut events = handle.subscribe();

    let mut retries = 0;
    timeout(Duration::from_secs(5), async {
        while retries < 2 {
            if let Ok(ConnectionEvent::RetryScheduled { .. }) = events.recv().await {
                retries += 1;
            }
        }
    })
    .await
    .expect("consumer retries a 503");
    assert!(!handle.is_finished());
    assert!(matches!(
        handle.last_error(),
        Some(SyncError::Protocol { status: 503, .. })
    ));
    handle.stop();
}

#[tokio::test]
async fn tolerates_non_event_stream_content_types() {
    let (addr, _) = serve().await;
    let store = ReconciliationStore::default();
    let plain = consume(format!("http://{addr}/stream/plain"), &store);
    let odd = consume(format!("http://{addr}/stream/json"), &store);

    eventually(|| store.get("plain").is_some() && store.get("odd").is_some()).await;
    plain.stop();
    odd.stop();
}
