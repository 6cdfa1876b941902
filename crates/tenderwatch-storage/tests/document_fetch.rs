use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tenderwatch_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use uuid::Uuid;

/// Bid document endpoint that answers 503 for its first `unavailable` hits.
#[derive(Clone)]
struct DocumentEndpoint {
    hits: Arc<AtomicUsize>,
    unavailable: usize,
}

async fn show_bid_document(
    State(endpoint): State<DocumentEndpoint>,
    Path(id): Path<String>,
) -> (StatusCode, Vec<u8>) {
    let hit = endpoint.hits.fetch_add(1, Ordering::SeqCst);
    if id == "missing" {
        return (StatusCode::NOT_FOUND, b"bid not found".to_vec());
    }
    if hit < endpoint.unavailable {
        return (StatusCode::SERVICE_UNAVAILABLE, Vec::new());
    }
    (StatusCode::OK, format!("%PDF-1.4 bid {id}").into_bytes())
}

async fn portal(unavailable: usize) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/showbidDocument/{id}", get(show_bid_document))
        .with_state(DocumentEndpoint {
            hits: hits.clone(),
            unavailable,
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

fn fetcher(max_retries: usize) -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: Some("tenderwatch-tests".to_string()),
        backoff: BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        },
    })
    .unwrap()
}

#[tokio::test]
async fn unavailable_portal_is_retried_until_the_document_arrives() {
    let (base, hits) = portal(2).await;
    let url = format!("{base}/showbidDocument/7712345");

    let fetched = fetcher(3).fetch_bytes(Uuid::new_v4(), &url).await.expect("fetched");
    assert_eq!(fetched.status.as_u16(), 200);
    assert_eq!(fetched.body, b"%PDF-1.4 bid 7712345");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn missing_document_fails_without_retrying() {
    let (base, hits) = portal(0).await;
    let url = format!("{base}/showbidDocument/missing");

    let err = fetcher(3).fetch_bytes(Uuid::new_v4(), &url).await.unwrap_err();
    match err {
        FetchError::HttpStatus { status, url } => {
            assert_eq!(status, 404);
            assert!(url.ends_with("/showbidDocument/missing"));
        }
        other => panic!("expected status error, got {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retries_stop_at_the_configured_bound() {
    let (base, hits) = portal(usize::MAX).await;
    let url = format!("{base}/showbidDocument/7712345");

    let err = fetcher(2).fetch_bytes(Uuid::new_v4(), &url).await.unwrap_err();
    assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}
