use std::time::Duration;

use trawl_core::models::{ErrorKind, FetchOutcome};
use trawl_core::traits::Fetcher;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::common::{TEST_USER_AGENT, html, mount_html, test_fetcher};

#[tokio::test]
async fn fetch_returns_body_and_headers() {
    let server = MockServer::start().await;
    mount_html(&server, "/p/1", "<h1>Chef knife</h1>").await;

    let fetcher = test_fetcher();
    let session = fetcher.open_session(None).unwrap();
    let url = format!("{}/p/1", server.uri());
    let result = fetcher.fetch(&session, &url).await;

    assert!(result.is_success());
    assert_eq!(result.status, Some(200));
    assert!(result.body.contains("Chef knife"));
    assert!(
        result.headers["content-type"].starts_with("text/html"),
        "headers: {:?}",
        result.headers
    );
    assert_eq!(result.final_url, url);
}

#[tokio::test]
async fn fetch_sends_default_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(header("user-agent", TEST_USER_AGENT))
        .and(header("accept-language", "en-US,en;q=0.9"))
        .respond_with(html("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = test_fetcher();
    let session = fetcher.open_session(None).unwrap();
    let result = fetcher.fetch(&session, &format!("{}/", server.uri())).await;
    assert!(result.is_success(), "{}", result.failure_reason());
}

#[tokio::test]
async fn fetch_classifies_http_errors() {
    let server = MockServer::start().await;
    Mock::given(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(path("/busy"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "2"))
        .mount(&server)
        .await;

    let fetcher = test_fetcher();
    let session = fetcher.open_session(None).unwrap();

    let gone = fetcher.fetch(&session, &format!("{}/gone", server.uri())).await;
    assert_eq!(gone.outcome, FetchOutcome::PermanentFailure);
    assert_eq!(gone.error_kind, Some(ErrorKind::ClientError));

    let busy = fetcher.fetch(&session, &format!("{}/busy", server.uri())).await;
    assert_eq!(busy.outcome, FetchOutcome::TransientFailure);
    assert_eq!(busy.error_kind, Some(ErrorKind::ServerError));
    assert_eq!(busy.retry_after, Some(Duration::from_secs(2)));
}

#[tokio::test]
async fn fetch_rejects_unsupported_content_type() {
    let server = MockServer::start().await;
    Mock::given(path("/logo.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0x89, 0x50, 0x4e, 0x47], "image/png"))
        .mount(&server)
        .await;

    let fetcher = test_fetcher();
    let session = fetcher.open_session(None).unwrap();
    let result = fetcher.fetch(&session, &format!("{}/logo.png", server.uri())).await;

    assert_eq!(result.error_kind, Some(ErrorKind::UnsupportedContentType));
    assert_eq!(result.outcome, FetchOutcome::PermanentFailure);
    assert_eq!(result.status, Some(200));
}

#[tokio::test]
async fn fetch_times_out_slow_responses() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(html("late").set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let fetcher = test_fetcher();
    let session = fetcher.open_session(None).unwrap();
    let result = fetcher.fetch(&session, &format!("{}/slow", server.uri())).await;

    assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(result.outcome, FetchOutcome::TransientFailure);
}

#[tokio::test]
async fn fetch_reports_connection_failures() {
    let fetcher = test_fetcher();
    let session = fetcher.open_session(None).unwrap();
    let result = fetcher.fetch(&session, "http://127.0.0.1:1/").await;

    assert!(matches!(
        result.error_kind,
        Some(ErrorKind::Connection | ErrorKind::Timeout)
    ));
    assert_eq!(result.status, None);
}

#[tokio::test]
async fn fetch_follows_redirects() {
    let server = MockServer::start().await;
    Mock::given(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
        .mount(&server)
        .await;
    mount_html(&server, "/new", "moved").await;

    let fetcher = test_fetcher();
    let session = fetcher.open_session(None).unwrap();
    let result = fetcher.fetch(&session, &format!("{}/old", server.uri())).await;

    assert!(result.is_success());
    assert_eq!(result.url, format!("{}/old", server.uri()));
    assert_eq!(result.final_url, format!("{}/new", server.uri()));
}
