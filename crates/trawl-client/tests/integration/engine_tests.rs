use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use trawl_client::{CsvSink, JsonLinesSink};
use trawl_core::engine::ScrapeEngine;
use trawl_core::job::{JobStatus, ScrapeJob};
use trawl_core::metrics::{AtomicMetrics, Counter};
use trawl_core::proxy::ProxyPool;
use trawl_core::transport::HttpTransport;
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::common::{fast_retry, html, mount_html, test_fetcher, test_registry};

#[tokio::test]
async fn transport_retries_server_errors_until_success() {
    let server = MockServer::start().await;
    Mock::given(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(path("/flaky"))
        .respond_with(html("finally"))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(test_fetcher(), ProxyPool::empty(), fast_retry(3));
    let result = transport
        .fetch(&format!("{}/flaky", server.uri()))
        .await
        .unwrap();

    assert!(result.is_success());
    assert!(result.body.contains("finally"));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn selector_job_follows_pagination_into_csv() {
    let server = MockServer::start().await;
    mount_html(
        &server,
        "/knives",
        r#"<div class="product" data-sku="KN-1"><h2>Chef knife</h2><span class="price">45</span></div>
           <div class="product" data-sku="KN-2"><h2>Paring knife</h2><span class="price">12</span></div>
           <a class="next" href="/knives/2">next</a>"#,
    )
    .await;
    mount_html(
        &server,
        "/knives/2",
        r#"<div class="product" data-sku="KN-3"><h2>Bread knife</h2><span class="price">30</span></div>
           <div class="product" data-sku="KN-1"><h2>Chef knife</h2><span class="price">45</span></div>
           <a class="next" href="/knives">back</a>"#,
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("knives.csv");
    let sink = CsvSink::create(&out, b',').unwrap();
    let metrics = Arc::new(AtomicMetrics::new());

    let job = ScrapeJob::new("selector", [format!("{}/knives", server.uri())])
        .with_parser_settings(json!({
            "item": ".product",
            "fields": {"sku": "@data-sku", "name": "h2", "price": ".price"},
            "follow": "a.next"
        }))
        .with_max_depth(3)
        .with_primary_keys(["sku"])
        .with_concurrency(2);

    let summary = ScrapeEngine::new(test_fetcher(), ProxyPool::empty(), test_registry(), sink)
        .with_metrics(metrics.clone())
        .run(job, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.discovered, 1);
    assert_eq!(summary.records_stored, 3);
    assert_eq!(summary.records_duplicate, 1);
    assert_eq!(metrics.get(Counter::Fetched), 2);

    let content = std::fs::read_to_string(&out).unwrap();
    let mut lines = content.lines();
    assert_eq!(lines.next(), Some("name,price,sku,source_url,scraped_at"));
    let mut skus: Vec<&str> = lines.map(|l| l.split(',').nth(2).unwrap()).collect();
    skus.sort_unstable();
    assert_eq!(skus, vec!["KN-1", "KN-2", "KN-3"]);
}

#[tokio::test]
async fn failed_urls_are_listed_in_summary() {
    let server = MockServer::start().await;
    mount_html(&server, "/ok", "fine").await;
    Mock::given(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(path("/down"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let sink = JsonLinesSink::create(&dir.path().join("out.jsonl")).unwrap();
    let job = ScrapeJob::new(
        "links",
        ["/ok", "/missing", "/down"].map(|p| format!("{}{p}", server.uri())),
    )
    .with_retry(fast_retry(2));

    let summary = ScrapeEngine::new(test_fetcher(), ProxyPool::empty(), test_registry(), sink)
        .run(job, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.permanently_failed, 2);
    assert_eq!(summary.attempts, 4);

    let mut failures = summary.failures.clone();
    failures.sort_by(|a, b| a.url.cmp(&b.url));
    assert!(failures[0].url.ends_with("/down"));
    assert_eq!(failures[0].attempts, 2);
    assert!(failures[0].reason.contains("502"));
    assert!(failures[1].url.ends_with("/missing"));
    assert_eq!(failures[1].attempts, 1);

    let written = std::fs::read_to_string(dir.path().join("out.jsonl")).unwrap();
    assert_eq!(written.lines().count(), 1);
}
