use std::sync::Arc;
use std::time::Duration;

use trawl_client::{FetcherConfig, ReqwestFetcher, register_builtin};
use trawl_core::registry::ParserRegistry;
use trawl_core::retry::RetryPolicy;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_USER_AGENT: &str = "trawl-test/1.0";

/// Fetcher pointed at a local mock server: private addresses allowed, short timeouts.
pub fn test_fetcher() -> ReqwestFetcher {
    ReqwestFetcher::new(
        FetcherConfig::default()
            .with_user_agent(TEST_USER_AGENT)
            .with_timeout(Duration::from_millis(500))
            .with_connect_timeout(Duration::from_millis(500))
            .allow_private_urls(),
    )
    .unwrap()
}

pub fn test_registry() -> Arc<ParserRegistry> {
    let mut registry = ParserRegistry::new();
    register_builtin(&mut registry).unwrap();
    Arc::new(registry)
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts)
        .with_backoff(Duration::from_millis(10), 2.0)
        .with_max_backoff(Duration::from_millis(100))
        .with_jitter(Duration::ZERO)
}

pub fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(
        format!("<html><head><title>Shop</title></head><body>{body}</body></html>"),
        "text/html; charset=utf-8",
    )
}

pub async fn mount_html(server: &MockServer, route: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(html(body))
        .mount(server)
        .await;
}
