use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use trawl_core::config::RequestConfig;
use trawl_core::error::AppError;
use trawl_core::models::{ErrorKind, FetchResult};
use trawl_core::proxy::ProxyAddress;
use trawl_core::traits::Fetcher;
use url::Url;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; Trawl/0.1; +https://github.com/trawl-rs/trawl)";

/// Settings shared by every session a [`ReqwestFetcher`] opens.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Media type prefixes a successful response may carry. Empty accepts anything.
    pub accepted_content_types: Vec<String>,
    /// Sent with every request. Names are lowercase.
    pub headers: BTreeMap<String, String>,
    /// Refuse private/reserved target addresses.
    pub ssrf_protection: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            accepted_content_types: vec![
                "text/html".to_string(),
                "application/xhtml+xml".to_string(),
                "application/xml".to_string(),
                "text/xml".to_string(),
                "text/plain".to_string(),
                "application/json".to_string(),
            ],
            headers: BTreeMap::from([
                (
                    "accept".to_string(),
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
                ),
                ("accept-language".to_string(), "en-US,en;q=0.9".to_string()),
            ]),
            ssrf_protection: true,
        }
    }
}

impl FetcherConfig {
    /// Defaults overlaid with a job's request settings.
    pub fn from_request(request: &RequestConfig) -> Self {
        let mut config = Self::default().with_timeout(Duration::from_millis(request.timeout_ms));
        if let Some(agent) = &request.user_agent {
            config = config.with_user_agent(agent);
        }
        for (name, value) in &request.headers {
            config = config.with_header(name, value);
        }
        config
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_accepted_content_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted_content_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    ///
    /// Only use this for CLI usage where the user controls the machine.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    fn accepts(&self, content_type: Option<&str>) -> bool {
        let Some(content_type) = content_type else {
            return true;
        };
        if self.accepted_content_types.is_empty() {
            return true;
        }
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.accepted_content_types
            .iter()
            .any(|accepted| media_type.starts_with(accepted.as_str()))
    }

    fn header_map(&self) -> Result<HeaderMap, AppError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| AppError::ConfigError(format!("Invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                AppError::ConfigError(format!("Invalid value for header '{name}': {e}"))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

/// One reqwest connection pool, direct or routed through a single proxy.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: Client,
    proxied: bool,
}

impl HttpSession {
    pub fn is_proxied(&self) -> bool {
        self.proxied
    }
}

/// HTTP fetcher using reqwest.
///
/// Every session is its own `reqwest::Client` (connection pool), optionally routed
/// through one proxy. By default, SSRF protection is **enabled**: requests to
/// private/reserved IP ranges are refused. Proxied sessions leave name resolution
/// to the proxy, so only IP-literal targets are checked for them.
#[derive(Clone)]
pub struct ReqwestFetcher {
    config: Arc<FetcherConfig>,
}

impl ReqwestFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, AppError> {
        // Surface bad headers at construction rather than on the first session.
        config.header_map()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    fn build_client(&self, proxy: Option<&ProxyAddress>) -> Result<Client, AppError> {
        let mut builder = Client::builder()
            .user_agent(self.config.user_agent.as_str())
            .timeout(self.config.timeout)
            .connect_timeout(self.config.connect_timeout)
            .default_headers(self.config.header_map()?);

        builder = match proxy {
            Some(address) => {
                let proxy = reqwest::Proxy::all(address.url()).map_err(|e| {
                    AppError::ConfigError(format!("Invalid proxy {address}: {e}"))
                })?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        builder
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))
    }
}

impl Fetcher for ReqwestFetcher {
    type Session = HttpSession;

    fn open_session(&self, proxy: Option<&ProxyAddress>) -> Result<HttpSession, AppError> {
        tracing::debug!(proxy = %proxy.map(ToString::to_string).unwrap_or_default(), "Opening HTTP session");
        Ok(HttpSession {
            client: self.build_client(proxy)?,
            proxied: proxy.is_some(),
        })
    }

    async fn fetch(&self, session: &HttpSession, url: &str) -> FetchResult {
        let resolve = if session.proxied {
            Resolve::Skip
        } else {
            Resolve::Local
        };
        if self.config.ssrf_protection
            && let Err(e) = validate_url(url, resolve).await
        {
            let kind = match &e {
                AppError::TransientNetworkError { kind, .. } => *kind,
                _ => ErrorKind::ClientError,
            };
            return FetchResult::from_error(url, kind, e.to_string());
        }

        let response = match session.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return FetchResult::from_error(url, classify_error(&e), e.to_string()),
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        if response.status().is_success() {
            let content_type = headers.get("content-type").map(String::as_str);
            if !self.config.accepts(content_type) {
                let mut result = FetchResult::from_error(
                    url,
                    ErrorKind::UnsupportedContentType,
                    format!("content type '{}'", content_type.unwrap_or_default()),
                )
                .with_final_url(final_url);
                result.status = Some(status);
                result.headers = headers;
                return result;
            }
        }

        match response.text().await {
            Ok(body) => FetchResult::from_status(url, status, body, headers).with_final_url(final_url),
            Err(e) => {
                let kind = if e.is_timeout() {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Body
                };
                let mut result =
                    FetchResult::from_error(url, kind, format!("Failed to read response body: {e}"))
                        .with_final_url(final_url);
                result.status = Some(status);
                result.headers = headers;
                result
            }
        }
    }
}

fn classify_error(e: &reqwest::Error) -> ErrorKind {
    if e.is_timeout() {
        ErrorKind::Timeout
    } else if e.is_redirect() {
        ErrorKind::UnexpectedStatus
    } else if e.is_builder() {
        ErrorKind::ClientError
    } else {
        ErrorKind::Connection
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Whether [`validate_url`] looks hostnames up itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolve {
    Local,
    /// The proxy resolves names (socks5h, HTTP CONNECT).
    Skip,
}

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Reject private/reserved IP literals.
/// 3. With [`Resolve::Local`], resolve the hostname via DNS and reject if any
///    resolved IP is private/reserved.
async fn validate_url(url: &str, resolve: Resolve) -> Result<(), AppError> {
    let invalid = |reason: String| AppError::InvalidUrl {
        url: url.to_string(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(invalid(format!(
                "scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| invalid("URL has no host".to_string()))?;

    // IP literals are checked directly; IPv6 hosts come bracketed.
    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(invalid(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }
    if resolve == Resolve::Skip {
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::TransientNetworkError {
            kind: ErrorKind::Connection,
            message: format!("DNS resolution failed for {host}: {e}"),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::TransientNetworkError {
            kind: ErrorKind::Connection,
            message: format!("DNS resolution returned no addresses for {host}"),
        });
    }

    for socket_addr in &addrs {
        if is_private_ip(socket_addr.ip()) {
            return Err(invalid(format!(
                "SSRF blocked: {host} resolves to private/reserved IP {}",
                socket_addr.ip()
            )));
        }
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254.0.0/16 (cloud metadata)
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}
