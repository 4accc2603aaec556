use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::error::{NetworkError, NetworkResult};
use crate::request::{Credentials, Request, RequestMode};
use crate::response::{Response, ResponseType, HEADER_VALUE_SEPARATOR};

/// Headers that carry ambient credentials
const CREDENTIAL_HEADERS: &[&str] = &["cookie", "authorization", "proxy-authorization"];

/// Hop-by-hop headers never forwarded upstream
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
    "host",
    "content-length",
];

/// Performs the actual network fetch for the interceptor.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> NetworkResult<Response>;
}

/// Fetcher settings
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Used when the request carries no timeout of its own
    pub default_timeout: Duration,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            user_agent: format!("citadel-edge/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Network fetcher backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> NetworkResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, config })
    }

    fn to_reqwest(&self, request: &Request) -> NetworkResult<reqwest::Request> {
        let method = reqwest::Method::from_bytes(request.method().to_string().as_bytes())
            .map_err(|e| NetworkError::ResourceError(format!("Invalid method: {}", e)))?;
        let mut builder = self.client.request(method, request.url().clone());

        for (name, value) in request.headers() {
            let lower = name.to_ascii_lowercase();
            if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            if request.credentials() == Credentials::Omit
                && CREDENTIAL_HEADERS.contains(&lower.as_str())
            {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }

        builder.build().map_err(NetworkError::HttpError)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> NetworkResult<Response> {
        let timeout_duration = request.timeout().unwrap_or(self.config.default_timeout);
        let outgoing = self.to_reqwest(request)?;

        let upstream = match timeout(timeout_duration, self.client.execute(outgoing)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(classify_reqwest_error(e, timeout_duration)),
            Err(_) => return Err(NetworkError::TimeoutError(timeout_duration)),
        };

        let status = upstream.status();
        let final_url = upstream.url().clone();
        let headers = collect_headers(upstream.headers());

        let body = upstream
            .bytes()
            .await
            .map_err(|e| NetworkError::ConnectionError(format!("Failed to read response body: {}", e)))?;

        let cross_origin = final_url.origin() != request.url().origin();
        let response_type = if request.mode() == RequestMode::Cors && cross_origin {
            ResponseType::Cors
        } else {
            ResponseType::Basic
        };

        log::trace!(
            "Fetched method={} url={} status={}",
            request.method(),
            final_url,
            status.as_u16()
        );

        let mut response = Response::new(status.as_u16(), headers, body, final_url, request.method().clone())
            .with_response_type(response_type);
        if let Some(reason) = status.canonical_reason() {
            response = response.with_status_text(reason);
        }
        Ok(response)
    }
}

/// Upstream headers keyed by name, repeated headers joined in order.
fn collect_headers(upstream: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in upstream.iter() {
        let value = String::from_utf8_lossy(value.as_bytes());
        headers
            .entry(name.to_string())
            .and_modify(|existing| {
                existing.push(HEADER_VALUE_SEPARATOR);
                existing.push_str(&value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}

fn classify_reqwest_error(error: reqwest::Error, timeout_duration: Duration) -> NetworkError {
    if error.is_timeout() {
        NetworkError::TimeoutError(timeout_duration)
    } else if error.is_connect() {
        NetworkError::ConnectionError(error.to_string())
    } else {
        NetworkError::HttpError(error)
    }
}
