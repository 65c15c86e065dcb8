//! HTTP client abstraction for forwarding requests to backend processes
//!
//! The proxy only talks to backends through [`HttpClient`], so tests can swap in a client that
//! records requests instead of sending them.
use async_trait::async_trait;
use axum::http::{HeaderValue, Uri, header};
use axum::response::IntoResponse;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use url::Url;

/// Headers that only apply to the client connection and are not sent to backends.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub type HyperClient = Client<
    hyper_tls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    axum::body::Body,
>;

#[async_trait]
pub trait HttpClient: std::fmt::Debug {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>>;
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
        self.request(req)
            .await
            .map(|res| res.into_response())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }
}

pub fn create_hyper_client() -> HyperClient {
    // Backends are local, but a proxy override may point at an https address
    let https = hyper_tls::HttpsConnector::new();

    let pool_idle_timeout_secs = std::env::var("LLMSWAP_POOL_IDLE_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(90);

    let pool_max_idle_per_host = std::env::var("LLMSWAP_POOL_MAX_IDLE_PER_HOST")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(100);

    tracing::debug!(
        "HTTP client pool config: idle_timeout={}s, max_idle_per_host={}",
        pool_idle_timeout_secs,
        pool_max_idle_per_host
    );

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(std::time::Duration::from_secs(pool_idle_timeout_secs))
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_timer(hyper_util::rt::TokioTimer::new())
        .build(https)
}

/// Point `req` at the backend listening on `address`.
///
/// `path_and_query` is appended to the path of `address`, so the request always stays on the
/// backend's scheme, host and port. The Host header is replaced to match the backend and
/// hop-by-hop headers are removed.
pub fn retarget(
    req: &mut axum::extract::Request,
    address: &Url,
    path_and_query: &str,
) -> Result<(), String> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    let mut upstream = address.clone();
    upstream.set_path(&format!(
        "{}/{}",
        address.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    ));
    upstream.set_query(query);
    if upstream.origin() != address.origin() {
        return Err(format!("upstream path {path_and_query} leaves {address}"));
    }
    let uri = Uri::try_from(upstream.as_str())
        .map_err(|e| format!("invalid upstream uri {upstream}: {e}"))?;

    let host = match (uri.host(), uri.port_u16()) {
        (Some(host), Some(port)) => Some(format!("{host}:{port}")),
        (Some(host), None) => Some(host.to_string()),
        _ => None,
    };
    *req.uri_mut() = uri;

    let headers = req.headers_mut();
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    if let Some(host) = host.and_then(|host| HeaderValue::from_str(&host).ok()) {
        headers.insert(header::HOST, host);
    }
    Ok(())
}
