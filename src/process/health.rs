//! Health polling for freshly launched backends

use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};
use url::Url;

/// Delay between health check attempts.
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound on a single health check request.
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub type HealthClient = Client<HttpConnector, Empty<Bytes>>;

pub fn health_client() -> HealthClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// How polling ended, short of a timeout or cancellation imposed by the caller.
#[derive(Debug)]
pub enum PollOutcome {
    Healthy,
    Exited(ExitStatus),
}

/// Issue one GET against the health URL.
pub async fn check_health(client: &HealthClient, url: &Url) -> Result<bool, String> {
    let uri: hyper::Uri = url
        .as_str()
        .parse()
        .map_err(|e| format!("Invalid URL: {e}"))?;

    let request = hyper::Request::builder()
        .method("GET")
        .uri(uri)
        .body(Empty::new())
        .map_err(|e| format!("Failed to build request: {e}"))?;

    match tokio::time::timeout(HEALTH_REQUEST_TIMEOUT, client.request(request)).await {
        Ok(Ok(response)) => Ok(response.status().is_success()),
        Ok(Err(e)) => Err(format!("Request failed: {e}")),
        Err(_) => Err("Health check timeout".to_string()),
    }
}

/// Poll `url` until it answers with a 2xx or the child exits.
///
/// Never returns on its own otherwise; callers bound it with a timeout and a cancellation token.
pub async fn poll_until_healthy(
    client: &HealthClient,
    url: &Url,
    child: &mut Child,
    model: &str,
) -> PollOutcome {
    loop {
        match check_health(client, url).await {
            Ok(true) => return PollOutcome::Healthy,
            Ok(false) => debug!(model = %model, "Health check returned unhealthy, retrying"),
            Err(e) => debug!(model = %model, error = %e, "Health check failed, retrying"),
        }

        match child.try_wait() {
            Ok(Some(status)) => return PollOutcome::Exited(status),
            Ok(None) => {}
            Err(e) => warn!(model = %model, error = %e, "Failed to check process status"),
        }

        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
}
