//! llmswap - swaps LLM backend servers on demand behind one OpenAI-compatible endpoint
//!
//! This library provides the process supervision, group coordination and HTTP surface used by
//! the `llmswap` binary. Requests name a model; the model's backend process is started (stopping
//! any conflicting siblings first) and the request is forwarded to it once it is healthy.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{any, get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod client;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod manager;
pub mod models;
pub mod multipart;
pub mod process;
pub mod process_group;
pub mod rewrite;

use client::{HttpClient, HyperClient};
use handlers::{
    cors, json_handler, models as models_handler, multipart_handler, not_found, running, unload,
    upstream_handler,
};
use manager::ProxyManager;

/// Routes whose JSON body names the model.
pub const JSON_ROUTES: &[&str] = &[
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/v1/rerank",
    "/v1/audio/speech",
];

/// The main application state containing the HTTP client and the process registry
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    pub http_client: T,
    pub manager: Arc<ProxyManager>,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(manager: Arc<ProxyManager>) -> Self {
        let http_client = client::create_hyper_client();
        Self {
            http_client,
            manager,
        }
    }
}

impl<T: HttpClient> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(manager: Arc<ProxyManager>, http_client: T) -> Self {
        Self {
            http_client,
            manager,
        }
    }
}

/// Build the main router for the proxy
/// This creates routes for:
/// - the JSON inference routes and `/v1/audio/transcriptions` - forwarded to the requested model
/// - `/v1/models`, `/running`, `/unload` - management endpoints
/// - `/upstream/{model}/{*path}` - raw pass-through to a model
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    let mut router = Router::new();
    for route in JSON_ROUTES {
        router = router.route(route, post(json_handler));
    }
    router
        .route("/v1/audio/transcriptions", post(multipart_handler))
        .route("/v1/models", get(models_handler))
        .route("/running", get(running))
        .route("/unload", get(unload))
        .route("/upstream/{model}/{*path}", any(upstream_handler))
        .fallback(not_found)
        .layer(middleware::from_fn(cors))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` names the metric family, e.g. `llmswap_http_requests_total`.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::MatchedPath)
        .with_default_metrics()
        .build_pair()
}
