/// Axum handlers for the proxy server
use crate::AppState;
use crate::client::{self, HttpClient};
use crate::errors::ProxyError;
use crate::models::{ListModelResponse, RunningResponse};
use crate::multipart::{encode_form, form_value, read_form, set_form_value};
use crate::process::InFlightGuard;
use crate::rewrite;
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Request, State},
    http::{
        HeaderValue, Method, StatusCode,
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS,
            CONTENT_LENGTH, CONTENT_TYPE, ORIGIN,
        },
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, error, info, instrument};

const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const DEFAULT_ALLOWED_HEADERS: &str = "Content-Type, Authorization, Accept, X-Requested-With";

/// Handler for the JSON inference routes.
///
/// Reads the `model` field, applies the model's body rewrites, makes the model ready and forwards
/// the request to it.
#[instrument(skip(state, req), fields(path = %req.uri().path()))]
pub async fn json_handler<T: HttpClient>(
    State(state): State<AppState<T>>,
    req: Request,
) -> Result<Response, ProxyError> {
    let (mut parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::BadRequest(format!("could not read request body: {e}")))?;
    debug!("Received request body of size: {}", body_bytes.len());

    let mut body: Value = serde_json::from_slice(&body_bytes)
        .map_err(|e| ProxyError::BadRequest(format!("invalid JSON body: {e}")))?;
    let requested = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::BadRequest("missing or invalid 'model' key".to_string()))?
        .to_string();

    let (model_id, model_config) = state
        .manager
        .resolve(&requested)
        .ok_or_else(|| ProxyError::ModelNotFound(requested.clone()))?;
    info!(requested = %requested, model = %model_id, "Received request");

    let body_bytes = if rewrite::apply_model_rewrites(&mut body, model_config) {
        debug!(model = %model_id, "Rewrote request body");
        Bytes::from(
            serde_json::to_vec(&body)
                .map_err(|e| ProxyError::Internal(format!("could not encode body: {e}")))?,
        )
    } else {
        body_bytes
    };
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(body_bytes.len()));

    let guard = state.manager.ensure_ready(model_id).await.map_err(|e| {
        error!(model = %model_id, error = %e, "Failed to make model ready");
        ProxyError::from(e)
    })?;

    let path_and_query = path_and_query(&parts.uri);
    let req = Request::from_parts(parts, Body::from(body_bytes));
    forward(&state, req, guard, &path_and_query).await
}

/// Handler for `multipart/form-data` routes, which carry the model as a form field.
#[instrument(skip(state, req), fields(path = %req.uri().path()))]
pub async fn multipart_handler<T: HttpClient>(
    State(state): State<AppState<T>>,
    req: Request,
) -> Result<Response, ProxyError> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let mut headers = req.headers().clone();

    let mut fields = read_form(req).await?;
    let requested = form_value(&fields, "model")
        .ok_or_else(|| ProxyError::BadRequest("missing or invalid 'model' parameter".to_string()))?
        .to_string();

    let (model_id, model_config) = state
        .manager
        .resolve(&requested)
        .ok_or_else(|| ProxyError::ModelNotFound(requested.clone()))?;
    info!(requested = %requested, model = %model_id, "Received multipart request");

    if let Some(name) = &model_config.use_model_name {
        set_form_value(&mut fields, "model", name);
    }
    let (content_type, body) = encode_form(&fields);
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .map_err(|e| ProxyError::Internal(format!("invalid content type: {e}")))?,
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

    let guard = state.manager.ensure_ready(model_id).await.map_err(|e| {
        error!(model = %model_id, error = %e, "Failed to make model ready");
        ProxyError::from(e)
    })?;

    let path_and_query = path_and_query(&uri);
    let mut req = Request::new(Body::from(body));
    *req.method_mut() = method;
    *req.uri_mut() = uri;
    *req.headers_mut() = headers;
    forward(&state, req, guard, &path_and_query).await
}

/// Raw pass-through to a model, with the `/upstream/{model}` prefix removed.
#[instrument(skip(state, req))]
pub async fn upstream_handler<T: HttpClient>(
    State(state): State<AppState<T>>,
    Path((requested, path)): Path<(String, String)>,
    req: Request,
) -> Result<Response, ProxyError> {
    let (model_id, _) = state
        .manager
        .resolve(&requested)
        .ok_or_else(|| ProxyError::ModelNotFound(requested.clone()))?;

    let guard = state.manager.ensure_ready(model_id).await?;

    let path = path.trim_start_matches('/');
    let path_and_query = match req.uri().query() {
        Some(query) => format!("/{path}?{query}"),
        None => format!("/{path}"),
    };
    forward(&state, req, guard, &path_and_query).await
}

/// Send `req` to the backend behind `guard` and stream the response back.
///
/// The guard moves into the response body, so the request counts as in flight until the body has
/// been fully sent or dropped.
async fn forward<T: HttpClient>(
    state: &AppState<T>,
    mut req: Request,
    guard: InFlightGuard,
    path_and_query: &str,
) -> Result<Response, ProxyError> {
    let model = guard.process().id().to_string();
    let method = req.method().clone();

    client::retarget(&mut req, guard.address(), path_and_query).map_err(ProxyError::Internal)?;
    debug!(model = %model, uri = %req.uri(), "Forwarding request");

    let response = state.http_client.request(req).await.map_err(|e| {
        error!(model = %model, error = %e, "Error forwarding request");
        ProxyError::Upstream(e.to_string())
    })?;

    if state.manager.config().log_requests {
        info!(
            model = %model,
            method = %method,
            path = %path_and_query,
            status = response.status().as_u16(),
            "Proxied request"
        );
    }

    let (parts, body) = response.into_parts();
    let body = body.into_data_stream().map(move |chunk| {
        guard.touch();
        chunk
    });
    Ok(Response::from_parts(parts, Body::from_stream(body)))
}

fn path_and_query(uri: &axum::http::Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(uri.path())
        .to_string()
}

#[instrument(skip(state))]
pub async fn models<T: HttpClient>(State(state): State<AppState<T>>) -> impl IntoResponse {
    Json(ListModelResponse::from_ids(state.manager.listed_models()))
}

#[instrument(skip(state))]
pub async fn running<T: HttpClient>(State(state): State<AppState<T>>) -> impl IntoResponse {
    Json(RunningResponse::new(state.manager.running()))
}

#[instrument(skip(state))]
pub async fn unload<T: HttpClient>(State(state): State<AppState<T>>) -> impl IntoResponse {
    info!("Unloading all models");
    state.manager.unload_all().await;
    "OK"
}

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

/// Answer CORS pre-flight requests and echo the caller's origin on everything else.
pub async fn cors(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let allow_headers = req
            .headers()
            .get(ACCESS_CONTROL_REQUEST_HEADERS)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_ALLOWED_HEADERS));
        return (
            StatusCode::NO_CONTENT,
            [
                (ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
                (
                    ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static(ALLOWED_METHODS),
                ),
                (ACCESS_CONTROL_ALLOW_HEADERS, allow_headers),
                (ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400")),
            ],
        )
            .into_response();
    }

    let origin = req.headers().get(ORIGIN).cloned();
    let mut response = next.run(req).await;
    if let Some(origin) = origin {
        response
            .headers_mut()
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    }
    response
}
