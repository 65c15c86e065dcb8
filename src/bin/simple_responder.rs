//! Minimal backend server for testing llmswap
//!
//! `simple-responder --port 8001 --respond model1` answers inference requests with its `--respond`
//! value, which lets tests check which backend served a request.

use axum::{
    Json, Router,
    extract::{Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "simple-responder")]
#[command(about = "Test backend that responds with a fixed identity")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8001")]
    port: u16,

    /// Value returned as the response body
    #[arg(long, default_value = "hi")]
    respond: String,

    /// Artificial startup delay (ms)
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,
}

#[derive(Debug)]
struct ResponderState {
    respond: String,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionQuery {
    /// Delay before responding
    wait_ms: Option<u64>,
    /// Return the received body instead of the identity
    #[serde(default)]
    echo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("simple_responder=info")),
        )
        .init();

    let args = Args::parse();

    if args.startup_delay_ms > 0 {
        info!(delay_ms = args.startup_delay_ms, "Simulating startup delay");
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    let state = Arc::new(ResponderState {
        respond: args.respond.clone(),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(completions))
        .route("/v1/completions", post(completions))
        .route("/v1/audio/transcriptions", post(transcriptions))
        .fallback(identity)
        .with_state(state);

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    let actual_port = listener.local_addr()?.port();

    info!(respond = %args.respond, port = actual_port, "simple-responder listening");

    // Signal readiness to stdout for test harness
    println!("READY {actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    "OK"
}

async fn completions(
    State(state): State<Arc<ResponderState>>,
    Query(query): Query<CompletionQuery>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(wait_ms) = query.wait_ms {
        debug!(wait_ms, "Delaying response");
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
    }

    if query.echo {
        Json(body).into_response()
    } else {
        state.respond.clone().into_response()
    }
}

async fn transcriptions(mut multipart: Multipart) -> Response {
    let mut model = None;
    let mut file_len = None;

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let name = field.name().unwrap_or_default().to_string();
                let Ok(data) = field.bytes().await else {
                    return (StatusCode::BAD_REQUEST, "unreadable field").into_response();
                };
                match name.as_str() {
                    "model" => model = Some(String::from_utf8_lossy(&data).into_owned()),
                    "file" => file_len = Some(data.len()),
                    _ => {}
                }
            }
            Ok(None) => break,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        }
    }

    match (model, file_len) {
        (Some(model), Some(len)) => Json(json!({
            "model": model,
            "text": format!("The length of the file is {len} bytes"),
        }))
        .into_response(),
        _ => (StatusCode::BAD_REQUEST, "model and file fields are required").into_response(),
    }
}

async fn identity(State(state): State<Arc<ResponderState>>) -> impl IntoResponse {
    state.respond.clone()
}
