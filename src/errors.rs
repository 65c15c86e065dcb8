use crate::process::ProcessError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Errors surfaced to HTTP clients
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    BadRequest(String),

    #[error("could not find real modelID for {0}")]
    ModelNotFound(String),

    #[error("unable to start process: {0}")]
    Process(#[from] ProcessError),

    #[error("error proxying request: {0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Process(_) | ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "invalid_request_error",
            ProxyError::ModelNotFound(_) => "model_not_found",
            ProxyError::Process(_) => "process_error",
            ProxyError::Upstream(_) => "upstream_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}
