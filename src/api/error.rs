//! HTTP-side failures of the gateway and how they are reported to callers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    /// The listen address could not be bound
    #[error("Cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The HTTP server stopped with an error
    #[error("HTTP server failed: {0}")]
    Server(String),

    /// The gateway is up but should not receive traffic yet
    #[error("Gateway not ready: {0}")]
    NotReady(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Bind { .. } | ApiError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Bind { .. } => "bind_failed",
            ApiError::Server(_) => "server_failed",
            ApiError::NotReady(_) => "not_ready",
        }
    }
}

/// JSON body of an error reply
#[derive(Debug, Serialize)]
struct ErrorReply {
    code: &'static str,
    message: String,
    request_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let reply = ErrorReply {
            code: self.code(),
            message: self.to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
        };

        // Readiness failures are routine while the handoff queue drains.
        if matches!(self, ApiError::NotReady(_)) {
            tracing::warn!(request_id = %reply.request_id, reason = %self, "Rejected request");
        } else {
            tracing::error!(request_id = %reply.request_id, code = reply.code, error = %self, "Request failed");
        }

        (self.status(), Json(reply)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
