//! Error taxonomy for relay dispatch and delivery.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("unknown relay '{0}'")]
    UnknownRelay(String),

    #[error("method '{method}' does not exist on relay '{relay}'")]
    UnknownMethod { relay: String, method: String },

    #[error("relay '{0}' is already registered")]
    DuplicateRelay(String),

    #[error("method '{method}' declared twice on relay '{relay}'")]
    DuplicateMethod { relay: String, method: String },

    #[error("{relay}.{method} expects {expected} arguments, got {got}")]
    ArgumentMismatch {
        relay: String,
        method: String,
        expected: usize,
        got: usize,
    },

    #[error("malformed message: {0}")]
    Decode(String),

    #[error("no client with connection id '{0}'")]
    UnknownClient(String),

    #[error("unknown transport '{0}'")]
    UnknownTransport(String),

    #[error("connection '{connection_id}' was negotiated for {expected}")]
    TransportMismatch {
        connection_id: String,
        expected: String,
    },

    #[error("connection '{0}' is not known to the transport")]
    DeliveryMiss(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl RelayError {
    /// Short machine-readable code, used in JSON error bodies.
    pub fn error_code(&self) -> &str {
        match self {
            Self::UnknownRelay(_) => "unknown_relay",
            Self::UnknownMethod { .. } => "unknown_method",
            Self::DuplicateRelay(_) => "duplicate_relay",
            Self::DuplicateMethod { .. } => "duplicate_method",
            Self::ArgumentMismatch { .. } => "argument_mismatch",
            Self::Decode(_) => "decode_error",
            Self::UnknownClient(_) => "unknown_client",
            Self::UnknownTransport(_) => "unknown_transport",
            Self::TransportMismatch { .. } => "transport_mismatch",
            Self::DeliveryMiss(_) => "delivery_miss",
            Self::ConnectionLost(_) => "connection_lost",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownRelay(_) | Self::UnknownMethod { .. } | Self::UnknownClient(_) => {
                StatusCode::NOT_FOUND
            }
            Self::DuplicateRelay(_) | Self::DuplicateMethod { .. } => StatusCode::CONFLICT,
            Self::ArgumentMismatch { .. }
            | Self::Decode(_)
            | Self::UnknownTransport(_)
            | Self::TransportMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::DeliveryMiss(_) | Self::ConnectionLost(_) => StatusCode::GONE,
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Decode(err.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.error_code(),
        }));
        (self.status_code(), body).into_response()
    }
}
