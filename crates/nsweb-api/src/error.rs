//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

/// Error returned by every handler, rendered as `{"error": message}`.
#[derive(Debug)]
pub enum ApiError {
    Internal(nsweb_core::Error),
    Computation(String),
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    BadGateway(String),
}

impl From<nsweb_core::Error> for ApiError {
    fn from(err: nsweb_core::Error) -> Self {
        match &err {
            nsweb_core::Error::NotFound(_) => ApiError::NotFound(err.to_string()),
            nsweb_core::Error::Validation(msg) => ApiError::BadRequest(msg.clone()),
            nsweb_core::Error::Forbidden(msg) => ApiError::Forbidden(msg.clone()),
            nsweb_core::Error::Upstream(msg) => ApiError::BadGateway(msg.clone()),
            nsweb_core::Error::Computation(_) => ApiError::Computation(err.to_string()),
            _ => ApiError::Internal(err),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Internal(_) | ApiError::Computation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let message = match self {
            ApiError::Internal(err) => {
                tracing::error!(subsystem = "api", error = %err, "Request failed");
                err.to_string()
            }
            ApiError::Computation(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::BadRequest(msg)
            | ApiError::BadGateway(msg) => msg,
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
