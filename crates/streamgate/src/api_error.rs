use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::Serialize;

/// The only errors the HTTP façade itself produces: request-shape failures. Everything a
/// stream does internally after creation is reported through the registry's `(status,
/// error_message)` pair instead, per the error propagation policy.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_input",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal_error",
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct Body<'a> {
    error_kind: &'a str,
    message: &'a str,
    status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Body {
            error_kind: self.kind,
            message: &self.message,
            status: self.status.as_u16(),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<streamgate_core::Error> for ApiError {
    fn from(e: streamgate_core::Error) -> Self {
        match e {
            streamgate_core::Error::InvalidInput(m) => ApiError::invalid_input(m),
            streamgate_core::Error::NotFound => ApiError::not_found("stream not found"),
            other => ApiError::internal(other.to_string()),
        }
    }
}
