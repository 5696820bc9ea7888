//! Error codes and simple error responses produced by the controller

use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::io;

/// Body type of every response the controller produces
pub type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

/// Header carrying the error code on responses the controller generated itself
pub const ERROR_HEADER: &str = "x-appgate-error";

/// Error codes for controller errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or malformed Host header
    MissingHostHeader,
    /// No application is configured for the host
    UnknownHost,
    /// Request carries both Content-Length and chunked Transfer-Encoding
    InvalidRequestFraming,
    /// Untrusted peer sent `!~` headers
    SecureHeadersNotAllowed,
    /// The client's request body could not be read
    RequestBodyError,
    /// Group or pool wait-list is full
    RequestQueueFull,
    /// No worker became available within the app's queue time limit
    RequestQueueTimeout,
    /// The application could not be spawned
    SpawnFailed,
    /// A spawn step exceeded its deadline
    SpawnTimeout,
    /// The pool is shutting down
    ShuttingDown,
    /// Could not connect to the worker's socket
    AppConnectFailed,
    /// The worker's response was unreadable or malformed
    AppResponseError,
    InternalError,
}

impl ErrorCode {
    /// Default HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ErrorCode::InvalidRequestFraming => StatusCode::BAD_REQUEST,
            ErrorCode::SecureHeadersNotAllowed => StatusCode::BAD_REQUEST,
            ErrorCode::RequestBodyError => StatusCode::BAD_REQUEST,
            ErrorCode::RequestQueueFull => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::RequestQueueTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::SpawnFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::SpawnTimeout => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::AppConnectFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::AppResponseError => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the X-Appgate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ErrorCode::UnknownHost => "UNKNOWN_HOST",
            ErrorCode::InvalidRequestFraming => "INVALID_REQUEST_FRAMING",
            ErrorCode::SecureHeadersNotAllowed => "SECURE_HEADERS_NOT_ALLOWED",
            ErrorCode::RequestBodyError => "REQUEST_BODY_ERROR",
            ErrorCode::RequestQueueFull => "REQUEST_QUEUE_FULL",
            ErrorCode::RequestQueueTimeout => "REQUEST_QUEUE_TIMEOUT",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::SpawnTimeout => "SPAWN_TIMEOUT",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ErrorCode::AppConnectFailed => "APP_CONNECT_FAILED",
            ErrorCode::AppResponseError => "APP_RESPONSE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// A complete in-memory body
pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed_unsync()
}

/// JSON error response with the X-Appgate-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<ResponseBody> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header(ERROR_HEADER, code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// HTML error page. `status` overrides the code's default status.
pub fn html_error_response(code: ErrorCode, status: StatusCode, html: String) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/html; charset=utf-8")
        .header("Cache-Control", "no-store")
        .header(ERROR_HEADER, code.as_header_value())
        .body(full_body(html))
        .expect("valid response with StatusCode and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ErrorCode::MissingHostHeader.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::UnknownHost.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::RequestQueueFull.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::RequestQueueTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorCode::SpawnTimeout.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ErrorCode::AppResponseError.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ErrorCode::UnknownHost, "Host not found: example.com");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_HOST\""));
        assert!(json.contains("\"message\":\"Host not found: example.com\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ErrorCode::InvalidRequestFraming, "bad framing");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(response.headers().get(ERROR_HEADER).unwrap(), "INVALID_REQUEST_FRAMING");
    }

    #[test]
    fn test_html_error_response_uses_given_status() {
        let response = html_error_response(
            ErrorCode::RequestQueueFull,
            StatusCode::from_u16(529).unwrap(),
            "<html></html>".into(),
        );
        assert_eq!(response.status().as_u16(), 529);
        assert_eq!(response.headers().get(ERROR_HEADER).unwrap(), "REQUEST_QUEUE_FULL");
        assert!(response
            .headers()
            .get("Content-Type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/html"));
    }
}
