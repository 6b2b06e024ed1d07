//! HTTP response building helpers
//!
//! Every JSON body is an [`ApiResponse`] envelope: `{success, message, data}`.
//! Errors carry `success: false` and the error kind; internal failures are
//! reported with a generic retry message, the detail goes to the log.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{header, HeaderMap, Response, StatusCode};
use serde::Serialize;
use tracing::error;

use crate::error::LedgerError;

/// Message returned for storage failures that rolled back
pub const RETRY_MESSAGE: &str = "Operation failed, please retry";

/// Uniform outcome envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn failure(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            error: Some(kind),
        }
    }
}

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    set_json_content_type(response.headers_mut());
    response
}

fn set_json_content_type(headers: &mut HeaderMap) {
    headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
}

/// 200 OK with a success envelope
pub fn ok<T: Serialize>(message: &str, data: T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &ApiResponse::success(message, data))
}

/// 201 Created with a success envelope
pub fn created<T: Serialize>(message: &str, data: T) -> Response<Full<Bytes>> {
    json_response(StatusCode::CREATED, &ApiResponse::success(message, data))
}

pub fn not_found(message: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::NOT_FOUND, &ApiResponse::failure("not_found", message))
}

pub fn bad_request(message: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::BAD_REQUEST, &ApiResponse::failure("invalid_input", message))
}

pub fn method_not_allowed() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &ApiResponse::failure("method_not_allowed", "Method not allowed"),
    )
}

/// Status code for each error kind
pub fn status_for(error: &LedgerError) -> StatusCode {
    match error {
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::Conflict(_) => StatusCode::CONFLICT,
        LedgerError::Unauthorized(_) => StatusCode::FORBIDDEN,
        LedgerError::InvalidProof(_) => StatusCode::BAD_REQUEST,
        LedgerError::InvalidInput(_) | LedgerError::Json(_) => StatusCode::BAD_REQUEST,
        LedgerError::Config(_) | LedgerError::Io(_) | LedgerError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Convert a LedgerError to an appropriate HTTP response
pub fn error_response(error: LedgerError) -> Response<Full<Bytes>> {
    let status = status_for(&error);
    let message = match &error {
        LedgerError::NotFound(msg)
        | LedgerError::Conflict(msg)
        | LedgerError::Unauthorized(msg)
        | LedgerError::InvalidProof(msg)
        | LedgerError::InvalidInput(msg) => msg.clone(),
        LedgerError::Json(e) => format!("Invalid JSON: {}", e),
        LedgerError::Config(_) | LedgerError::Io(_) | LedgerError::Internal(_) => {
            error!(error = %error, "Request failed");
            RETRY_MESSAGE.to_string()
        }
    };

    json_response(status, &ApiResponse::failure(error.kind(), message))
}

/// Wrap a service result into a 200 response
pub fn from_result<T: Serialize>(message: &str, result: Result<T, LedgerError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => ok(message, value),
        Err(e) => error_response(e),
    }
}

/// Wrap a create result into a 201 response
pub fn from_create_result<T: Serialize>(
    message: &str,
    result: Result<T, LedgerError>,
) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => created(message, value),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(resp: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ok_envelope() {
        let resp = ok("Batch found", serde_json::json!({"batchId": "BATCH-1"}));
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Batch found");
        assert_eq!(body["data"]["batchId"], "BATCH-1");
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn test_internal_error_is_generic() {
        let resp = error_response(LedgerError::Internal("disk I/O error at page 7".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], RETRY_MESSAGE);
        assert_eq!(body["error"], "internal");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&LedgerError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&LedgerError::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&LedgerError::Unauthorized("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&LedgerError::InvalidProof("x".into())), StatusCode::BAD_REQUEST);
    }
}
