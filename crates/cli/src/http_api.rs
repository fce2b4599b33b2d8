use axum::{
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use sshkey_protocol::{
    serialize_json, ErrorBody, ERROR_METHOD_NOT_ALLOWED, ERROR_NOT_FOUND, ERROR_UNEXPECTED,
};

/// Wraps already-encoded JSON.
pub(crate) fn raw_json_response(status: StatusCode, body: String) -> Response {
    (status, [(CONTENT_TYPE, "application/json")], body).into_response()
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response {
    match serialize_json(body) {
        Ok(body) => raw_json_response(status, body),
        Err(err) => {
            log::error!("Failed to encode response body: {err}");
            raw_json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!(r#"{{"error":"{ERROR_UNEXPECTED}"}}"#),
            )
        }
    }
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    json_response(status, &ErrorBody::new(message))
}

pub(crate) async fn method_not_allowed() -> Response {
    error_response(StatusCode::METHOD_NOT_ALLOWED, ERROR_METHOD_NOT_ALLOWED)
}

pub(crate) async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, ERROR_NOT_FOUND)
}
