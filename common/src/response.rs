use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde_json::json;

/// `{ok: false, error: <code>, message}` with the given status.
pub fn failure(status: StatusCode, code: &str, message: impl ToString) -> Response {
    (
        status,
        Json(json!({
            "ok": false,
            "error": code,
            "message": message.to_string(),
        })),
    )
        .into_response()
}

pub fn bad_request(code: &str, message: impl ToString) -> Response {
    failure(StatusCode::BAD_REQUEST, code, message)
}

pub fn conflict(code: &str, message: impl ToString) -> Response {
    failure(StatusCode::CONFLICT, code, message)
}

pub fn bad_gateway(code: &str, message: impl ToString) -> Response {
    failure(StatusCode::BAD_GATEWAY, code, message)
}
