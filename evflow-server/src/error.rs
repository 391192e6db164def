//! Error handling for the axum server.
//!
//! Maps [`evflow_core::error::EngineError`] and [`evflow_core::approval::GateError`]
//! onto HTTP status codes and structured JSON bodies (spec.md §7/§8:
//! "across the service boundary: HTTP 400/404 with structured body").

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use evflow_core::approval::GateError;
use evflow_core::error::EngineError;
use serde_json::json;

pub struct AppError(EngineError);

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl From<GateError> for AppError {
    fn from(e: GateError) -> Self {
        let engine = match &e {
            GateError::NotFound(id) => EngineError::NotFound(format!("gate not found: {id}")),
            GateError::NotPending(id) => EngineError::InvalidInput(format!("gate {id} is not pending")),
        };
        Self(engine)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": self.0.to_string(),
            "code": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}
