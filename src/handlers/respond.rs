use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::{AppError, Result};

/// Success envelope: `{"ok": true, ...data}`.
#[derive(Serialize)]
struct Envelope<T: Serialize> {
    ok: bool,
    #[serde(flatten)]
    data: T,
}

/// Serializes `data` with sonic-rs and sets the JSON content type.
pub fn json_ok<T: Serialize>(status: StatusCode, data: T) -> Result<Response> {
    let body = sonic_rs::to_string(&Envelope { ok: true, data })
        .map_err(|e| AppError::Internal(format!("Response serialization failed: {}", e)))?;

    Ok((status, [(header::CONTENT_TYPE, "application/json")], body).into_response())
}
