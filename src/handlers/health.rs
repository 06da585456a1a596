use axum::{extract::State, http::StatusCode, response::Response};
use chrono::Utc;
use serde::Serialize;

use crate::{error::Result, handlers::respond::json_ok, state::AppState};

#[derive(Serialize)]
struct HealthResponse {
    name: &'static str,
    time: i64,
    sessions: usize,
}

/// Handles `GET /api/health`.
pub async fn health(State(state): State<AppState>) -> Result<Response> {
    json_ok(
        StatusCode::OK,
        HealthResponse {
            name: "Sendo",
            time: Utc::now().timestamp_millis(),
            sessions: state.sessions.len().await,
        },
    )
}
