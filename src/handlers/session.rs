use axum::{
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, Result},
    handlers::respond::json_ok,
    models::session::{CloseReason, FileSummary, Role, Session, SessionStatus},
    services::{qr, sessions as session_service},
    state::AppState,
};

/// The request payload for creating a session.
#[derive(Deserialize, Debug)]
pub struct CreateSessionRequest {
    pub role: Option<String>,
}

/// The request payload for a sender joining by code or id.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub code: Option<String>,
    pub session_id: Option<String>,
}

/// Query of the link embedded in the QR code.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct JoinQuery {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub t: String,
}

/// The request payload for joining with the QR credentials.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub session_id: String,
    pub token: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub session_id: String,
    pub role: Role,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    pub session_id: String,
    pub by: Option<Role>,
}

/// Returned to the receiver on creation.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub code: String,
    pub receiver_token: String,
    pub join_url: String,
    pub expires_at: Option<i64>,
    pub heartbeat_interval_ms: u64,
}

/// Returned to the sender on connect or join.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub session_id: String,
    pub sender_token: String,
    pub expires_at: Option<i64>,
    pub heartbeat_interval_ms: u64,
}

/// Polled by both sides. Carries no tokens and no storage path.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub closed: bool,
    pub closed_by: Option<CloseReason>,
    pub status: SessionStatus,
    pub has_file: bool,
    pub file: Option<FileSummary>,
    pub expires_at: Option<i64>,
    pub seconds_left: Option<i64>,
    pub sender_connected: bool,
}

impl StatusResponse {
    pub fn from_session(session: &Session, now: DateTime<Utc>) -> Self {
        let file = session.file_summary();
        Self {
            closed: session.is_effectively_closed(now),
            closed_by: session.closed_by,
            status: session.status,
            has_file: file.is_some(),
            file,
            expires_at: epoch_ms(session.expires_at),
            seconds_left: session.seconds_left(now),
            sender_connected: session.sender_connected,
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct HeartbeatResponse {
    expires_at: Option<i64>,
}

#[derive(Serialize, Debug)]
struct Empty {}

fn epoch_ms(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|at| at.timestamp_millis())
}

fn heartbeat_ms(state: &AppState) -> u64 {
    state.config.heartbeat_interval.as_millis() as u64
}

async fn created(state: &AppState, headers: &HeaderMap) -> Result<Response> {
    let session = session_service::create_receiver_session(state).await?;
    let origin = qr::public_origin(&state.config, headers);

    json_ok(
        StatusCode::OK,
        CreateSessionResponse {
            join_url: qr::join_url(&origin, &session.id, &session.sender_token),
            expires_at: epoch_ms(session.expires_at),
            heartbeat_interval_ms: heartbeat_ms(state),
            session_id: session.id,
            code: session.code,
            receiver_token: session.receiver_token,
        },
    )
}

fn connected(state: &AppState, session: Session) -> Result<Response> {
    json_ok(
        StatusCode::OK,
        ConnectResponse {
            expires_at: epoch_ms(session.expires_at),
            heartbeat_interval_ms: heartbeat_ms(state),
            session_id: session.id,
            sender_token: session.sender_token,
        },
    )
}

/// Handles `POST /api/session`. Only receivers create sessions.
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(payload) = payload?;
    if payload.role.as_deref() != Some("receiver") {
        return Err(AppError::Validation("role must be 'receiver'".to_string()));
    }
    created(&state, &headers).await
}

/// Handles `GET /api/session/new`, same payload as the POST.
pub async fn create_session_get(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response> {
    created(&state, &headers).await
}

/// Handles `POST /api/connect`.
pub async fn connect(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ConnectRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(payload) = payload?;
    let session = session_service::connect_sender(
        &state,
        payload.code.as_deref(),
        payload.session_id.as_deref(),
    )
    .await?;
    connected(&state, session)
}

/// Handles `GET /join`, the QR target. Redirects to the sender page only on success.
pub async fn join_redirect(
    State(state): State<AppState>,
    query: std::result::Result<Query<JoinQuery>, QueryRejection>,
) -> Result<Response> {
    let Query(query) = query?;
    let session = session_service::join_via_qr(&state, &query.session_id, &query.t).await?;

    // A frontend on another origin is reached through FRONTEND_BASE.
    let target = format!(
        "{}/sender?sessionId={}&t={}",
        state.config.frontend_base.as_deref().unwrap_or(""),
        session.id,
        session.sender_token
    );
    Ok(Redirect::to(&target).into_response())
}

/// Handles `POST /api/join`.
pub async fn join(
    State(state): State<AppState>,
    payload: std::result::Result<Json<JoinRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(payload) = payload?;
    let session = session_service::join_via_qr(&state, &payload.session_id, &payload.token).await?;
    connected(&state, session)
}

/// Handles `GET /api/session/{id}/status`.
pub async fn status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response> {
    let session = session_service::status(&state, &session_id).await?;
    json_ok(
        StatusCode::OK,
        StatusResponse::from_session(&session, Utc::now()),
    )
}

/// Handles `POST /api/heartbeat`.
pub async fn heartbeat(
    State(state): State<AppState>,
    payload: std::result::Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(payload) = payload?;
    let session = session_service::heartbeat(&state, &payload.session_id, payload.role).await?;
    json_ok(
        StatusCode::OK,
        HeartbeatResponse {
            expires_at: epoch_ms(session.expires_at),
        },
    )
}

/// Handles `POST /api/disconnect`. `by` defaults to the sender.
pub async fn disconnect(
    State(state): State<AppState>,
    payload: std::result::Result<Json<DisconnectRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(payload) = payload?;
    let by = payload.by.unwrap_or(Role::Sender);
    session_service::disconnect(&state, &payload.session_id, by).await?;
    json_ok(StatusCode::OK, Empty {})
}

/// Handles `GET /api/qr/{id}.png`.
pub async fn qr_png(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(file): Path<String>,
) -> Result<Response> {
    let session_id = file
        .strip_suffix(".png")
        .ok_or(AppError::NotFound("Not found"))?;
    let session = state
        .sessions
        .get_by_id(session_id)
        .await
        .ok_or(AppError::NotFound("Session not found"))?;

    let origin = qr::public_origin(&state.config, &headers);
    let png = qr::render_png(&qr::join_url(&origin, &session.id, &session.sender_token))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (header::CONTENT_LENGTH, png.len().to_string()),
        ],
        png,
    )
        .into_response())
}
