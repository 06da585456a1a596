use axum::{
    extract::{
        Multipart, Path, Query, State, multipart::MultipartRejection,
        rejection::QueryRejection,
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, Result},
    handlers::respond::json_ok,
    models::session::FileSummary,
    services::{sessions as session_service, transfer},
    state::AppState,
    validation::upload::content_disposition,
};

/// Credentials for an upload, carried in the query string.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub sender_token: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    #[serde(default)]
    pub receiver_token: String,
}

#[derive(Serialize, Debug)]
struct UploadResponse {
    file: FileSummary,
}

/// Handles `POST /api/upload`.
///
/// Session, token and expiry are checked before the body is read, so a
/// rejected sender never gets a byte onto disk.
pub async fn upload_file(
    State(state): State<AppState>,
    query: std::result::Result<Query<UploadQuery>, QueryRejection>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Response> {
    let Query(query) = query?;
    let session_id = query.session_id;

    session_service::authorize_upload(&state, &session_id, &query.sender_token).await?;
    let mut multipart = multipart.map_err(|e| AppError::Validation(e.body_text()))?;

    let _permit = state.transfers.acquire().await?;
    tracing::debug!(
        "📤 Upload started for session {} ({} transfers in flight)",
        session_id,
        state.transfers.in_flight()
    );

    let upload = transfer::receive_upload(&state, &session_id, &mut multipart).await?;
    let file = session_service::attach_upload(&state, &session_id, upload).await?;

    json_ok(StatusCode::OK, UploadResponse { file })
}

/// Handles `GET /api/download/{id}`.
///
/// The file is released only once the body has been streamed to the end.
pub async fn download_file(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    query: std::result::Result<Query<DownloadQuery>, QueryRejection>,
) -> Result<Response> {
    let Query(query) = query?;
    let file = session_service::prepare_download(&state, &session_id, &query.receiver_token).await?;

    let (handle, length) = match state.blobs.open(&file.storage_path).await {
        Ok(opened) => opened,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("⚠️ Blob missing for session {}", session_id);
            return Err(AppError::NotFound("No file"));
        }
        Err(e) => return Err(e.into()),
    };

    let permit = state.transfers.acquire().await?;
    tracing::info!(
        "📥 Download of {} started: {} ({} bytes)",
        session_id,
        file.name,
        length
    );

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&file.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&file.name))
            .map_err(|e| AppError::Internal(format!("Invalid Content-Disposition: {}", e)))?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("none"));

    let body = transfer::download_body(state, session_id, file, handle, length, permit);

    Ok((headers, body).into_response())
}
