use chrono::Utc;

use crate::{
    crypto::token::tokens_match,
    error::{AppError, Result},
    models::session::{FileMeta, FileSummary, Role, Session},
    repositories::session::AttachError,
    services::transfer::ReceivedUpload,
    state::AppState,
};

const SESSION_NOT_FOUND: &str = "Session not found";

/// Creates a receiver-owned session. The receiver counts as seen right away.
pub async fn create_receiver_session(state: &AppState) -> Result<Session> {
    let ttl = state.config.ttl_secs();
    let now = Utc::now();

    let session = state.sessions.create(ttl, now).await?;
    let session = state
        .sessions
        .update(&session.id, |s| {
            s.mark_seen(Role::Receiver, now);
            s.touch(ttl, now);
            s.clone()
        })
        .await
        .ok_or_else(|| AppError::Internal("Session vanished during creation".to_string()))?;

    tracing::info!("🆕 Session created: {} (code {})", session.id, session.code);
    Ok(session)
}

/// Sender joins by typed code, falling back to the session id.
pub async fn connect_sender(
    state: &AppState,
    code: Option<&str>,
    session_id: Option<&str>,
) -> Result<Session> {
    let mut found = None;
    if let Some(code) = code.filter(|c| !c.trim().is_empty()) {
        found = state.sessions.get_by_code(code).await;
    }
    if found.is_none() {
        if let Some(id) = session_id.filter(|id| !id.is_empty()) {
            found = state.sessions.get_by_id(id).await;
        }
    }
    let id = found.ok_or(AppError::NotFound(SESSION_NOT_FOUND))?.id;

    mark_sender_connected(state, &id, None).await
}

/// Sender joins through the QR link, authenticated by the embedded sender token.
pub async fn join_via_qr(state: &AppState, session_id: &str, token: &str) -> Result<Session> {
    mark_sender_connected(state, session_id, Some(token)).await
}

async fn mark_sender_connected(
    state: &AppState,
    session_id: &str,
    token: Option<&str>,
) -> Result<Session> {
    let ttl = state.config.ttl_secs();
    let now = Utc::now();

    let session = state
        .sessions
        .update(session_id, |s| {
            if let Some(token) = token {
                if !tokens_match(&s.sender_token, token) {
                    return Err(AppError::Unauthorized);
                }
            }
            if s.is_effectively_closed(now) {
                return Err(AppError::Expired);
            }
            s.connect_sender(now);
            s.touch(ttl, now);
            Ok(s.clone())
        })
        .await
        .ok_or(AppError::NotFound(SESSION_NOT_FOUND))??;

    tracing::info!("🤝 Sender connected to session {}", session.id);
    Ok(session)
}

/// Read-only snapshot used by the status endpoint.
pub async fn status(state: &AppState, session_id: &str) -> Result<Session> {
    state
        .sessions
        .get_by_id(session_id)
        .await
        .ok_or(AppError::NotFound("Not found"))
}

/// Refreshes a role's liveness and slides the TTL.
///
/// A session past its deadline is treated as closed even if the sweeper has
/// not run yet, so a heartbeat never resurrects it.
pub async fn heartbeat(state: &AppState, session_id: &str, role: Role) -> Result<Session> {
    let ttl = state.config.ttl_secs();
    let now = Utc::now();

    let session = state
        .sessions
        .update(session_id, |s| {
            if s.is_effectively_closed(now) {
                return Err(AppError::Expired);
            }
            s.mark_seen(role, now);
            s.touch(ttl, now);
            Ok(s.clone())
        })
        .await
        .ok_or(AppError::NotFound(SESSION_NOT_FOUND))??;

    tracing::debug!("💓 Heartbeat from {:?} on session {}", role, session.id);
    Ok(session)
}

/// Closes the session on behalf of `by`, deleting any held file first.
pub async fn disconnect(state: &AppState, session_id: &str, by: Role) -> Result<()> {
    let outcome = state
        .sessions
        .close(session_id, by.into(), Utc::now())
        .await
        .ok_or(AppError::NotFound(SESSION_NOT_FOUND))?;

    if let Some(file) = outcome.detached {
        state.blobs.delete(&file.storage_path).await;
    }

    if outcome.already_closed {
        tracing::debug!("Session {} already closed, disconnect ignored", session_id);
    } else {
        tracing::info!("👋 Session {} closed by {:?}", session_id, by);
    }
    Ok(())
}

/// Checks that an upload may start. Runs before any byte is written.
pub async fn authorize_upload(state: &AppState, session_id: &str, token: &str) -> Result<()> {
    let session = state
        .sessions
        .get_by_id(session_id)
        .await
        .ok_or(AppError::NotFound(SESSION_NOT_FOUND))?;

    if !tokens_match(&session.sender_token, token) {
        tracing::warn!("❌ Upload with a bad sender token for session {}", session_id);
        return Err(AppError::Unauthorized);
    }
    if session.is_effectively_closed(Utc::now()) {
        return Err(AppError::Expired);
    }
    Ok(())
}

/// Attaches a fully written blob, replacing (and deleting) the previous one.
///
/// If the session was closed or purged while the bytes were streaming, the new
/// blob is deleted and the upload is rejected.
pub async fn attach_upload(
    state: &AppState,
    session_id: &str,
    upload: ReceivedUpload,
) -> Result<FileSummary> {
    let ttl = state.config.ttl_secs();
    let now = Utc::now();
    let ReceivedUpload { meta, blob } = upload;
    let summary = FileSummary::from(&meta);

    match state.sessions.set_file(session_id, meta, now).await {
        Ok(previous) => {
            // The session owns the blob from here on.
            blob.keep();
            if let Some(previous) = previous {
                tracing::debug!("♻️ Replacing previous file on session {}", session_id);
                state.blobs.delete(&previous.storage_path).await;
            }
            state.sessions.touch(session_id, ttl, now).await;
            tracing::info!(
                "📤 File attached to session {}: {} ({} bytes)",
                session_id,
                summary.name,
                summary.size
            );
            Ok(summary)
        }
        Err(AttachError::Closed) => {
            blob.discard().await;
            Err(AppError::Expired)
        }
        Err(AttachError::NotFound) => {
            blob.discard().await;
            Err(AppError::NotFound(SESSION_NOT_FOUND))
        }
    }
}

/// Authorizes a download and returns the file to stream.
pub async fn prepare_download(state: &AppState, session_id: &str, token: &str) -> Result<FileMeta> {
    let session = state
        .sessions
        .get_by_id(session_id)
        .await
        .ok_or(AppError::NotFound(SESSION_NOT_FOUND))?;

    if !tokens_match(&session.receiver_token, token) {
        tracing::warn!("❌ Download with a bad receiver token for session {}", session_id);
        return Err(AppError::Unauthorized);
    }

    session.file.ok_or(AppError::NotFound("No file"))
}

/// Cleanup after a download was streamed to the end.
///
/// Waits out the configured grace period, detaches the file if it is still the
/// one that was streamed, deletes its bytes and slides the TTL.
pub async fn complete_download(state: &AppState, session_id: &str, file: &FileMeta) {
    let grace = state.config.download_cleanup_grace;
    if !grace.is_zero() {
        tokio::time::sleep(grace).await;
    }

    let now = Utc::now();
    let cleared = state
        .sessions
        .clear_file_if(session_id, &file.storage_path, now)
        .await;
    state.blobs.delete(&file.storage_path).await;
    state.sessions.touch(session_id, state.config.ttl_secs(), now).await;

    if cleared.is_some() {
        tracing::info!("📥 Download of {} completed, file released", session_id);
    } else {
        tracing::debug!(
            "Download of {} completed after the file was already replaced or released",
            session_id
        );
    }
}
