use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    body::{Body, Bytes},
    extract::multipart::{Field, Multipart, MultipartError},
    http::StatusCode,
};
use chrono::Utc;
use futures::Stream;
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
    sync::{OwnedSemaphorePermit, oneshot},
};
use tokio_util::io::ReaderStream;

use crate::{
    error::{AppError, Result},
    models::session::FileMeta,
    repositories::blob::PendingBlob,
    services::sessions,
    state::AppState,
    validation::upload::validate_filename,
};

/// Multipart part carrying the uploaded file.
pub const FILE_FIELD: &str = "file";

const WRITE_BUFFER_BYTES: usize = 256 * 1024;
const READ_BUFFER_BYTES: usize = 64 * 1024;
/// Enough leading bytes for `infer` to recognize every format it knows.
const SNIFF_BYTES: usize = 8192;
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// A fully written upload that no session owns yet.
///
/// Dropping it deletes the blob, so the upload must be handed to
/// [`sessions::attach_upload`] to survive.
#[derive(Debug)]
pub struct ReceivedUpload {
    pub meta: FileMeta,
    pub blob: PendingBlob,
}

/// Streams the `file` part of an upload into a fresh blob.
///
/// The filename is validated before the blob is created. The size bound is
/// enforced while streaming. Any failure, including the request being dropped
/// mid-body, deletes the partial blob.
pub async fn receive_upload(
    state: &AppState,
    session_id: &str,
    multipart: &mut Multipart,
) -> Result<ReceivedUpload> {
    let limit = state.config.max_file_bytes;

    let mut field = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some(FILE_FIELD) => break field,
            Ok(Some(_)) => continue,
            Ok(None) => return Err(AppError::Validation("No file uploaded".to_string())),
            Err(e) => return Err(multipart_error(e, limit)),
        }
    };

    let (name, extension) =
        validate_filename(field.file_name().unwrap_or_default(), &state.config.allowed_extensions)?;
    let declared_type = field
        .content_type()
        .map(str::trim)
        .filter(|ct| !ct.is_empty())
        .map(str::to_string);

    let (blob, file) = state.blobs.create_blob(session_id, &extension).await?;
    tracing::debug!("💾 Receiving {} for session {}", name, session_id);

    let (size, head) = match write_field(&mut field, file, limit).await {
        Ok(written) => written,
        Err(e) => {
            blob.discard().await;
            return Err(e);
        }
    };

    if size == 0 {
        blob.discard().await;
        return Err(AppError::Validation("Uploaded file is empty".to_string()));
    }

    let content_type = declared_type
        .or_else(|| infer::get(&head).map(|kind| kind.mime_type().to_string()))
        .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());

    Ok(ReceivedUpload {
        meta: FileMeta {
            name,
            size,
            content_type,
            storage_path: blob.path().to_path_buf(),
            uploaded_at: Utc::now(),
        },
        blob,
    })
}

/// Copies the part to disk, returning the byte count and the sniffing prefix.
async fn write_field(field: &mut Field<'_>, file: File, limit: u64) -> Result<(u64, Vec<u8>)> {
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);
    let mut size: u64 = 0;
    let mut head = Vec::new();

    while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(e, limit))? {
        size += chunk.len() as u64;
        if size > limit {
            return Err(AppError::PayloadTooLarge(limit));
        }
        if head.len() < SNIFF_BYTES {
            let take = (SNIFF_BYTES - head.len()).min(chunk.len());
            head.extend_from_slice(&chunk[..take]);
        }
        writer.write_all(&chunk).await.map_err(|e| {
            tracing::error!("❌ Failed to write upload: {}", e);
            AppError::Io(e)
        })?;
    }

    writer.flush().await?;
    Ok((size, head))
}

/// Body limit hits surface as 413; everything else is malformed input.
fn multipart_error(e: MultipartError, limit: u64) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(limit)
    } else {
        AppError::from(e)
    }
}

/// How a download body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Every byte was handed to the connection.
    Completed,
    /// The body was dropped early or failed to read.
    Aborted,
}

/// Wraps a body stream and reports, exactly once, whether it ran to the end.
pub struct TrackedStream<S> {
    inner: S,
    expected: u64,
    sent: u64,
    report: Option<oneshot::Sender<DownloadOutcome>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl<S> TrackedStream<S> {
    pub fn new(
        inner: S,
        expected: u64,
        report: oneshot::Sender<DownloadOutcome>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            inner,
            expected,
            sent: 0,
            report: Some(report),
            _permit: permit,
        }
    }

    fn finish(&mut self, outcome: DownloadOutcome) {
        if let Some(report) = self.report.take() {
            let _ = report.send(outcome);
        }
    }
}

impl<S> Stream for TrackedStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.sent += bytes.len() as u64;
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finish(DownloadOutcome::Aborted);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finish(DownloadOutcome::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        // The connection may stop polling once Content-Length bytes went out.
        let outcome = if self.sent >= self.expected {
            DownloadOutcome::Completed
        } else {
            DownloadOutcome::Aborted
        };
        self.finish(outcome);
    }
}

/// Builds the streaming body for a download and spawns its cleanup watcher.
///
/// Only a completed stream releases the file; an aborted one leaves metadata
/// and bytes in place so the receiver can retry.
pub fn download_body(
    state: AppState,
    session_id: String,
    file: FileMeta,
    handle: File,
    length: u64,
    permit: OwnedSemaphorePermit,
) -> Body {
    let (tx, rx) = oneshot::channel();

    let stream = TrackedStream::new(
        ReaderStream::with_capacity(handle, READ_BUFFER_BYTES),
        length,
        tx,
        Some(permit),
    );

    tokio::spawn(async move {
        match rx.await {
            Ok(DownloadOutcome::Completed) => {
                sessions::complete_download(&state, &session_id, &file).await;
            }
            Ok(DownloadOutcome::Aborted) | Err(_) => {
                tracing::info!(
                    "⚠️ Download of {} interrupted, file kept for another attempt",
                    session_id
                );
            }
        }
    });

    Body::from_stream(stream)
}
