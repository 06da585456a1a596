use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    extract::multipart::MultipartError,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// The application's error type.
///
/// Every variant maps onto one stable machine-readable kind (see [`AppError::kind`]);
/// none of the messages ever carry storage paths or role tokens.
#[derive(Error, Debug)]
pub enum AppError {
    /// Unknown session id/code, or nothing to download.
    #[error("{0}")]
    NotFound(&'static str),

    /// Role token mismatch.
    #[error("Unauthorized")]
    Unauthorized,

    /// The session is closed or its TTL has passed.
    #[error("Session expired or closed")]
    Expired,

    /// Missing or malformed input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The upload exceeds the configured size bound, in bytes.
    #[error("File exceeds the maximum allowed size ({0} bytes)")]
    PayloadTooLarge(u64),

    /// The uploaded file type is not on the allow-list.
    #[error("{0}")]
    UnsupportedMediaType(String),

    /// A multipart error.
    #[error("Multipart error: {0}")]
    Multipart(String),

    /// An I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal server error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// The machine-readable error kind sent to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Expired => "expired",
            AppError::Validation(_)
            | AppError::PayloadTooLarge(_)
            | AppError::UnsupportedMediaType(_)
            | AppError::Multipart(_) => "invalid_input",
            AppError::Io(_) | AppError::Internal(_) => "server_error",
        }
    }

    /// The HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Expired => StatusCode::GONE,
            AppError::Validation(_) | AppError::Multipart(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Io(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<MultipartError> for AppError {
    fn from(e: MultipartError) -> Self {
        AppError::Multipart(e.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let message = match self {
            AppError::NotFound(msg) => {
                tracing::debug!("Not found: {}", msg);
                msg.to_string()
            }

            AppError::Unauthorized => {
                tracing::warn!("Token mismatch");
                "Unauthorized".to_string()
            }

            AppError::Expired => {
                tracing::debug!("Session expired or closed");
                "Session expired or closed".to_string()
            }

            AppError::Validation(ref msg) | AppError::UnsupportedMediaType(ref msg) => {
                tracing::debug!("Validation error: {}", msg);
                msg.clone()
            }

            AppError::PayloadTooLarge(limit) => {
                tracing::debug!("Upload over the {} byte limit", limit);
                format!("File exceeds the maximum allowed size ({})", readable_size(limit))
            }

            AppError::Multipart(ref msg) => {
                tracing::warn!("Multipart error: {}", msg);
                msg.clone()
            }

            AppError::Io(ref e) => {
                tracing::error!("IO error: {}", e);
                "File system error".to_string()
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "ok": false,
            "error": kind,
            "message": message
        }))
        .unwrap_or_else(|_| r#"{"ok":false,"error":"server_error"}"#.to_string());

        (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
    }
}

/// Formats a byte count in the largest unit that divides it evenly.
fn readable_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    if bytes >= MB && bytes % MB == 0 {
        format!("{} MB", bytes / MB)
    } else if bytes >= KB && bytes % KB == 0 {
        format!("{} KB", bytes / KB)
    } else {
        format!("{} bytes", bytes)
    }
}
