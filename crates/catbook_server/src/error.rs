//! Error type shared by the HTTP handlers.

use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use catbook_core::VisionError;
use serde::Serialize;
use thiserror::Error;

/// Body of every non-listing response: `{ "message": ... }`.
#[derive(Debug, Clone, Serialize)]
pub struct MessageBody {
    pub message: &'static str,
}

impl MessageBody {
    pub const fn new(message: &'static str) -> Self {
        Self { message }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// The upload form has no `image` field.
    #[error("multipart field `image` is missing")]
    MissingImage,

    #[error("unreadable multipart body: {0}")]
    Multipart(String),

    #[error("upload exceeds the configured size limit")]
    PayloadTooLarge,

    #[error("classification failed: {0}")]
    Classification(#[from] VisionError),

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("not found")]
    NotFound,
}

impl ApiError {
    /// A missing `image` field counts as a server error, like any other
    /// failure while handling an upload.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::MissingImage
            | Self::Multipart(_)
            | Self::Classification(_)
            | Self::Storage(_)
            | Self::Io(_)
            | Self::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            Self::NotFound => "Not found",
            Self::PayloadTooLarge => "File too large",
            _ => "Internal server error",
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge
        } else {
            Self::Multipart(err.body_text())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        // Details stay in the log; clients only see the generic message.
        (status, Json(MessageBody::new(self.public_message()))).into_response()
    }
}
