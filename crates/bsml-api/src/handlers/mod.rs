//! HTTP handlers: recordings as ReST resources.

pub mod negotiate;
pub mod recording;

use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use bsml_services::metadata::escape_xml;
use bsml_services::{IngestError, RecordingStore, StreamContext};

/// Mimetype of the XML status documents returned by PUT, DELETE and errors.
pub const BSML_MIMETYPE: &str = "application/x-bsml+xml";

/// Mimetype of a block-protocol response body.
pub const STREAM_MIMETYPE: &str = "application/x-stream";

#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<StreamContext>,
    pub store: Arc<RecordingStore>,
    /// Joined with the request path to form resource URIs.
    pub base_uri: String,
}

impl ApiState {
    /// Resource URI for a request path, split at any `#` fragment.
    pub fn resource_uri(&self, path: &str) -> (String, Option<String>) {
        let uri = format!("{}/{}", self.base_uri.trim_end_matches('/'), path.trim_start_matches('/'));
        match uri.split_once('#') {
            Some((base, fragment)) => (base.to_string(), Some(fragment.to_string())),
            None => (uri, None),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    UnsupportedMediaType(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(status = %status, error = %self, "request rejected");
        }
        let body = format!("<bsml>\n <error>{}</error>\n</bsml>\n", escape_xml(&self.to_string()));
        (status, [(header::CONTENT_TYPE, BSML_MIMETYPE)], body).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::UnsupportedType(_) => ApiError::UnsupportedMediaType(e.to_string()),
            IngestError::Conflict(_) => ApiError::Conflict(e.to_string()),
            IngestError::InvalidName(_) | IngestError::SubResource(_) => ApiError::BadRequest(e.to_string()),
            IngestError::Body(_) | IngestError::Format(_) => ApiError::BadRequest(e.to_string()),
            IngestError::NotFound(_) => ApiError::NotFound(e.to_string()),
            IngestError::Storage(..) => ApiError::Internal(e.to_string()),
        }
    }
}

/// Last path component of a URI, safe for a Content-Disposition filename.
pub(crate) fn attachment_name(uri: &str) -> String {
    let base = uri.trim_end_matches('/').rsplit('/').next().unwrap_or(uri);
    let clean: String = base
        .trim_start_matches('.')
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if clean.is_empty() {
        "recording".to_string()
    } else {
        clean
    }
}

pub use recording::{handle_delete, handle_get, handle_put};
