use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde::Serialize;
use std::{io, path::Path};
use tracing::error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure a request can end in. Converted to a status code and a JSON
/// body at the request boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("'{0}' is outside the shared directory")]
    PathEscape(String),
    #[error("'{0}' was not found")]
    NotFound(String),
    #[error("'{0}' cannot be previewed")]
    UnsupportedType(String),
    #[error("no paths were selected")]
    EmptySelection,
    #[error("{0}")]
    BadRequest(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Maps a filesystem error on `path` to the closest request-level error.
    pub fn from_io(e: io::Error, path: impl AsRef<Path>) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.as_ref().display().to_string()),
            _ => Self::Io(e),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::PathEscape(_) => "PathEscape",
            Self::NotFound(_) => "NotFound",
            Self::UnsupportedType(_) => "UnsupportedType",
            Self::EmptySelection => "EmptySelection",
            Self::BadRequest(_) => "BadRequest",
            Self::Io(_) => "IOError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::PathEscape(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UnsupportedType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::EmptySelection | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Single-flight waiters all receive the leader's outcome, so errors must be
// shareable. `io::Error` is not `Clone`; keep its kind and message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::PathEscape(p) => Self::PathEscape(p.clone()),
            Self::NotFound(p) => Self::NotFound(p.clone()),
            Self::UnsupportedType(p) => Self::UnsupportedType(p.clone()),
            Self::EmptySelection => Self::EmptySelection,
            Self::BadRequest(m) => Self::BadRequest(m.clone()),
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    kind: &'a str,
    message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Don't leak server-side details for unexpected failures.
            Self::Io(e) => {
                error!("Request failed with I/O error: {}", e);
                "An internal error occurred while reading the shared directory.".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}
