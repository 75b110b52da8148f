use crate::services::error::StorageError;
use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::fmt;

/// An S3 error response: HTTP status, S3 error code and message, rendered as
/// the `<Error>` XML document.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for 400 InvalidArgument
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "InvalidArgument", msg)
    }

    /// Shortcut for 400 MalformedXML
    pub fn malformed_xml(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "MalformedXML", msg)
    }

    pub fn invalid_range(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::RANGE_NOT_SATISFIABLE, "InvalidRange", msg)
    }

    fn to_xml(&self) -> String {
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<Error><Code>{}</Code><Message>{}</Message></Error>"#
            ),
            self.code,
            xml_escape(&self.message)
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!("request failed: {}", self);
        }
        let mut response = (self.status, self.to_xml()).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml"),
        );
        response
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let (status, code) = s3_code(&err);
        let message = match status {
            // Paths under the storage root stay on the server.
            StatusCode::FORBIDDEN => "Access Denied".to_string(),
            StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!("storage error: {}", err);
                "We encountered an internal error. Please try again.".to_string()
            }
            _ => err.to_string(),
        };
        Self::new(status, code, message)
    }
}

/// S3 status and error code for a storage failure.
pub fn s3_code(err: &StorageError) -> (StatusCode, &'static str) {
    use StorageError::*;
    match err {
        BucketNotFound(_) => (StatusCode::NOT_FOUND, "NoSuchBucket"),
        ObjectNotFound { .. } => (StatusCode::NOT_FOUND, "NoSuchKey"),
        UploadNotFound(_) => (StatusCode::NOT_FOUND, "NoSuchUpload"),
        BucketAlreadyExists(_) => (StatusCode::CONFLICT, "BucketAlreadyOwnedByYou"),
        BucketNotEmpty(_) => (StatusCode::CONFLICT, "BucketNotEmpty"),
        ObjectAlreadyExists { .. } => (StatusCode::CONFLICT, "ObjectAlreadyExists"),
        PartAlreadyExists(_) => (StatusCode::CONFLICT, "OperationAborted"),
        ObjectChecksumMismatch { .. } => (StatusCode::BAD_REQUEST, "XAmzContentSHA256Mismatch"),
        InvalidBucketName { .. } => (StatusCode::BAD_REQUEST, "InvalidBucketName"),
        InvalidPart(_) => (StatusCode::BAD_REQUEST, "InvalidPart"),
        InvalidObjectKey(_)
        | InvalidPartNumber(_)
        | InvalidContinuationToken
        | StartFromNotExist(_)
        | StartFromBadPrefix { .. }
        | StartFromOutsideRoot(_) => (StatusCode::BAD_REQUEST, "InvalidArgument"),
        PathTraversal(_) | SymlinkNotAllowed(_) => (StatusCode::FORBIDDEN, "AccessDenied"),
        Cancelled => (StatusCode::REQUEST_TIMEOUT, "RequestTimeout"),
        ObjectMetadataNotReadable { .. }
        | ConfigVersionMismatch { .. }
        | TmpOnDifferentVolume(_)
        | Yaml(_)
        | Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
    }
}

pub fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
