//! HTTP handlers: a thin S3 adapter over [`crate::services::backend::Backend`].

pub mod bucket_handlers;
pub mod health_handlers;
pub mod object_handlers;

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::{CancellationToken, DropGuard};

pub(crate) const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Cancellation for one request. The token fires when the guard is dropped,
/// which includes axum dropping the handler future on client disconnect.
pub(crate) fn request_scope() -> (CancellationToken, DropGuard) {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    (cancel, guard)
}

pub(crate) fn xml_response(status: StatusCode, xml: String) -> Response {
    let mut response = Response::new(Body::from(xml));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    response
}

pub(crate) fn quoted_etag(sha256: &str) -> String {
    format!("\"{}\"", sha256)
}

/// Timestamp format used inside XML bodies.
pub(crate) fn xml_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
