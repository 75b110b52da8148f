//! HTTP handlers for object and multipart operations.
//! Streams object bodies in both directions and delegates storage concerns to
//! `Bucket`.

use super::{S3_XMLNS, quoted_etag, request_scope, xml_response};
use crate::{
    errors::{AppError, xml_escape},
    models::{
        metadata::ObjectMetadata,
        multipart::{CompleteMultipartUploadReq, CompletedPart},
    },
    services::{backend::Backend, bucket::Bucket},
};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use std::{collections::BTreeMap, io, io::SeekFrom};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

const META_HEADER_PREFIX: &str = "x-amz-meta-";
const CONTENT_SHA256_HEADER: &str = "x-amz-content-sha256";
const CHECKSUM_SHA256_HEADER: &str = "x-amz-checksum-sha256";
const TAGGING_HEADER: &str = "x-amz-tagging";

/// Sub-resource selectors on `/{bucket}/{*key}`.
#[derive(Debug, Default, Deserialize)]
pub struct ObjectQuery {
    pub uploads: Option<String>,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<String>,
}

/// Inclusive byte range resolved against the object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// `PUT /{bucket}/{*key}`: PutObject, or UploadPart with `?partNumber=&uploadId=`.
pub async fn put_object(
    State(backend): State<Backend>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let handle = backend.head_bucket(&bucket).await?;
    let (cancel, _guard) = request_scope();
    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));

    let mut response = Response::new(Body::empty());
    match (q.upload_id.as_deref(), q.part_number.as_deref()) {
        (Some(upload_id), Some(part_number)) => {
            let part_number = part_number
                .parse::<u32>()
                .map_err(|_| AppError::invalid_argument("partNumber must be an integer"))?;
            let part = handle
                .upload_part(&key, upload_id, part_number, stream, &cancel)
                .await?;
            insert_header(response.headers_mut(), header::ETAG, &quoted_etag(&part.sha256));
        }
        (None, None) => {
            let metadata = metadata_from_headers(&headers)?;
            let stored = handle.put_object(&key, stream, metadata, &cancel).await?;
            insert_header(response.headers_mut(), header::ETAG, &quoted_etag(&stored.sha256));
            insert_header(
                response.headers_mut(),
                HeaderName::from_static(CHECKSUM_SHA256_HEADER),
                &stored.sha256_base64,
            );
        }
        _ => {
            return Err(AppError::invalid_argument(
                "uploadId and partNumber must be given together",
            ));
        }
    }
    Ok(response)
}

/// `GET /{bucket}/{*key}`: streams the object, honouring a single `Range`.
pub async fn get_object(
    State(backend): State<Backend>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let handle = backend.head_bucket(&bucket).await?;
    let mut object = handle.get_object(&key).await?;
    let metadata = object.metadata().await?.clone();

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) => parse_range(value, metadata.size)?,
        None => None,
    };

    let mut response = match range {
        Some(range) => {
            object.seek(SeekFrom::Start(range.start)).await?;
            let reader = object.into_reader().await?.take(range.len());
            let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            insert_header(
                response.headers_mut(),
                header::CONTENT_RANGE,
                &format!("bytes {}-{}/{}", range.start, range.end, metadata.size),
            );
            set_object_headers(response.headers_mut(), &metadata, range.len());
            response
        }
        None => {
            let reader = object.into_reader().await?;
            let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
            set_object_headers(response.headers_mut(), &metadata, metadata.size);
            response
        }
    };
    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    Ok(response)
}

/// `HEAD /{bucket}/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(backend): State<Backend>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let handle = backend.head_bucket(&bucket).await?;
    let object = handle.head_object(&key).await?;
    let metadata = object.metadata().await?;

    let mut response = Response::new(Body::empty());
    set_object_headers(response.headers_mut(), metadata, metadata.size);
    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    Ok(response)
}

/// `DELETE /{bucket}/{*key}`: soft-delete the object, or abort the
/// multipart upload named by `?uploadId=`.
pub async fn delete_object(
    State(backend): State<Backend>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
) -> Result<StatusCode, AppError> {
    let handle = backend.head_bucket(&bucket).await?;
    let (cancel, _guard) = request_scope();
    match q.upload_id.as_deref() {
        Some(upload_id) => handle.abort_multipart_upload(&key, upload_id, &cancel).await?,
        None => handle.delete_object(&key, &cancel).await?,
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /{bucket}/{*key}`: `?uploads` starts a multipart upload,
/// `?uploadId=` completes one.
pub async fn post_object(
    State(backend): State<Backend>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let handle = backend.head_bucket(&bucket).await?;
    if q.uploads.is_some() {
        return create_multipart_upload(&handle, &key, &headers).await;
    }
    if let Some(upload_id) = q.upload_id.as_deref() {
        return complete_multipart_upload(&handle, &key, upload_id, &body).await;
    }
    Err(AppError::new(
        StatusCode::NOT_IMPLEMENTED,
        "NotImplemented",
        "unsupported object POST",
    ))
}

async fn create_multipart_upload(
    handle: &Bucket,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let mut metadata = metadata_from_headers(headers)?;
    // The declared digest covers a single request body, not the assembled object.
    metadata.sha256.clear();

    let (cancel, _guard) = request_scope();
    let upload_id = handle.create_multipart_upload(key, metadata, &cancel).await?;
    let xml = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<InitiateMultipartUploadResult xmlns="{}">"#,
            r#"<Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId>"#,
            r#"</InitiateMultipartUploadResult>"#
        ),
        S3_XMLNS,
        xml_escape(handle.name()),
        xml_escape(key),
        xml_escape(&upload_id)
    );
    Ok(xml_response(StatusCode::OK, xml))
}

async fn complete_multipart_upload(
    handle: &Bucket,
    key: &str,
    upload_id: &str,
    body: &[u8],
) -> Result<Response, AppError> {
    let parts = parse_complete_request(body)?;

    let (cancel, _guard) = request_scope();
    let stored = handle
        .complete_multipart_upload(key, upload_id, &parts, &cancel)
        .await?;
    let xml = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<CompleteMultipartUploadResult xmlns="{}">"#,
            r#"<Location>/{}/{}</Location><Bucket>{}</Bucket><Key>{}</Key><ETag>{}</ETag>"#,
            r#"</CompleteMultipartUploadResult>"#
        ),
        S3_XMLNS,
        xml_escape(handle.name()),
        xml_escape(key),
        xml_escape(handle.name()),
        xml_escape(key),
        xml_escape(&quoted_etag(&stored.sha256))
    );
    Ok(xml_response(StatusCode::OK, xml))
}

pub(crate) fn parse_complete_request(body: &[u8]) -> Result<Vec<CompletedPart>, AppError> {
    let request: CompleteMultipartUploadReq = quick_xml::de::from_reader(body)
        .map_err(|e| AppError::malformed_xml(format!("Failed to parse XML: {}", e)))?;
    Ok(request.parts)
}

/// Build the sidecar the caller supplies on PutObject: content type, user
/// metadata, tags and the declared SHA-256, if any.
pub(crate) fn metadata_from_headers(headers: &HeaderMap) -> Result<ObjectMetadata, AppError> {
    let mut metadata = ObjectMetadata::default();
    if let Some(content_type) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        metadata.content_type = content_type.to_string();
    }

    for (name, value) in headers.iter() {
        if let Some(key) = name.as_str().strip_prefix(META_HEADER_PREFIX) {
            if let Ok(value) = value.to_str() {
                metadata.meta.insert(key.to_string(), value.to_string());
            }
        }
    }

    if let Some(tagging) = headers.get(TAGGING_HEADER).and_then(|v| v.to_str().ok()) {
        metadata.tags = parse_tagging(tagging)?;
    }

    // Anything else (UNSIGNED-PAYLOAD, STREAMING-*) declares no digest.
    if let Some(declared) = headers.get(CONTENT_SHA256_HEADER).and_then(|v| v.to_str().ok()) {
        if declared.len() == 64 && declared.bytes().all(|b| b.is_ascii_hexdigit()) {
            metadata.sha256 = declared.to_ascii_lowercase();
        }
    }
    Ok(metadata)
}

/// Parse an `x-amz-tagging` value: URL-encoded `k1=v1&k2=v2`.
pub(crate) fn parse_tagging(value: &str) -> Result<BTreeMap<String, String>, AppError> {
    let mut tags = BTreeMap::new();
    for pair in value.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        let decode = |s: &str| {
            urlencoding::decode(&s.replace('+', " "))
                .map(|decoded| decoded.into_owned())
                .map_err(|_| AppError::invalid_argument("x-amz-tagging is not valid UTF-8"))
        };
        let key = decode(k)?;
        if key.is_empty() {
            return Err(AppError::invalid_argument("tag keys must not be empty"));
        }
        tags.insert(key, decode(v)?);
    }
    Ok(tags)
}

/// Resolve a `Range` header against `size`.
///
/// Only a single `bytes=` range is honoured; anything else is ignored and the
/// whole object is served. The end is inclusive and clamped to the last byte.
pub(crate) fn parse_range(value: &str, size: u64) -> Result<Option<ByteRange>, AppError> {
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((start, end)) = spec.split_once('-') else {
        return Ok(None);
    };
    let (start, end) = (start.trim(), end.trim());
    let unsatisfiable = || AppError::invalid_range(format!("bytes {} of {}", spec, size));

    if start.is_empty() {
        // Suffix range: the last `n` bytes.
        let Ok(suffix) = end.parse::<u64>() else {
            return Ok(None);
        };
        if suffix == 0 || size == 0 {
            return Err(unsatisfiable());
        }
        return Ok(Some(ByteRange {
            start: size.saturating_sub(suffix),
            end: size - 1,
        }));
    }

    let Ok(start) = start.parse::<u64>() else {
        return Ok(None);
    };
    let end = if end.is_empty() {
        None
    } else {
        match end.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return Ok(None),
        }
    };
    if start >= size {
        return Err(unsatisfiable());
    }
    let last = size - 1;
    Ok(Some(ByteRange {
        start,
        end: end.map_or(last, |end| end.min(last)),
    }))
}

fn set_object_headers(headers: &mut HeaderMap, metadata: &ObjectMetadata, length: u64) {
    insert_header(headers, header::CONTENT_TYPE, metadata.content_type());
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    insert_header(headers, header::ETAG, &quoted_etag(&metadata.sha256));
    insert_header(
        headers,
        header::LAST_MODIFIED,
        &metadata
            .last_modified
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string(),
    );
    insert_header(
        headers,
        HeaderName::from_static(CHECKSUM_SHA256_HEADER),
        &metadata.sha256_base64,
    );
    if !metadata.tags.is_empty() {
        headers.insert(
            HeaderName::from_static("x-amz-tagging-count"),
            HeaderValue::from(metadata.tags.len()),
        );
    }
    for (key, value) in &metadata.meta {
        if let Ok(name) = HeaderName::from_bytes(format!("{}{}", META_HEADER_PREFIX, key).as_bytes()) {
            insert_header(headers, name, value);
        }
    }
}

/// Values that are not valid header text are dropped.
fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
