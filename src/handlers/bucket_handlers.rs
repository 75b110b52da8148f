//! HTTP handlers for bucket operations, object listing and batch delete.

use super::{S3_XMLNS, quoted_etag, request_scope, xml_response, xml_timestamp};
use crate::{
    errors::{AppError, s3_code, xml_escape},
    models::object::{DeleteOutcome, DeleteReq, ListV2Result},
    services::backend::Backend,
};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

const MAX_KEYS: usize = 1000;
const MAX_DELETE_KEYS: usize = 1000;

/// Query params accepted by ListObjectsV2.
#[derive(Debug, Deserialize)]
pub struct ListObjectsV2Query {
    #[serde(rename = "list-type")]
    pub list_type: Option<u8>,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BucketPostQuery {
    pub delete: Option<String>,
}

/// `GET /`: list buckets.
pub async fn list_buckets(State(backend): State<Backend>) -> Result<Response, AppError> {
    let buckets = backend.list_buckets().await?;

    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><ListAllMyBucketsResult xmlns="{}"><Buckets>"#,
        S3_XMLNS
    );
    for bucket in &buckets {
        xml.push_str(&format!(
            "<Bucket><Name>{}</Name><CreationDate>{}</CreationDate></Bucket>",
            xml_escape(bucket.name()),
            xml_timestamp(&bucket.creation_date())
        ));
    }
    xml.push_str("</Buckets></ListAllMyBucketsResult>");
    Ok(xml_response(StatusCode::OK, xml))
}

/// `PUT /{bucket}`: create bucket. A `CreateBucketConfiguration` body is
/// accepted and ignored.
pub async fn create_bucket(
    State(backend): State<Backend>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let (cancel, _guard) = request_scope();
    backend.create_bucket(&bucket, &cancel).await?;

    let mut response = Response::new(Body::empty());
    if let Ok(location) = HeaderValue::from_str(&format!("/{}", bucket)) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    Ok(response)
}

/// `HEAD /{bucket}`
pub async fn head_bucket(
    State(backend): State<Backend>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    backend.head_bucket(&bucket).await?;
    Ok(StatusCode::OK)
}

/// `DELETE /{bucket}`: delete an empty bucket.
pub async fn delete_bucket(
    State(backend): State<Backend>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let (cancel, _guard) = request_scope();
    backend.delete_bucket(&bucket, &cancel).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /{bucket}`: ListObjectsV2, supports ?prefix=&max-keys=&continuation-token=
pub async fn list_objects(
    State(backend): State<Backend>,
    Path(bucket): Path<String>,
    Query(q): Query<ListObjectsV2Query>,
) -> Result<Response, AppError> {
    if q.list_type.unwrap_or(2) != 2 {
        return Err(AppError::invalid_argument("Only list-type=2 is supported"));
    }
    if q.delimiter.as_deref().is_some_and(|d| !d.is_empty()) {
        return Err(AppError::new(
            StatusCode::NOT_IMPLEMENTED,
            "NotImplemented",
            "delimiter is not supported",
        ));
    }
    let prefix = q.prefix.unwrap_or_default();
    let max_keys = q.max_keys.unwrap_or(MAX_KEYS).clamp(1, MAX_KEYS);

    let (cancel, _guard) = request_scope();
    let handle = backend.head_bucket(&bucket).await?;
    let result = handle
        .list_objects_v2(&prefix, max_keys, q.continuation_token.as_deref(), &cancel)
        .await?;

    let xml = build_list_objects_v2_xml(
        &bucket,
        &prefix,
        max_keys,
        q.continuation_token.as_deref(),
        &result,
    );
    Ok(xml_response(StatusCode::OK, xml))
}

/// `POST /{bucket}?delete`: DeleteObjects.
pub async fn post_bucket(
    State(backend): State<Backend>,
    Path(bucket): Path<String>,
    Query(q): Query<BucketPostQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    if q.delete.is_none() {
        return Err(AppError::new(
            StatusCode::NOT_IMPLEMENTED,
            "NotImplemented",
            "unsupported bucket POST",
        ));
    }
    let request = parse_delete_request(&body)?;
    if request.objects.len() > MAX_DELETE_KEYS {
        return Err(AppError::malformed_xml("Too many objects specified (max 1000)"));
    }
    let keys: Vec<String> = request.objects.into_iter().map(|o| o.key).collect();

    let (cancel, _guard) = request_scope();
    let handle = backend.head_bucket(&bucket).await?;
    let outcomes = handle.delete_objects(request.quiet, &keys, &cancel).await;
    Ok(xml_response(StatusCode::OK, build_delete_result_xml(&outcomes)))
}

pub(crate) fn parse_delete_request(body: &[u8]) -> Result<DeleteReq, AppError> {
    let request: DeleteReq = quick_xml::de::from_reader(body)
        .map_err(|e| AppError::malformed_xml(format!("Invalid XML: {}", e)))?;
    if request.objects.is_empty() {
        return Err(AppError::malformed_xml("No objects specified for deletion"));
    }
    Ok(request)
}

fn build_list_objects_v2_xml(
    bucket: &str,
    prefix: &str,
    max_keys: usize,
    continuation_token: Option<&str>,
    result: &ListV2Result,
) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><ListBucketResult xmlns="{}">"#,
        S3_XMLNS
    );
    xml.push_str(&format!("<Name>{}</Name>", xml_escape(bucket)));
    xml.push_str(&format!("<Prefix>{}</Prefix>", xml_escape(prefix)));
    xml.push_str(&format!("<MaxKeys>{}</MaxKeys>", max_keys));
    xml.push_str(&format!("<KeyCount>{}</KeyCount>", result.objects.len()));
    if let Some(token) = continuation_token {
        xml.push_str(&format!(
            "<ContinuationToken>{}</ContinuationToken>",
            xml_escape(token)
        ));
    }
    xml.push_str(&format!(
        "<IsTruncated>{}</IsTruncated>",
        result.is_truncated
    ));
    if let Some(next) = &result.continuation_token {
        xml.push_str(&format!(
            "<NextContinuationToken>{}</NextContinuationToken>",
            xml_escape(next)
        ));
    }

    for obj in &result.objects {
        xml.push_str("<Contents>");
        xml.push_str(&format!("<Key>{}</Key>", xml_escape(&obj.key)));
        xml.push_str(&format!(
            "<LastModified>{}</LastModified>",
            xml_timestamp(&obj.metadata.last_modified)
        ));
        xml.push_str(&format!(
            "<ETag>{}</ETag>",
            xml_escape(&quoted_etag(&obj.metadata.sha256))
        ));
        xml.push_str(&format!("<Size>{}</Size>", obj.metadata.size));
        xml.push_str("<StorageClass>STANDARD</StorageClass>");
        xml.push_str("</Contents>");
    }

    xml.push_str("</ListBucketResult>");
    xml
}

fn build_delete_result_xml(outcomes: &[DeleteOutcome]) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><DeleteResult xmlns="{}">"#,
        S3_XMLNS
    );
    for outcome in outcomes {
        match &outcome.result {
            Ok(()) => xml.push_str(&format!(
                "<Deleted><Key>{}</Key></Deleted>",
                xml_escape(&outcome.key)
            )),
            Err(err) => {
                let (_, code) = s3_code(err);
                xml.push_str(&format!(
                    "<Error><Key>{}</Key><Code>{}</Code><Message>{}</Message></Error>",
                    xml_escape(&outcome.key),
                    code,
                    xml_escape(&err.to_string())
                ));
            }
        }
    }
    xml.push_str("</DeleteResult>");
    xml
}
