//! Values returned by object listing and batch deletion.

use super::metadata::ObjectMetadata;
use crate::services::error::StorageError;
use serde::Deserialize;

/// One object in a listing page.
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    pub key: String,
    pub metadata: ObjectMetadata,
}

/// A page of `ListObjectsV2`.
///
/// `continuation_token` is base64 of the last key in `objects` and is only
/// set when `is_truncated` is true.
#[derive(Debug, Default)]
pub struct ListV2Result {
    pub objects: Vec<ObjectEntry>,
    pub is_truncated: bool,
    pub continuation_token: Option<String>,
}

/// Outcome of deleting one key in a `DeleteObjects` batch.
#[derive(Debug)]
pub struct DeleteOutcome {
    pub key: String,
    pub result: Result<(), StorageError>,
}

/// `DeleteObjects` request body.
#[derive(Debug, Deserialize)]
#[serde(rename = "Delete")]
pub struct DeleteReq {
    #[serde(rename = "Quiet", default)]
    pub quiet: bool,
    #[serde(rename = "Object", default)]
    pub objects: Vec<DeleteReqObject>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteReqObject {
    #[serde(rename = "Key")]
    pub key: String,
}
