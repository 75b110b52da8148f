//! Multipart upload values.

use serde::Deserialize;

/// Receipt for one stored part. `sha256` is returned to clients as the ETag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: u32,
    pub sha256: String,
    pub size: u64,
}

/// A part referenced by `CompleteMultipartUpload`.
///
/// When `etag` is set it must match the digest returned by `UploadPart`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct CompletedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag", default)]
    pub etag: Option<String>,
}

impl CompletedPart {
    pub fn new(part_number: u32) -> Self {
        Self {
            part_number,
            etag: None,
        }
    }
}

/// `CompleteMultipartUpload` request body.
#[derive(Debug, Deserialize)]
#[serde(rename = "CompleteMultipartUpload")]
pub struct CompleteMultipartUploadReq {
    #[serde(rename = "Part", default)]
    pub parts: Vec<CompletedPart>,
}
