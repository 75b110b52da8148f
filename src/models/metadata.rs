//! The metadata sidecar (`metadata.yaml`) stored next to every blob.

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One record per object or in-flight multipart upload.
///
/// On `PutObject` the caller fills `content_type`, `tags`, `meta` and the
/// declared `sha256` (empty when the client did not declare one); the engine
/// overwrites the digest fields, `size` and `last_modified` from the bytes it
/// actually stored.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ObjectMetadata {
    #[serde(rename = "content-type", default)]
    pub content_type: String,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// User metadata (`x-amz-meta-*` without the prefix).
    #[serde(default)]
    pub meta: BTreeMap<String, String>,

    /// Lowercase hex SHA-256 of the blob.
    #[serde(default)]
    pub sha256: String,

    /// Same digest, base64. Derived from `sha256`, kept for responses.
    #[serde(default)]
    pub sha256_base64: String,

    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub last_modified: DateTime<Utc>,
}

impl ObjectMetadata {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            ..Self::default()
        }
    }

    /// Record the digest and length of the bytes just written.
    pub fn seal(&mut self, digest: &[u8], size: u64) {
        self.sha256 = hex::encode(digest);
        self.sha256_base64 = general_purpose::STANDARD.encode(digest);
        self.size = size;
        self.last_modified = Utc::now();
    }

    pub fn content_type(&self) -> &str {
        if self.content_type.is_empty() {
            DEFAULT_CONTENT_TYPE
        } else {
            &self.content_type
        }
    }
}
