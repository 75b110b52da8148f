//! On-disk layout of a storage root.
//!
//! ```text
//! <root>/d3.yaml                         bootstrap record {version}
//! <root>/buckets/<bucket>/<key...>/      object dirs (blob + metadata.yaml)
//! <tmp>/uploads/<uuid>                   single-part staging
//! <tmp>/uploads/multipart-<upload id>    multipart staging (part-N + metadata.yaml)
//! <tmp>/bin/<uuid>                       soft-deleted objects
//! ```
//!
//! `<tmp>` defaults to `<root>/tmp` and must live on the same filesystem as
//! `<root>` so staging directories can be renamed into place.

use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const CONFIG_FILE: &str = "d3.yaml";
pub const BUCKETS_DIR: &str = "buckets";
pub const UPLOADS_DIR: &str = "uploads";
pub const BIN_DIR: &str = "bin";
pub const MULTIPART_PREFIX: &str = "multipart-";

/// Resolved storage paths, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
    tmp: PathBuf,
}

impl StoragePaths {
    pub fn new(root: impl Into<PathBuf>, tmp: Option<PathBuf>) -> Self {
        let root = root.into();
        let tmp = tmp.unwrap_or_else(|| root.join("tmp"));
        Self { root, tmp }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn buckets(&self) -> PathBuf {
        self.root.join(BUCKETS_DIR)
    }

    pub fn tmp(&self) -> &Path {
        &self.tmp
    }

    pub fn uploads(&self) -> PathBuf {
        self.tmp.join(UPLOADS_DIR)
    }

    pub fn bin(&self) -> PathBuf {
        self.tmp.join(BIN_DIR)
    }

    /// A fresh staging directory path for a single-part upload.
    pub fn new_upload_staging(&self) -> PathBuf {
        self.uploads().join(Uuid::new_v4().to_string())
    }

    /// Staging directory for a multipart upload. `upload_id` is a UUID, so
    /// the result cannot leave the uploads area.
    pub fn multipart_staging(&self, upload_id: &Uuid) -> PathBuf {
        self.uploads()
            .join(format!("{}{}", MULTIPART_PREFIX, upload_id.hyphenated()))
    }

    /// A unique slot under the bin area for one soft-deleted object.
    pub fn new_bin_slot(&self) -> PathBuf {
        self.bin().join(Uuid::new_v4().to_string())
    }
}
