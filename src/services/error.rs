//! Error taxonomy shared by every storage operation.

use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{0}` is not empty")]
    BucketNotEmpty(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },

    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("object `{key}` already exists in bucket `{bucket}`")]
    ObjectAlreadyExists { bucket: String, key: String },
    #[error("checksum mismatch: declared {expected}, computed {actual}")]
    ObjectChecksumMismatch { expected: String, actual: String },
    #[error("metadata at {path} is not readable: {source}")]
    ObjectMetadataNotReadable {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),

    #[error("path {0} escapes its root")]
    PathTraversal(PathBuf),
    #[error("symlink not allowed at {0}")]
    SymlinkNotAllowed(PathBuf),

    #[error("config version mismatch: expected {expected}, found {found}")]
    ConfigVersionMismatch { expected: u32, found: u32 },
    #[error("tmp area {0} is not on the same filesystem as the storage root")]
    TmpOnDifferentVolume(PathBuf),

    #[error("walk start {0} does not exist")]
    StartFromNotExist(PathBuf),
    #[error("walk start {start} does not match prefix `{prefix}`")]
    StartFromBadPrefix { start: PathBuf, prefix: String },
    #[error("walk start {0} is outside the walk root")]
    StartFromOutsideRoot(PathBuf),
    #[error("continuation token is not valid")]
    InvalidContinuationToken,

    #[error("multipart upload `{0}` not found")]
    UploadNotFound(String),
    #[error("part {0} is missing or does not match")]
    InvalidPart(u32),
    #[error("part number {0} is out of range")]
    InvalidPartNumber(u32),
    #[error("part {0} was already uploaded")]
    PartAlreadyExists(u32),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
