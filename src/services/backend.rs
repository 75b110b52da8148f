//! Backend: owns the storage root: bootstrap and bucket lifecycle.

use super::{
    bucket::Bucket,
    error::{StorageError, StorageResult},
    layout::StoragePaths,
    lock::Locker,
    path_safety::{ensure_not_symlink, resolve_within},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Layout version written to `d3.yaml`. A root stamped with any other
/// version is refused at startup.
pub const CONFIG_VERSION: u32 = 1;

const BOOTSTRAP_LOCK: &str = "d3/bootstrap";
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

#[derive(Debug, Serialize, Deserialize)]
struct BootstrapRecord {
    version: u32,
}

#[derive(Clone, Debug)]
pub struct Backend {
    paths: Arc<StoragePaths>,
    locker: Arc<dyn Locker>,
}

impl Backend {
    /// Create (or validate) the on-disk layout under the bootstrap lock.
    pub async fn init(
        paths: StoragePaths,
        locker: Arc<dyn Locker>,
        cancel: &CancellationToken,
    ) -> StorageResult<Self> {
        let _guard = locker.lock(BOOTSTRAP_LOCK, cancel).await?;

        for dir in [
            paths.root().to_path_buf(),
            paths.buckets(),
            paths.uploads(),
            paths.bin(),
        ] {
            fs::create_dir_all(&dir).await?;
        }
        ensure_same_volume(&paths.buckets(), paths.tmp()).await?;

        let config_file = paths.config_file();
        match fs::read(&config_file).await {
            Ok(raw) => {
                let record: BootstrapRecord = serde_yaml::from_slice(&raw)?;
                if record.version != CONFIG_VERSION {
                    return Err(StorageError::ConfigVersionMismatch {
                        expected: CONFIG_VERSION,
                        found: record.version,
                    });
                }
                debug!("validated {} (version {})", config_file.display(), record.version);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let record = BootstrapRecord {
                    version: CONFIG_VERSION,
                };
                fs::write(&config_file, serde_yaml::to_string(&record)?).await?;
                info!(
                    "initialized storage root {} (version {})",
                    paths.root().display(),
                    CONFIG_VERSION
                );
            }
            Err(err) => return Err(err.into()),
        }

        Ok(Self {
            paths: Arc::new(paths),
            locker,
        })
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// All bucket directories, sorted by name. Symlinks and stray files in
    /// the bucket area are skipped.
    pub async fn list_buckets(&self) -> StorageResult<Vec<Bucket>> {
        let mut entries = fs::read_dir(self.paths.buckets()).await?;
        let mut buckets = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_symlink() || !file_type.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let creation_date = match entry.metadata().await {
                Ok(meta) => creation_date(&meta),
                Err(_) => Utc::now(),
            };
            buckets.push(self.bucket_handle(name, entry.path(), creation_date));
        }
        buckets.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(buckets)
    }

    pub async fn create_bucket(&self, name: &str, cancel: &CancellationToken) -> StorageResult<Bucket> {
        let path = self.bucket_path(name)?;
        let _guard = self.locker.lock(&path.to_string_lossy(), cancel).await?;
        ensure_not_symlink(&path).await?;

        match fs::create_dir(&path).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(StorageError::BucketAlreadyExists(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        info!("created bucket {}", name);
        Ok(self.bucket_handle(name.to_string(), path, Utc::now()))
    }

    /// Remove an empty bucket.
    pub async fn delete_bucket(&self, name: &str, cancel: &CancellationToken) -> StorageResult<()> {
        let path = self.bucket_path(name)?;
        let _guard = self.locker.lock(&path.to_string_lossy(), cancel).await?;
        ensure_not_symlink(&path).await?;

        match fs::remove_dir(&path).await {
            Ok(_) => {
                info!("deleted bucket {}", name);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::BucketNotFound(name.to_string()))
            }
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => {
                Err(StorageError::BucketNotEmpty(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn head_bucket(&self, name: &str) -> StorageResult<Bucket> {
        let path = self.bucket_path(name)?;
        ensure_not_symlink(&path).await?;
        match fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                Ok(self.bucket_handle(name.to_string(), path, creation_date(&meta)))
            }
            Ok(_) => Err(StorageError::BucketNotFound(name.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::BucketNotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn bucket_path(&self, name: &str) -> StorageResult<PathBuf> {
        validate_bucket_name(name)?;
        resolve_within(&self.paths.buckets(), name)
    }

    fn bucket_handle(&self, name: String, root: PathBuf, creation_date: DateTime<Utc>) -> Bucket {
        Bucket::new(
            name,
            creation_date,
            root,
            self.paths.clone(),
            self.locker.clone(),
        )
    }
}

/// Directory modification time; close enough to a creation date.
fn creation_date(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

#[cfg(unix)]
async fn ensure_same_volume(buckets: &Path, tmp: &Path) -> StorageResult<()> {
    use std::os::unix::fs::MetadataExt;

    let buckets_dev = fs::metadata(buckets).await?.dev();
    let tmp_dev = fs::metadata(tmp).await?.dev();
    if buckets_dev != tmp_dev {
        return Err(StorageError::TmpOnDifferentVolume(tmp.to_path_buf()));
    }
    Ok(())
}

#[cfg(not(unix))]
async fn ensure_same_volume(_buckets: &Path, _tmp: &Path) -> StorageResult<()> {
    Ok(())
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn validate_bucket_name(name: &str) -> StorageResult<()> {
    let invalid = |reason: &str| {
        Err(StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return invalid("must be between 3 and 63 characters");
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return invalid("allowed characters are lowercase letters, digits, dots, and hyphens");
    }
    if name.starts_with('.') || name.ends_with('.') || name.starts_with('-') || name.ends_with('-')
    {
        return invalid("must start and end with a lowercase letter or digit");
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return invalid("cannot contain consecutive dots or dot-hyphen combinations");
    }
    if is_ipv4_like(name) {
        return invalid("must not be formatted like an IP address");
    }
    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
