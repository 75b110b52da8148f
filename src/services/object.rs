//! One stored object: a directory holding `blob` and `metadata.yaml`.
//!
//! A directory is an object exactly when both files are present as regular
//! files. Anything else is a plain path component, which lets objects and
//! key prefixes share the same directory tree.

use super::{
    error::{StorageError, StorageResult},
    layout::StoragePaths,
    walker::DirChild,
};
use crate::models::metadata::ObjectMetadata;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::OnceCell,
};
use tracing::debug;

pub const BLOB_FILE: &str = "blob";
pub const METADATA_FILE: &str = "metadata.yaml";

/// The object predicate over an already-read directory listing.
pub fn is_object_dir(children: &[DirChild]) -> bool {
    let has_file = |name: &str| children.iter().any(|c| c.is_file && c.name == name);
    has_file(BLOB_FILE) && has_file(METADATA_FILE)
}

/// The object predicate, probing the two files directly.
pub async fn is_object_at(dir: &Path) -> StorageResult<bool> {
    Ok(is_regular_file(&dir.join(BLOB_FILE)).await?
        && is_regular_file(&dir.join(METADATA_FILE)).await?)
}

async fn is_regular_file(path: &Path) -> StorageResult<bool> {
    match fs::symlink_metadata(path).await {
        Ok(meta) => Ok(meta.file_type().is_file()),
        Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

/// Read and parse a sidecar file.
pub async fn read_sidecar(path: &Path) -> StorageResult<ObjectMetadata> {
    let raw = fs::read(path).await?;
    serde_yaml::from_slice(&raw).map_err(|source| StorageError::ObjectMetadataNotReadable {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a sidecar file and flush it to disk.
pub async fn write_sidecar(path: &Path, metadata: &ObjectMetadata) -> StorageResult<()> {
    let yaml = serde_yaml::to_string(metadata)?;
    let mut file = File::create(path).await?;
    file.write_all(yaml.as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}

/// Move the sidecar, then the blob, of the object at `dir` into a new bin
/// slot. The object stops being visible with the first rename.
pub async fn retire_files(dir: &Path, paths: &StoragePaths) -> StorageResult<PathBuf> {
    let slot = paths.new_bin_slot();
    fs::create_dir_all(&slot).await?;
    fs::rename(dir.join(METADATA_FILE), slot.join(METADATA_FILE)).await?;
    fs::rename(dir.join(BLOB_FILE), slot.join(BLOB_FILE)).await?;
    Ok(slot)
}

/// Remove empty directories from `start` upward, stopping below `stop`.
///
/// Stops quietly at the first non-empty directory; a directory that is
/// already gone is stepped over.
pub async fn prune_empty_dirs(start: &Path, stop: &Path) -> StorageResult<()> {
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        match fs::remove_dir(&current).await {
            Ok(_) => debug!("pruned empty directory {}", current.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
            Err(err) => return Err(err.into()),
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
    Ok(())
}

/// Handle to an object that existed when it was resolved.
///
/// The sidecar is read on first `metadata()` call and cached; the blob is
/// opened on first read or seek.
#[derive(Debug)]
pub struct Object {
    bucket: String,
    key: String,
    path: PathBuf,
    bucket_root: PathBuf,
    paths: Arc<StoragePaths>,
    metadata: OnceCell<ObjectMetadata>,
    blob: Option<File>,
}

impl Object {
    pub(crate) fn new(
        bucket: &str,
        key: &str,
        path: PathBuf,
        bucket_root: PathBuf,
        paths: Arc<StoragePaths>,
    ) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            path,
            bucket_root,
            paths,
            metadata: OnceCell::new(),
            blob: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn metadata(&self) -> StorageResult<&ObjectMetadata> {
        self.metadata
            .get_or_try_init(|| async {
                read_sidecar(&self.path.join(METADATA_FILE))
                    .await
                    .map_err(|err| self.not_found_or(err))
            })
            .await
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        Ok(self.blob().await?.read(buf).await?)
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> StorageResult<u64> {
        Ok(self.blob().await?.seek(pos).await?)
    }

    /// Hand the (possibly already positioned) blob over for streaming.
    pub async fn into_reader(mut self) -> StorageResult<File> {
        match self.blob.take() {
            Some(file) => Ok(file),
            None => self.open_blob().await,
        }
    }

    /// Soft-delete: move the object into the bin, then prune the directories
    /// it leaves empty, up to but excluding the bucket root.
    pub async fn delete(&self) -> StorageResult<()> {
        fs::create_dir_all(self.paths.bin()).await?;
        let slot = if self.holds_only_object_files().await? {
            let slot = self.paths.new_bin_slot();
            fs::rename(&self.path, &slot)
                .await
                .map_err(|err| self.not_found_or(err.into()))?;
            slot
        } else {
            retire_files(&self.path, &self.paths)
                .await
                .map_err(|err| self.not_found_or(err))?
        };
        debug!(
            "moved {}/{} to bin slot {}",
            self.bucket,
            self.key,
            slot.display()
        );
        prune_empty_dirs(&self.path, &self.bucket_root).await
    }

    async fn holds_only_object_files(&self) -> StorageResult<bool> {
        let mut entries = fs::read_dir(&self.path)
            .await
            .map_err(|err| self.not_found_or(err.into()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name != BLOB_FILE && name != METADATA_FILE {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn blob(&mut self) -> StorageResult<&mut File> {
        let file = match self.blob.take() {
            Some(file) => file,
            None => self.open_blob().await?,
        };
        Ok(self.blob.insert(file))
    }

    async fn open_blob(&self) -> StorageResult<File> {
        File::open(self.path.join(BLOB_FILE))
            .await
            .map_err(|err| self.not_found_or(err.into()))
    }

    fn not_found_or(&self, err: StorageError) -> StorageError {
        match err {
            StorageError::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {
                StorageError::ObjectNotFound {
                    bucket: self.bucket.clone(),
                    key: self.key.clone(),
                }
            }
            other => other,
        }
    }
}
