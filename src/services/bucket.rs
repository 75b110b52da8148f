//! Bucket: object lifecycle and multipart uploads within one bucket directory.
//!
//! Writes are staged under the tmp area and published with a rename, so a
//! reader sees an object either complete or not at all. Reads take no lock.

use super::{
    ensure_active,
    error::{StorageError, StorageResult},
    layout::StoragePaths,
    lock::Locker,
    object::{
        BLOB_FILE, METADATA_FILE, Object, is_object_at, is_object_dir, read_sidecar,
        retire_files, write_sidecar,
    },
    path_safety::{ensure_contained, ensure_no_symlinks, resolve_within},
    walker::{NodeKind, Walker},
};
use crate::models::{
    metadata::ObjectMetadata,
    multipart::{CompletedPart, UploadedPart},
    object::{DeleteOutcome, ListV2Result, ObjectEntry},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    io::{self, ErrorKind},
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
pub const MAX_PART_NUMBER: u32 = 10_000;
const COPY_BUFFER_LEN: usize = 256 * 1024;
const UPLOAD_RECORD_FILE: &str = "upload.yaml";

/// Owner of a multipart upload, stored in its staging directory.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct UploadRecord {
    bucket: String,
    key: String,
}

#[derive(Clone, Debug)]
pub struct Bucket {
    name: String,
    creation_date: DateTime<Utc>,
    root: PathBuf,
    paths: Arc<StoragePaths>,
    locker: Arc<dyn Locker>,
}

impl Bucket {
    pub(crate) fn new(
        name: String,
        creation_date: DateTime<Utc>,
        root: PathBuf,
        paths: Arc<StoragePaths>,
        locker: Arc<dyn Locker>,
    ) -> Self {
        Self {
            name,
            creation_date,
            root,
            paths,
            locker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }

    pub async fn head_object(&self, key: &str) -> StorageResult<Object> {
        let path = self.object_path(key)?;
        self.resolve_object(key, path).await
    }

    /// Same resolution as `head_object`; the blob is opened on first read.
    pub async fn get_object(&self, key: &str) -> StorageResult<Object> {
        self.head_object(key).await
    }

    /// Store a new object. Existing objects are never overwritten.
    ///
    /// A non-empty `metadata.sha256` is the client-declared digest and must
    /// match the bytes received. Returns the sidecar as written.
    pub async fn put_object<S>(
        &self,
        key: &str,
        body: S,
        metadata: ObjectMetadata,
        cancel: &CancellationToken,
    ) -> StorageResult<ObjectMetadata>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let path = self.object_path(key)?;
        let guard = self.locker.lock(&lock_key(&path), cancel).await?;
        ensure_no_symlinks(&path, &self.root).await?;
        if is_object_at(&path).await? {
            return Err(StorageError::ObjectAlreadyExists {
                bucket: self.name.clone(),
                key: key.to_string(),
            });
        }

        let staging = self.paths.new_upload_staging();
        fs::create_dir_all(&staging).await?;
        let metadata = match stage_object(&staging, body, metadata, cancel).await {
            Ok(metadata) => metadata,
            Err(err) => {
                discard(&staging).await;
                return Err(err);
            }
        };

        if cancel.is_cancelled() || guard.scope().is_cancelled() {
            discard(&staging).await;
            return Err(StorageError::Cancelled);
        }
        self.publish(&staging, &path).await?;
        info!("stored {}/{} ({} bytes)", self.name, key, metadata.size);
        Ok(metadata)
    }

    /// One page of objects under `prefix`, in walk order.
    ///
    /// `continuation_token` is the token from the previous page.
    pub async fn list_objects_v2(
        &self,
        prefix: &str,
        max_keys: usize,
        continuation_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> StorageResult<ListV2Result> {
        if max_keys == 0 {
            return Ok(ListV2Result::default());
        }
        let start_from = match continuation_token {
            Some(token) => {
                let key = decode_continuation_token(token)?;
                Some(self.object_path(&key)?)
            }
            None => None,
        };

        let root = self.root.clone();
        let prefix = prefix.to_string();
        let walk_cancel = cancel.clone();
        let (keys, is_truncated) = tokio::task::spawn_blocking(move || {
            let mut walker = Walker::new(root, &prefix, walk_cancel);
            if let Some(start) = start_from {
                walker = walker.start_from(start);
            }
            let mut keys: Vec<String> = Vec::new();
            let mut is_truncated = false;
            walker.walk(|entry| {
                if entry.kind != NodeKind::Dir
                    || entry.rel.is_empty()
                    || !entry.rel.starts_with(&prefix)
                    || !is_object_dir(entry.children)
                {
                    return Ok(ControlFlow::Continue(()));
                }
                if keys.len() >= max_keys {
                    is_truncated = true;
                    return Ok(ControlFlow::Break(()));
                }
                keys.push(entry.rel.to_string());
                Ok(ControlFlow::Continue(()))
            })?;
            Ok::<_, StorageError>((keys, is_truncated))
        })
        .await
        .map_err(io::Error::other)??;

        let continuation_token = if is_truncated {
            keys.last().map(|key| encode_continuation_token(key))
        } else {
            None
        };

        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            let object = Object::new(
                &self.name,
                &key,
                self.root.join(&key),
                self.root.clone(),
                self.paths.clone(),
            );
            match object.metadata().await {
                Ok(metadata) => objects.push(ObjectEntry {
                    metadata: metadata.clone(),
                    key,
                }),
                // Deleted after the walk passed it.
                Err(StorageError::ObjectNotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(ListV2Result {
            objects,
            is_truncated,
            continuation_token,
        })
    }

    /// Soft-delete a single object.
    pub async fn delete_object(&self, key: &str, cancel: &CancellationToken) -> StorageResult<()> {
        let path = self.object_path(key)?;
        let _guard = self.locker.lock(&lock_key(&path), cancel).await?;
        let object = self.resolve_object(key, path).await?;
        object.delete().await?;
        info!("deleted {}/{}", self.name, key);
        Ok(())
    }

    /// Delete each key independently. With `quiet`, only failures are returned.
    pub async fn delete_objects(
        &self,
        quiet: bool,
        keys: &[String],
        cancel: &CancellationToken,
    ) -> Vec<DeleteOutcome> {
        let mut outcomes = Vec::new();
        for key in keys {
            let result = self.delete_object(key, cancel).await;
            if quiet && result.is_ok() {
                continue;
            }
            outcomes.push(DeleteOutcome {
                key: key.clone(),
                result,
            });
        }
        outcomes
    }

    /// Start a multipart upload. The sidecar is stored now so the final
    /// object inherits its content type, tags and user metadata.
    pub async fn create_multipart_upload(
        &self,
        key: &str,
        metadata: ObjectMetadata,
        cancel: &CancellationToken,
    ) -> StorageResult<String> {
        self.object_path(key)?;
        ensure_active(cancel)?;

        let upload_id = Uuid::new_v4();
        let staging = self.paths.multipart_staging(&upload_id);
        fs::create_dir_all(&staging).await?;
        let record = UploadRecord {
            bucket: self.name.clone(),
            key: key.to_string(),
        };
        let record = serde_yaml::to_string(&record)?;
        fs::write(staging.join(UPLOAD_RECORD_FILE), record).await?;
        write_sidecar(&staging.join(METADATA_FILE), &metadata).await?;
        debug!("started multipart upload {} for {}/{}", upload_id, self.name, key);
        Ok(upload_id.to_string())
    }

    /// Store one part. A part number can be uploaded once per upload.
    pub async fn upload_part<S>(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: S,
        cancel: &CancellationToken,
    ) -> StorageResult<UploadedPart>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.object_path(key)?;
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(StorageError::InvalidPartNumber(part_number));
        }
        let staging = self.existing_upload(upload_id, key).await?;
        let part_path = staging.join(part_file_name(part_number));

        let guard = self.locker.lock(&lock_key(&part_path), cancel).await?;
        match fs::symlink_metadata(&part_path).await {
            Ok(_) => return Err(StorageError::PartAlreadyExists(part_number)),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        // Written aside and renamed, so a part file is always complete.
        let tmp = staging.join(format!(".{}-{}", part_file_name(part_number), Uuid::new_v4()));
        let (digest, size) = match write_body(&tmp, body, cancel).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(err);
            }
        };
        if cancel.is_cancelled() || guard.scope().is_cancelled() {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::Cancelled);
        }
        fs::rename(&tmp, &part_path).await?;

        Ok(UploadedPart {
            part_number,
            sha256: hex::encode(digest),
            size,
        })
    }

    /// Concatenate the listed parts in part-number order and publish the
    /// result at `key`, replacing any existing object there.
    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
        cancel: &CancellationToken,
    ) -> StorageResult<ObjectMetadata> {
        let path = self.object_path(key)?;
        let staging = self.existing_upload(upload_id, key).await?;
        let guard = self.locker.lock(&lock_key(&path), cancel).await?;
        ensure_no_symlinks(&path, &self.root).await?;

        let mut parts = parts.to_vec();
        parts.sort_by_key(|part| part.part_number);
        parts.dedup_by_key(|part| part.part_number);

        let metadata = match assemble(&staging, &parts, cancel).await {
            Ok(metadata) => metadata,
            Err(err @ StorageError::InvalidPart(_)) => {
                discard(&staging).await;
                return Err(err);
            }
            Err(err) => {
                let _ = fs::remove_file(staging.join(BLOB_FILE)).await;
                return Err(err);
            }
        };

        if cancel.is_cancelled() || guard.scope().is_cancelled() {
            let _ = fs::remove_file(staging.join(BLOB_FILE)).await;
            return Err(StorageError::Cancelled);
        }
        // Past this point the upload is consumed.
        remove_leftovers(&staging).await?;
        if is_object_at(&path).await? {
            let slot = retire_files(&path, &self.paths).await?;
            debug!("replaced {}/{}, previous object in {}", self.name, key, slot.display());
        }
        self.publish(&staging, &path).await?;
        info!(
            "completed multipart upload {} as {}/{} ({} bytes)",
            upload_id, self.name, key, metadata.size
        );
        Ok(metadata)
    }

    /// Drop an upload and all its parts. Aborting a finished or unknown
    /// upload succeeds; an upload that belongs to another key is not found.
    pub async fn abort_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        self.object_path(key)?;
        ensure_active(cancel)?;
        if !fs::try_exists(self.multipart_staging(upload_id)?).await? {
            return Ok(());
        }
        let staging = self.existing_upload(upload_id, key).await?;
        match fs::remove_dir_all(&staging).await {
            Ok(_) => {
                debug!("aborted multipart upload {}", upload_id);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        resolve_within(&self.root, key)
    }

    async fn resolve_object(&self, key: &str, path: PathBuf) -> StorageResult<Object> {
        ensure_no_symlinks(&path, &self.root).await?;
        if !is_object_at(&path).await? {
            return Err(StorageError::ObjectNotFound {
                bucket: self.name.clone(),
                key: key.to_string(),
            });
        }
        Ok(Object::new(
            &self.name,
            key,
            path,
            self.root.clone(),
            self.paths.clone(),
        ))
    }

    fn multipart_staging(&self, upload_id: &str) -> StorageResult<PathBuf> {
        let id = Uuid::parse_str(upload_id)
            .map_err(|_| StorageError::UploadNotFound(upload_id.to_string()))?;
        let staging = self.paths.multipart_staging(&id);
        ensure_contained(&staging, &self.paths.uploads())?;
        Ok(staging)
    }

    /// Staging directory of an upload started in this bucket for `key`.
    async fn existing_upload(&self, upload_id: &str, key: &str) -> StorageResult<PathBuf> {
        let not_found = || StorageError::UploadNotFound(upload_id.to_string());
        let staging = self.multipart_staging(upload_id)?;
        match fs::symlink_metadata(&staging).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(not_found()),
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(err) => return Err(err.into()),
        }

        let raw = match fs::read_to_string(staging.join(UPLOAD_RECORD_FILE)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(not_found()),
            Err(err) => return Err(err.into()),
        };
        let record: UploadRecord = serde_yaml::from_str(&raw)?;
        if record.bucket != self.name || record.key != key {
            debug!(
                "upload {} belongs to {}/{}, not {}/{}",
                upload_id, record.bucket, record.key, self.name, key
            );
            return Err(not_found());
        }
        Ok(staging)
    }

    /// Make a fully staged object visible at `target`.
    ///
    /// A missing target takes the whole staging directory in one rename. A
    /// target that is already a directory (a prefix of other keys) receives
    /// the blob and then the sidecar; the sidecar rename is the moment the
    /// object appears. On failure the staging directory is left in place.
    async fn publish(&self, staging: &Path, target: &Path) -> StorageResult<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
            ensure_no_symlinks(parent, &self.root).await?;
        }

        let committed = match fs::symlink_metadata(target).await {
            Ok(meta) if meta.is_dir() => move_files_into(staging, target).await,
            Ok(_) => Err(io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{} exists and is not a directory", target.display()),
            )),
            Err(err) if err.kind() == ErrorKind::NotFound => fs::rename(staging, target).await,
            Err(err) => Err(err),
        };
        if let Err(err) = committed {
            warn!(
                "publishing {} failed, staging left at {}: {}",
                target.display(),
                staging.display(),
                err
            );
            return Err(err.into());
        }
        Ok(())
    }
}

/// Object keys: non-empty, bounded, relative, no control bytes. Every
/// segment must be non-empty, must not be `.` or `..`, and must not shadow
/// the files an object directory holds.
fn validate_key(key: &str) -> StorageResult<()> {
    let invalid = || Err(StorageError::InvalidObjectKey(key.to_string()));
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return invalid();
    }
    let reserved = |segment: &str| {
        segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment == BLOB_FILE
            || segment == METADATA_FILE
    };
    if key.split('/').any(reserved) {
        return invalid();
    }
    if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
        return invalid();
    }
    Ok(())
}

pub fn encode_continuation_token(key: &str) -> String {
    general_purpose::STANDARD.encode(key)
}

pub fn decode_continuation_token(token: &str) -> StorageResult<String> {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(StorageError::InvalidContinuationToken)
}

fn lock_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn part_file_name(part_number: u32) -> String {
    format!("part-{}", part_number)
}

/// Stream `body` into a new file at `path`, hashing as it goes.
async fn write_body<S>(
    path: &Path,
    body: S,
    cancel: &CancellationToken,
) -> StorageResult<(Vec<u8>, u64)>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let mut file = File::create(path).await?;
    let mut digest = Sha256::new();
    let mut size: u64 = 0;
    pin_mut!(body);
    while let Some(chunk) = body.next().await {
        ensure_active(cancel)?;
        let chunk = chunk?;
        size += chunk.len() as u64;
        digest.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((digest.finalize().to_vec(), size))
}

async fn stage_object<S>(
    staging: &Path,
    body: S,
    mut metadata: ObjectMetadata,
    cancel: &CancellationToken,
) -> StorageResult<ObjectMetadata>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let (digest, size) = write_body(&staging.join(BLOB_FILE), body, cancel).await?;
    let actual = hex::encode(&digest);
    if !metadata.sha256.is_empty() && !metadata.sha256.eq_ignore_ascii_case(&actual) {
        return Err(StorageError::ObjectChecksumMismatch {
            expected: metadata.sha256,
            actual,
        });
    }
    metadata.seal(&digest, size);
    write_sidecar(&staging.join(METADATA_FILE), &metadata).await?;
    Ok(metadata)
}

/// Build the final blob of a multipart upload inside its staging directory
/// and rewrite the sidecar for it. Part files stay until
/// `remove_leftovers`.
async fn assemble(
    staging: &Path,
    parts: &[CompletedPart],
    cancel: &CancellationToken,
) -> StorageResult<ObjectMetadata> {
    if parts.is_empty() {
        return Err(StorageError::InvalidPart(0));
    }
    for part in parts {
        let path = staging.join(part_file_name(part.part_number));
        match fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(StorageError::InvalidPart(part.part_number)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::InvalidPart(part.part_number));
            }
            Err(err) => return Err(err.into()),
        }
    }

    let mut blob = File::create(staging.join(BLOB_FILE)).await?;
    let mut whole = Sha256::new();
    let mut size: u64 = 0;
    let mut buf = vec![0u8; COPY_BUFFER_LEN];
    for part in parts {
        ensure_active(cancel)?;
        let mut input = File::open(staging.join(part_file_name(part.part_number))).await?;
        let mut part_digest = Sha256::new();
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            whole.update(&buf[..n]);
            part_digest.update(&buf[..n]);
            blob.write_all(&buf[..n]).await?;
            size += n as u64;
        }
        if let Some(etag) = part.etag.as_deref() {
            let expected = etag.trim_matches('"');
            if !expected.is_empty()
                && !expected.eq_ignore_ascii_case(&hex::encode(part_digest.finalize()))
            {
                return Err(StorageError::InvalidPart(part.part_number));
            }
        }
    }
    blob.flush().await?;
    blob.sync_all().await?;
    ensure_active(cancel)?;

    let sidecar = staging.join(METADATA_FILE);
    let mut metadata = read_sidecar(&sidecar).await?;
    metadata.seal(&whole.finalize(), size);
    write_sidecar(&sidecar, &metadata).await?;
    Ok(metadata)
}

/// Remove everything but the blob and sidecar from an assembled upload:
/// every part file, referenced or not, unfinished part uploads and the
/// upload record. The directory becomes the object.
async fn remove_leftovers(staging: &Path) -> io::Result<()> {
    let mut entries = fs::read_dir(staging).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name != BLOB_FILE && name != METADATA_FILE {
            fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

async fn move_files_into(staging: &Path, target: &Path) -> io::Result<()> {
    fs::rename(staging.join(BLOB_FILE), target.join(BLOB_FILE)).await?;
    if let Err(err) = fs::rename(staging.join(METADATA_FILE), target.join(METADATA_FILE)).await {
        // The blob goes back so the target holds no half object.
        if let Err(undo) = fs::rename(target.join(BLOB_FILE), staging.join(BLOB_FILE)).await {
            warn!(
                "could not move {} back to staging: {}",
                target.join(BLOB_FILE).display(),
                undo
            );
        }
        return Err(err);
    }
    if let Err(err) = fs::remove_dir(staging).await {
        debug!("could not remove staging {}: {}", staging.display(), err);
    }
    Ok(())
}

/// Best-effort removal of a staging directory that will never be published.
async fn discard(staging: &Path) {
    if let Err(err) = fs::remove_dir_all(staging).await {
        if err.kind() != ErrorKind::NotFound {
            warn!("could not discard staging {}: {}", staging.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{backend::Backend, lock::LocalLocker};
    use futures::stream;
    use std::collections::BTreeSet;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        backend: Backend,
        bucket: Bucket,
        cancel: CancellationToken,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let backend = Backend::init(
            StoragePaths::new(dir.path(), None),
            Arc::new(LocalLocker::new()),
            &cancel,
        )
        .await
        .unwrap();
        let bucket = backend.create_bucket("bkt", &cancel).await.unwrap();
        Fixture {
            dir,
            backend,
            bucket,
            cancel,
        }
    }

    fn body(data: &[u8]) -> impl Stream<Item = io::Result<Bytes>> + Send + use<> {
        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(3)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks)
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn declared(data: &[u8]) -> ObjectMetadata {
        ObjectMetadata {
            sha256: sha256_hex(data),
            ..ObjectMetadata::with_content_type("text/plain")
        }
    }

    async fn put(fx: &Fixture, key: &str, data: &[u8]) {
        fx.bucket
            .put_object(key, body(data), declared(data), &fx.cancel)
            .await
            .unwrap();
    }

    async fn read_all(fx: &Fixture, key: &str) -> Vec<u8> {
        let object = fx.bucket.get_object(key).await.unwrap();
        let mut out = Vec::new();
        object.into_reader().await.unwrap().read_to_end(&mut out).await.unwrap();
        out
    }

    fn staged_entries(fx: &Fixture) -> usize {
        std::fs::read_dir(fx.dir.path().join("tmp/uploads")).unwrap().count()
    }

    #[tokio::test]
    async fn put_then_get_round_trips_bytes_and_digest() {
        let fx = fixture().await;
        let data = b"hello, object store";
        let mut meta = declared(data);
        meta.tags.insert("env".into(), "test".into());
        meta.meta.insert("author".into(), "me".into());

        let stored = fx.bucket.put_object("docs/a.txt", body(data), meta, &fx.cancel).await.unwrap();
        assert_eq!(stored.size, data.len() as u64);

        assert_eq!(read_all(&fx, "docs/a.txt").await, data);
        let object = fx.bucket.head_object("docs/a.txt").await.unwrap();
        let loaded = object.metadata().await.unwrap();
        assert_eq!(loaded.sha256, sha256_hex(data));
        assert_eq!(loaded.tags.get("env").map(String::as_str), Some("test"));
        assert_eq!(loaded.meta.get("author").map(String::as_str), Some("me"));
        assert_eq!(loaded.content_type(), "text/plain");
        assert_eq!(staged_entries(&fx), 0);
    }

    #[tokio::test]
    async fn undeclared_digest_is_computed() {
        let fx = fixture().await;
        let stored = fx
            .bucket
            .put_object("k", body(b"abc"), ObjectMetadata::default(), &fx.cancel)
            .await
            .unwrap();
        assert_eq!(stored.sha256, sha256_hex(b"abc"));
    }

    #[tokio::test]
    async fn checksum_mismatch_leaves_nothing_behind() {
        let fx = fixture().await;
        let wrong = declared(b"something else");
        let err = fx.bucket.put_object("k", body(b"abc"), wrong, &fx.cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::ObjectChecksumMismatch { .. }));
        assert!(matches!(
            fx.bucket.head_object("k").await,
            Err(StorageError::ObjectNotFound { .. })
        ));
        assert_eq!(staged_entries(&fx), 0);
    }

    #[tokio::test]
    async fn failing_body_leaves_nothing_behind() {
        let fx = fixture().await;
        let broken = stream::iter(vec![
            Ok(Bytes::from_static(b"part")),
            Err(io::Error::other("client went away")),
        ]);
        assert!(fx.bucket.put_object("k", broken, ObjectMetadata::default(), &fx.cancel).await.is_err());
        assert!(fx.bucket.head_object("k").await.is_err());
        assert_eq!(staged_entries(&fx), 0);
    }

    #[tokio::test]
    async fn cancelled_put_is_not_published() {
        let fx = fixture().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fx.bucket.put_object("k", body(b"abc"), ObjectMetadata::default(), &cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
        assert!(fx.bucket.head_object("k").await.is_err());
    }

    #[tokio::test]
    async fn existing_object_is_not_overwritten() {
        let fx = fixture().await;
        put(&fx, "k", b"first").await;
        let err = fx.bucket.put_object("k", body(b"second"), declared(b"second"), &fx.cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::ObjectAlreadyExists { .. }));
        assert_eq!(read_all(&fx, "k").await, b"first");
    }

    #[tokio::test]
    async fn objects_and_prefixes_share_paths() {
        let fx = fixture().await;
        put(&fx, "a/child", b"child").await;
        put(&fx, "a", b"parent").await;
        assert_eq!(read_all(&fx, "a").await, b"parent");
        assert_eq!(read_all(&fx, "a/child").await, b"child");

        fx.bucket.delete_object("a", &fx.cancel).await.unwrap();
        assert!(fx.bucket.head_object("a").await.is_err());
        assert_eq!(read_all(&fx, "a/child").await, b"child");
    }

    #[tokio::test]
    async fn bad_keys_are_rejected() {
        let fx = fixture().await;
        for key in ["", "../escape", "a/../../b", "a/./b", "/abs", "nul\0byte"] {
            assert!(
                matches!(fx.bucket.head_object(key).await, Err(StorageError::InvalidObjectKey(_))),
                "{key:?}"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_paths_are_refused() {
        let fx = fixture().await;
        let outside = fx.dir.path().join("outside");
        std::fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, fx.dir.path().join("buckets/bkt/link")).unwrap();

        let err = fx.bucket.put_object("link/x", body(b"x"), ObjectMetadata::default(), &fx.cancel).await.unwrap_err();
        assert!(matches!(err, StorageError::SymlinkNotAllowed(_)));
        assert!(std::fs::read_dir(&outside).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn paginated_listing_walks_pages_by_token() {
        let fx = fixture().await;
        put(&fx, "a/1.txt", b"hi").await;
        put(&fx, "a/2.txt", b"yo").await;

        let first = fx.bucket.list_objects_v2("a/", 1, None, &fx.cancel).await.unwrap();
        let keys: Vec<&str> = first.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a/1.txt"]);
        assert!(first.is_truncated);
        assert_eq!(first.continuation_token.as_deref(), Some("YS8xLnR4dA=="));

        let second = fx
            .bucket
            .list_objects_v2("a/", 1, first.continuation_token.as_deref(), &fx.cancel)
            .await
            .unwrap();
        let keys: Vec<&str> = second.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a/2.txt"]);
        assert!(!second.is_truncated);
        assert!(second.continuation_token.is_none());
        assert_eq!(second.objects[0].metadata.size, 2);
    }

    #[tokio::test]
    async fn pages_cover_the_full_listing_exactly_once() {
        let fx = fixture().await;
        let keys = [
            "a", "a/b", "a/b/c", "a/d", "b.txt", "c/x/y/z", "c/x/y/z2", "d/1", "d/10", "d/2",
        ];
        for key in keys {
            put(&fx, key, key.as_bytes()).await;
        }

        let full = fx.bucket.list_objects_v2("", usize::MAX, None, &fx.cancel).await.unwrap();
        assert!(!full.is_truncated);
        let expected: Vec<String> = full.objects.iter().map(|o| o.key.clone()).collect();
        assert_eq!(expected.len(), keys.len());

        for page_size in 1..=4 {
            let mut seen = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let page = fx
                    .bucket
                    .list_objects_v2("", page_size, token.as_deref(), &fx.cancel)
                    .await
                    .unwrap();
                assert!(page.objects.len() <= page_size);
                seen.extend(page.objects.into_iter().map(|o| o.key));
                if !page.is_truncated {
                    break;
                }
                token = page.continuation_token;
            }
            assert_eq!(seen, expected, "page size {page_size}");
            let unique: BTreeSet<&String> = seen.iter().collect();
            assert_eq!(unique.len(), seen.len());
        }
    }

    #[tokio::test]
    async fn listing_respects_prefix_and_rejects_bad_tokens() {
        let fx = fixture().await;
        put(&fx, "logs/1", b"1").await;
        put(&fx, "logs-old/2", b"2").await;
        put(&fx, "other", b"3").await;

        let page = fx.bucket.list_objects_v2("logs/", 10, None, &fx.cancel).await.unwrap();
        let keys: Vec<&str> = page.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["logs/1"]);

        let page = fx.bucket.list_objects_v2("logs", 10, None, &fx.cancel).await.unwrap();
        assert_eq!(page.objects.len(), 2);

        assert!(matches!(
            fx.bucket.list_objects_v2("", 10, Some("%%%"), &fx.cancel).await,
            Err(StorageError::InvalidContinuationToken)
        ));
        let stale = encode_continuation_token("logs/9");
        assert!(matches!(
            fx.bucket.list_objects_v2("", 10, Some(&stale), &fx.cancel).await,
            Err(StorageError::StartFromNotExist(_))
        ));
        let elsewhere = encode_continuation_token("other");
        assert!(matches!(
            fx.bucket.list_objects_v2("logs/", 10, Some(&elsewhere), &fx.cancel).await,
            Err(StorageError::StartFromBadPrefix { .. })
        ));
        let escaping = encode_continuation_token("../x");
        assert!(matches!(
            fx.bucket.list_objects_v2("", 10, Some(&escaping), &fx.cancel).await,
            Err(StorageError::InvalidObjectKey(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_object_and_empty_ancestors() {
        let fx = fixture().await;
        put(&fx, "x/y/z", b"data").await;
        fx.bucket.delete_object("x/y/z", &fx.cancel).await.unwrap();

        assert!(matches!(
            fx.bucket.head_object("x/y/z").await,
            Err(StorageError::ObjectNotFound { .. })
        ));
        assert!(!fx.dir.path().join("buckets/bkt/x").exists());
        assert!(fx.dir.path().join("buckets/bkt").is_dir());
        assert_eq!(std::fs::read_dir(fx.dir.path().join("tmp/bin")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn batch_delete_reports_each_key() {
        let fx = fixture().await;
        put(&fx, "one", b"1").await;
        put(&fx, "two", b"2").await;
        let keys = vec!["one".to_string(), "missing".to_string(), "two".to_string()];

        let outcomes = fx.bucket.delete_objects(false, &keys, &fx.cancel).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(outcomes[1].result, Err(StorageError::ObjectNotFound { .. })));
        assert!(outcomes[2].result.is_ok());
        assert!(fx.bucket.head_object("two").await.is_err());

        put(&fx, "three", b"3").await;
        let keys = vec!["three".to_string(), "missing".to_string()];
        let outcomes = fx.bucket.delete_objects(true, &keys, &fx.cancel).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].key, "missing");
    }

    #[tokio::test]
    async fn multipart_concatenates_in_part_number_order() {
        let fx = fixture().await;
        let mut meta = ObjectMetadata::with_content_type("video/mp4");
        meta.meta.insert("origin".into(), "camera".into());
        let upload_id = fx.bucket.create_multipart_upload("movie", meta, &fx.cancel).await.unwrap();

        for (n, data) in [(3u32, &b"cc"[..]), (1, &b"aaaa"[..]), (2, &b"bbb"[..])] {
            let part = fx.bucket.upload_part("movie", &upload_id, n, body(data), &fx.cancel).await.unwrap();
            assert_eq!(part.sha256, sha256_hex(data));
        }

        let parts = vec![CompletedPart::new(2), CompletedPart::new(3), CompletedPart::new(1)];
        let stored = fx
            .bucket
            .complete_multipart_upload("movie", &upload_id, &parts, &fx.cancel)
            .await
            .unwrap();

        assert_eq!(stored.size, 9);
        assert_eq!(stored.sha256, sha256_hex(b"aaaabbbcc"));
        assert_eq!(read_all(&fx, "movie").await, b"aaaabbbcc");
        let object = fx.bucket.head_object("movie").await.unwrap();
        let loaded = object.metadata().await.unwrap();
        assert_eq!(loaded.content_type(), "video/mp4");
        assert_eq!(loaded.meta.get("origin").map(String::as_str), Some("camera"));
        let object_dir: Vec<_> = std::fs::read_dir(object.path()).unwrap().collect();
        assert_eq!(object_dir.len(), 2);
        assert_eq!(staged_entries(&fx), 0);
    }

    #[tokio::test]
    async fn parts_cannot_be_reuploaded_or_out_of_range() {
        let fx = fixture().await;
        let id = fx.bucket.create_multipart_upload("k", ObjectMetadata::default(), &fx.cancel).await.unwrap();
        fx.bucket.upload_part("k", &id, 1, body(b"x"), &fx.cancel).await.unwrap();
        assert!(matches!(
            fx.bucket.upload_part("k", &id, 1, body(b"y"), &fx.cancel).await,
            Err(StorageError::PartAlreadyExists(1))
        ));
        assert!(matches!(
            fx.bucket.upload_part("k", &id, 0, body(b"y"), &fx.cancel).await,
            Err(StorageError::InvalidPartNumber(0))
        ));
        assert!(matches!(
            fx.bucket.upload_part("k", "not-a-uuid", 2, body(b"y"), &fx.cancel).await,
            Err(StorageError::UploadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_part_discards_the_upload() {
        let fx = fixture().await;
        let id = fx.bucket.create_multipart_upload("k", ObjectMetadata::default(), &fx.cancel).await.unwrap();
        fx.bucket.upload_part("k", &id, 1, body(b"x"), &fx.cancel).await.unwrap();

        let parts = vec![CompletedPart::new(1), CompletedPart::new(2)];
        assert!(matches!(
            fx.bucket.complete_multipart_upload("k", &id, &parts, &fx.cancel).await,
            Err(StorageError::InvalidPart(2))
        ));
        assert!(fx.bucket.head_object("k").await.is_err());
        assert_eq!(staged_entries(&fx), 0);
    }

    #[tokio::test]
    async fn mismatched_part_etag_is_rejected() {
        let fx = fixture().await;
        let id = fx.bucket.create_multipart_upload("k", ObjectMetadata::default(), &fx.cancel).await.unwrap();
        fx.bucket.upload_part("k", &id, 1, body(b"x"), &fx.cancel).await.unwrap();

        let parts = vec![CompletedPart {
            part_number: 1,
            etag: Some(format!("\"{}\"", sha256_hex(b"y"))),
        }];
        assert!(matches!(
            fx.bucket.complete_multipart_upload("k", &id, &parts, &fx.cancel).await,
            Err(StorageError::InvalidPart(1))
        ));
        assert!(fx.bucket.head_object("k").await.is_err());
    }

    #[tokio::test]
    async fn completion_replaces_an_existing_object() {
        let fx = fixture().await;
        put(&fx, "k", b"old").await;
        let id = fx.bucket.create_multipart_upload("k", ObjectMetadata::default(), &fx.cancel).await.unwrap();
        let part = fx.bucket.upload_part("k", &id, 1, body(b"new"), &fx.cancel).await.unwrap();

        let parts = vec![CompletedPart {
            part_number: 1,
            etag: Some(part.sha256.clone()),
        }];
        fx.bucket.complete_multipart_upload("k", &id, &parts, &fx.cancel).await.unwrap();
        assert_eq!(read_all(&fx, "k").await, b"new");
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let fx = fixture().await;
        let id = fx.bucket.create_multipart_upload("k", ObjectMetadata::default(), &fx.cancel).await.unwrap();
        fx.bucket.upload_part("k", &id, 1, body(b"x"), &fx.cancel).await.unwrap();

        fx.bucket.abort_multipart_upload("k", &id, &fx.cancel).await.unwrap();
        fx.bucket.abort_multipart_upload("k", &id, &fx.cancel).await.unwrap();
        assert_eq!(staged_entries(&fx), 0);
        assert!(matches!(
            fx.bucket.upload_part("k", &id, 2, body(b"y"), &fx.cancel).await,
            Err(StorageError::UploadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn keys_naming_object_files_or_empty_segments_are_rejected() {
        let fx = fixture().await;
        for key in ["x/blob", "blob", "y/metadata.yaml/z", "a//b", "d/", "/abs"] {
            let err = fx
                .bucket
                .put_object(key, body(b"v"), ObjectMetadata::default(), &fx.cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidObjectKey(_)), "{key:?}");
        }
        assert_eq!(staged_entries(&fx), 0);
        put(&fx, "blobs/metadata", b"fine").await;
        assert_eq!(read_all(&fx, "blobs/metadata").await, b"fine");
    }

    #[tokio::test]
    async fn failed_sidecar_move_takes_the_blob_back() {
        let fx = fixture().await;
        put(&fx, "y/c", b"child").await;
        std::fs::create_dir(fx.dir.path().join("buckets/bkt/y").join(METADATA_FILE)).unwrap();

        assert!(fx.bucket.put_object("y", body(b"v"), declared(b"v"), &fx.cancel).await.is_err());
        assert!(!fx.dir.path().join("buckets/bkt/y").join(BLOB_FILE).exists());
        assert_eq!(read_all(&fx, "y/c").await, b"child");
    }

    #[tokio::test]
    async fn zero_max_keys_is_an_empty_final_page() {
        let fx = fixture().await;
        put(&fx, "k", b"v").await;
        let page = fx.bucket.list_objects_v2("", 0, None, &fx.cancel).await.unwrap();
        assert!(page.objects.is_empty());
        assert!(!page.is_truncated);
        assert!(page.continuation_token.is_none());
    }

    #[tokio::test]
    async fn racing_puts_on_one_key_store_exactly_one() {
        let fx = fixture().await;
        let (first, second) = tokio::join!(
            fx.bucket.put_object("race", body(b"first"), declared(b"first"), &fx.cancel),
            fx.bucket.put_object("race", body(b"second"), declared(b"second"), &fx.cancel),
        );
        let stored = match (first, second) {
            (Ok(_), Err(StorageError::ObjectAlreadyExists { .. })) => b"first".to_vec(),
            (Err(StorageError::ObjectAlreadyExists { .. }), Ok(_)) => b"second".to_vec(),
            other => panic!("expected one winner, got {other:?}"),
        };
        assert_eq!(read_all(&fx, "race").await, stored);
        assert_eq!(staged_entries(&fx), 0);
    }

    #[tokio::test]
    async fn completion_racing_a_put_leaves_a_whole_object() {
        let fx = fixture().await;
        let id = fx.bucket.create_multipart_upload("race", ObjectMetadata::default(), &fx.cancel).await.unwrap();
        fx.bucket.upload_part("race", &id, 1, body(b"multi"), &fx.cancel).await.unwrap();
        fx.bucket.upload_part("race", &id, 2, body(b"part"), &fx.cancel).await.unwrap();
        let parts = vec![CompletedPart::new(1), CompletedPart::new(2)];

        let (completed, stored) = tokio::join!(
            fx.bucket.complete_multipart_upload("race", &id, &parts, &fx.cancel),
            fx.bucket.put_object("race", body(b"single"), declared(b"single"), &fx.cancel),
        );
        completed.unwrap();
        assert!(matches!(stored, Ok(_) | Err(StorageError::ObjectAlreadyExists { .. })));

        // Completion replaces whatever the put left, so the upload wins.
        let data = read_all(&fx, "race").await;
        assert_eq!(data, b"multipart");
        let object = fx.bucket.head_object("race").await.unwrap();
        let loaded = object.metadata().await.unwrap();
        assert_eq!(loaded.sha256, sha256_hex(&data));
        assert_eq!(loaded.size, data.len() as u64);
    }

    #[tokio::test]
    async fn uploads_are_bound_to_their_bucket_and_key() {
        let fx = fixture().await;
        let other = fx.backend.create_bucket("other", &fx.cancel).await.unwrap();
        let id = fx.bucket.create_multipart_upload("k1", ObjectMetadata::default(), &fx.cancel).await.unwrap();
        fx.bucket.upload_part("k1", &id, 1, body(b"x"), &fx.cancel).await.unwrap();
        let parts = vec![CompletedPart::new(1)];

        assert!(matches!(
            fx.bucket.upload_part("k2", &id, 2, body(b"y"), &fx.cancel).await,
            Err(StorageError::UploadNotFound(_))
        ));
        assert!(matches!(
            other.upload_part("k1", &id, 2, body(b"y"), &fx.cancel).await,
            Err(StorageError::UploadNotFound(_))
        ));
        assert!(matches!(
            other.complete_multipart_upload("k1", &id, &parts, &fx.cancel).await,
            Err(StorageError::UploadNotFound(_))
        ));
        assert!(matches!(
            fx.bucket.abort_multipart_upload("k2", &id, &fx.cancel).await,
            Err(StorageError::UploadNotFound(_))
        ));
        assert!(other.head_object("k1").await.is_err());

        fx.bucket.complete_multipart_upload("k1", &id, &parts, &fx.cancel).await.unwrap();
        assert_eq!(read_all(&fx, "k1").await, b"x");
        let object = fx.bucket.head_object("k1").await.unwrap();
        assert_eq!(std::fs::read_dir(object.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn cancelled_completion_keeps_parts_for_a_retry() {
        let fx = fixture().await;
        let id = fx.bucket.create_multipart_upload("k", ObjectMetadata::default(), &fx.cancel).await.unwrap();
        fx.bucket.upload_part("k", &id, 1, body(b"ab"), &fx.cancel).await.unwrap();
        fx.bucket.upload_part("k", &id, 2, body(b"cd"), &fx.cancel).await.unwrap();
        let parts = vec![CompletedPart::new(1), CompletedPart::new(2)];
        let staging = fx.bucket.multipart_staging(&id).unwrap();

        // A built blob does not consume the parts.
        assemble(&staging, &parts, &fx.cancel).await.unwrap();
        assert!(staging.join(part_file_name(1)).is_file());
        assert!(staging.join(part_file_name(2)).is_file());

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            fx.bucket.complete_multipart_upload("k", &id, &parts, &cancelled).await,
            Err(StorageError::Cancelled)
        ));
        assert!(staging.join(part_file_name(1)).is_file());
        assert!(fx.bucket.head_object("k").await.is_err());

        let stored = fx.bucket.complete_multipart_upload("k", &id, &parts, &fx.cancel).await.unwrap();
        assert_eq!(stored.sha256, sha256_hex(b"abcd"));
        assert_eq!(read_all(&fx, "k").await, b"abcd");
    }
}
