//! Containment and symlink checks for paths composed from client input.
//!
//! Every operation that turns a bucket name, object key or upload ID into a
//! filesystem path goes through [`resolve_within`] (lexical containment) and,
//! before touching the path, [`ensure_no_symlinks`].

use super::error::{StorageError, StorageResult};
use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};
use tokio::fs;

/// Lexically resolve `.` and `..` components without touching the filesystem.
///
/// `..` never climbs above a root or prefix component.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Fail with `PathTraversal` unless `candidate` equals `parent` or lies below it.
///
/// The comparison is per path component, so `/data/buckets-evil` is not
/// inside `/data/buckets`.
pub fn ensure_contained(candidate: &Path, parent: &Path) -> StorageResult<()> {
    if normalize(candidate).starts_with(normalize(parent)) {
        Ok(())
    } else {
        Err(StorageError::PathTraversal(candidate.to_path_buf()))
    }
}

/// Join a slash-separated relative name onto `root` and prove the result
/// stays inside it. Returns the normalized path.
pub fn resolve_within(root: &Path, relative: &str) -> StorageResult<PathBuf> {
    let candidate = normalize(&root.join(relative.trim_start_matches('/')));
    ensure_contained(&candidate, root)?;
    Ok(candidate)
}

/// Fail with `SymlinkNotAllowed` if `path` itself is a symlink.
/// A path that does not exist yet passes.
pub async fn ensure_not_symlink(path: &Path) -> StorageResult<()> {
    match fs::symlink_metadata(path).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            Err(StorageError::SymlinkNotAllowed(path.to_path_buf()))
        }
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Check `path` and each of its ancestors below `root` for symlinks.
/// `root` itself is not inspected.
pub async fn ensure_no_symlinks(path: &Path, root: &Path) -> StorageResult<()> {
    ensure_contained(path, root)?;
    let root = normalize(root);
    let path = normalize(path);
    let mut current = path.as_path();
    while current != root {
        ensure_not_symlink(current).await?;
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    Ok(())
}
