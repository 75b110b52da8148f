//! Restartable, prefix-filtered depth-first directory walk.
//!
//! Nodes are visited pre-order with children in lexical name order, so the
//! position of any node in the walk is fully determined by its path. A walk
//! given a `start_from` path skips everything up to and including that path
//! without reading the skipped subtrees, which is what makes listing
//! pagination stateless: the last returned key is the whole cursor.
//!
//! The walk uses blocking `std::fs` calls; async callers run it on
//! `spawn_blocking`. Symlinks are neither visited nor followed.

use super::{
    ensure_active,
    error::{StorageError, StorageResult},
    path_safety::{ensure_contained, normalize},
};
use std::{
    cmp::Ordering,
    fs,
    io::ErrorKind,
    ops::ControlFlow,
    path::{Path, PathBuf},
};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    File,
}

/// A directory entry as seen by the walk (`file_type` without following links).
#[derive(Clone, Debug)]
pub struct DirChild {
    pub name: String,
    pub is_dir: bool,
    pub is_file: bool,
}

/// A node handed to the visitor.
pub struct WalkEntry<'a> {
    pub path: &'a Path,
    /// Path relative to the walk root, `/`-separated; empty for the root.
    pub rel: &'a str,
    pub kind: NodeKind,
    /// Directory contents, sorted by name. Empty for files.
    pub children: &'a [DirChild],
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Position {
    /// Before the start point and not on the way to it.
    Skip,
    /// The start point or one of its ancestors.
    OnPath,
    After,
}

pub struct Walker {
    root: PathBuf,
    prefix: String,
    start_from: Option<PathBuf>,
    cancel: CancellationToken,
}

impl Walker {
    pub fn new(root: impl Into<PathBuf>, prefix: &str, cancel: CancellationToken) -> Self {
        Self {
            root: normalize(&root.into()),
            prefix: prefix.trim_end_matches('/').to_string(),
            start_from: None,
            cancel,
        }
    }

    /// Resume after `path`. The path itself is not visited again.
    pub fn start_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.start_from = Some(path.into());
        self
    }

    /// Walk the tree, calling `visit` for each matching node after the start
    /// point. A `Break` from the visitor ends the walk with `Ok(())`.
    pub fn walk<F>(&self, mut visit: F) -> StorageResult<()>
    where
        F: FnMut(&WalkEntry<'_>) -> StorageResult<ControlFlow<()>>,
    {
        let start = match &self.start_from {
            Some(path) => Some(self.start_components(path)?),
            None => None,
        };
        let mut rel = Vec::new();
        self.walk_node(&self.root, &mut rel, NodeKind::Dir, start.as_deref(), &mut visit)?;
        Ok(())
    }

    fn start_components(&self, start: &Path) -> StorageResult<Vec<String>> {
        let start = normalize(start);
        ensure_contained(&start, &self.root)
            .map_err(|_| StorageError::StartFromOutsideRoot(start.clone()))?;
        match fs::symlink_metadata(&start) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::StartFromNotExist(start));
            }
            Err(err) => return Err(err.into()),
        }
        let components: Vec<String> = start
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::StartFromOutsideRoot(start.clone()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if !components.join("/").starts_with(&self.prefix) {
            return Err(StorageError::StartFromBadPrefix {
                start,
                prefix: self.prefix.clone(),
            });
        }
        Ok(components)
    }

    fn walk_node<F>(
        &self,
        path: &Path,
        rel: &mut Vec<String>,
        kind: NodeKind,
        start: Option<&[String]>,
        visit: &mut F,
    ) -> StorageResult<ControlFlow<()>>
    where
        F: FnMut(&WalkEntry<'_>) -> StorageResult<ControlFlow<()>>,
    {
        let position = position(rel, start);
        if position == Position::Skip {
            return Ok(ControlFlow::Continue(()));
        }

        let rel_str = rel.join("/");
        let matches = rel_str.starts_with(&self.prefix);
        let leads_to_prefix = rel_str.is_empty() || self.prefix.starts_with(&format!("{rel_str}/"));
        if !matches && !leads_to_prefix {
            return Ok(ControlFlow::Continue(()));
        }

        let children = match kind {
            NodeKind::Dir => read_children(path)?,
            NodeKind::File => Vec::new(),
        };

        if matches && position == Position::After {
            ensure_active(&self.cancel)?;
            let entry = WalkEntry {
                path,
                rel: &rel_str,
                kind,
                children: &children,
            };
            if visit(&entry)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }

        if kind == NodeKind::Dir {
            ensure_active(&self.cancel)?;
            for child in &children {
                let child_kind = if child.is_dir {
                    NodeKind::Dir
                } else if child.is_file {
                    NodeKind::File
                } else {
                    continue;
                };
                rel.push(child.name.clone());
                let flow = self.walk_node(&path.join(&child.name), rel, child_kind, start, visit)?;
                rel.pop();
                if flow.is_break() {
                    return Ok(flow);
                }
            }
        }

        Ok(ControlFlow::Continue(()))
    }
}

fn position(rel: &[String], start: Option<&[String]>) -> Position {
    let Some(start) = start else {
        return Position::After;
    };
    if start.starts_with(rel) {
        return Position::OnPath;
    }
    match rel.cmp(start) {
        Ordering::Less => Position::Skip,
        _ => Position::After,
    }
}

/// Sorted directory listing. A directory removed mid-walk reads as empty.
fn read_children(dir: &Path) -> StorageResult<Vec<DirChild>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut children = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        children.push(DirChild {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: file_type.is_dir(),
            is_file: file_type.is_file(),
        });
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(children)
}
