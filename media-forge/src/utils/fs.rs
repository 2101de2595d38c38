//! Filesystem helpers shared across modules.
//!
//! These helpers attach operation + path context to IO errors and treat
//! "already gone" as success where removal must be idempotent.

use std::io::ErrorKind;
use std::path::Path;

use crate::{Error, Result};

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io_path(op, path, e))
}

pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    ensure_dir_all_with_op("creating directory", path).await
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir_all(parent).await
}

/// Ensure a directory exists (synchronous variant).
pub fn ensure_dir_all_sync(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| Error::io_path("creating directory", path, e))
}

/// Remove a file or directory tree. Returns `false` if nothing was there.
pub async fn remove_path_if_exists(path: &Path) -> Result<bool> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::io_path("inspecting", path, e)),
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io_path("removing", path, e)),
    }
}

/// Rename `from` to `to`, replacing any existing file or directory at `to`.
pub async fn replace_path(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::symlink_metadata(to)
        .await
        .is_ok_and(|m| m.is_dir())
    {
        remove_path_if_exists(to).await?;
    }
    tokio::fs::rename(from, to)
        .await
        .map_err(|e| Error::io_path("renaming", from, e))
}

/// Remove `dir` if it exists and is empty. Non-empty directories are kept.
pub async fn remove_dir_if_empty(dir: &Path) -> Result<bool> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::io_path("reading directory", dir, e)),
    };
    if entries
        .next_entry()
        .await
        .map_err(|e| Error::io_path("reading directory", dir, e))?
        .is_some()
    {
        return Ok(false);
    }
    match tokio::fs::remove_dir(dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io_path("removing directory", dir, e)),
    }
}
