//! Filesystem helpers: directory creation, tree listing and free space.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, error};
use walkdir::WalkDir;

use crate::error::{LaunchError, ResourceError};
use crate::launcher::launch;
use crate::remote::quote;

/// Creates `dir` and its parents if missing.
///
/// # Errors
///
/// Returns `ResourceError::CreateDir` (exit code 3) on failure.
pub fn ensure_dir(dir: impl AsRef<Path>) -> Result<(), ResourceError> {
    let dir = dir.as_ref();
    if dir.is_dir() {
        return Ok(());
    }
    debug!(path = %dir.display(), "Creating directory");
    std::fs::create_dir_all(dir).map_err(|source| {
        error!(path = %dir.display(), error = %source, "Can't create a directory");
        ResourceError::CreateDir {
            path: dir.to_path_buf(),
            source,
        }
    })
}

/// Nested map of the tree under `root`.
///
/// The single top-level key is the root's own name. Directories map to
/// objects, everything else (files, symlinks) to `null`. Symlinks are not
/// followed.
///
/// ```text
/// {"logs": {"node-1": {"syslog": null}, "summary.txt": null}}
/// ```
///
/// # Errors
///
/// Returns `ResourceError::DirTree` if any part of the tree cannot be read.
pub fn dir_structure(root: impl AsRef<Path>) -> Result<Value, ResourceError> {
    let root = root.as_ref();
    let tree_error = |message: String| {
        error!(path = %root.display(), reason = %message, "Failed to create list of the directory");
        ResourceError::DirTree {
            path: root.to_path_buf(),
            message,
        }
    };

    let mut tree = Map::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| tree_error(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| tree_error(e.to_string()))?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let Some((name, parents)) = parts.split_last() else {
            continue;
        };

        let parent = descend(&mut tree, parents)
            .ok_or_else(|| tree_error(format!("parent of {} was not listed", relative.display())))?;
        let node = if entry.file_type().is_dir() {
            Value::Object(Map::new())
        } else {
            Value::Null
        };
        parent.insert(name.clone(), node);
    }

    let mut top = Map::new();
    top.insert(root_name(root), Value::Object(tree));
    Ok(Value::Object(top))
}

fn descend<'a>(tree: &'a mut Map<String, Value>, parents: &[String]) -> Option<&'a mut Map<String, Value>> {
    parents
        .iter()
        .try_fold(tree, |node, part| node.get_mut(part)?.as_object_mut())
}

fn root_name(root: &Path) -> String {
    let trimmed: PathBuf = root.components().collect();
    trimmed
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.to_string_lossy().into_owned())
}

/// `df` column holding the available space.
const DF_AVAILABLE: usize = 4;

/// `df` column holding the filesystem size.
const DF_SIZE: usize = 2;

/// Available space in KiB on the filesystem holding `dir`, via `df`.
///
/// Returns `Ok(None)` if `df` fails or prints something unexpected.
///
/// # Errors
///
/// Returns `LaunchError` if the shell cannot be spawned.
pub async fn available_space(dir: impl AsRef<Path>, timeout: Duration) -> Result<Option<u64>, LaunchError> {
    df_column(dir.as_ref(), DF_AVAILABLE, timeout).await
}

/// Total size in KiB of the filesystem holding `dir`, via `df`.
///
/// Returns `Ok(None)` if `df` fails or prints something unexpected.
///
/// # Errors
///
/// Returns `LaunchError` if the shell cannot be spawned.
pub async fn filesystem_size(dir: impl AsRef<Path>, timeout: Duration) -> Result<Option<u64>, LaunchError> {
    df_column(dir.as_ref(), DF_SIZE, timeout).await
}

async fn df_column(dir: &Path, column: usize, timeout: Duration) -> Result<Option<u64>, LaunchError> {
    let command = format!(
        "df {} --block-size K 2> /dev/null | tail -n 1 | awk '{{print ${column}}}' | sed 's/K//g'",
        quote(dir.to_string_lossy())
    );
    let result = launch(&command, timeout, None, &[]).await?;
    Ok(result.stdout.trim().parse().ok())
}
