//! Path helpers shared by the providers and the orchestrator: remote key handling,
//! local directory normalisation, directory preparation and empty-directory pruning.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::DownloadError;

const FILE_SCHEME: &str = "file://";

/// Canonical form of a remote directory: forward slashes, no leading or trailing
/// slash, `""` for the remote root.
pub fn normalize_remote_dir(remote_dir: &str) -> String {
    let unified = remote_dir.replace('\\', "/");
    let parts: Vec<&str> = unified
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    parts.join("/")
}

/// Remote key for `relative_path` under `remote_dir`.
pub fn join_remote(remote_dir: &str, relative_path: &str) -> String {
    if remote_dir.is_empty() {
        relative_path.to_string()
    } else {
        format!("{remote_dir}/{relative_path}")
    }
}

/// Strip the `remote_dir` prefix from a full key. `None` if the key is outside
/// the directory or refers to the directory itself.
pub fn relative_key(remote_dir: &str, key: &str) -> Option<String> {
    let key = key.trim_start_matches('/');
    let relative = if remote_dir.is_empty() {
        key
    } else {
        key.strip_prefix(remote_dir)?.strip_prefix('/')?
    };
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() || relative.ends_with('/') {
        return None;
    }
    Some(relative.to_string())
}

/// Last segment of a slash-separated key.
pub fn display_name(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

/// Local destination of `relative_path` under `local_dir`. `.` and `..` segments
/// are dropped so a remote key can never address a file outside `local_dir`.
pub fn local_path(local_dir: &Path, relative_path: &str) -> PathBuf {
    relative_path
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .fold(local_dir.to_path_buf(), |path, segment| path.join(segment))
}

/// Make `path` absolute against the current directory and resolve `.`/`..`
/// lexically. The path does not need to exist.
pub fn absolutize(path: &Path) -> Result<PathBuf, DownloadError> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        let cwd = std::env::current_dir().map_err(|e| DownloadError::io(path, e))?;
        cwd.join(path)
    };
    Ok(lexical_normalize(&joined))
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve the local destination directory of a run. Accepts plain paths and
/// `file://` URLs; relative paths are placed under `local_root`.
pub fn normalize_local_dir(local_root: &Path, local_dir: &Path) -> Result<PathBuf, DownloadError> {
    let raw = local_dir.to_string_lossy();
    let stripped = match raw.strip_prefix(FILE_SCHEME) {
        Some(rest) => PathBuf::from(rest),
        None => local_dir.to_path_buf(),
    };
    if stripped.is_absolute() {
        return Ok(lexical_normalize(&stripped));
    }
    absolutize(&local_root.join(stripped))
}

/// Recursively create `dir`.
pub async fn prepare_directory(dir: &Path) -> Result<(), DownloadError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DownloadError::io(dir, e))?;
    debug!(path = %dir.display(), "Prepared local directory");
    Ok(())
}

/// Delete a file. Returns `false` when it was already gone.
pub async fn remove_file(path: &Path) -> Result<bool, DownloadError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}

/// Walk upward from the parent of `file`, removing each directory that is empty.
///
/// Stops at the first non-empty or missing directory, at the first directory
/// that cannot be removed, and never removes `root` or anything outside it.
/// Returns the removed directories, innermost first.
pub async fn prune_empty_dirs(file: &Path, root: &Path) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    let mut current = file.parent();

    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        let mut listing = match tokio::fs::read_dir(dir).await {
            Ok(listing) => listing,
            Err(e) if e.kind() == ErrorKind::NotFound => break,
            Err(e) => {
                warn!(error = ?e, path = %dir.display(), "[CLEANUP] Cannot inspect directory");
                break;
            }
        };
        match listing.next_entry().await {
            Ok(None) => {}
            Ok(Some(_)) => break,
            Err(e) => {
                warn!(error = ?e, path = %dir.display(), "[CLEANUP] Cannot inspect directory");
                break;
            }
        }
        if let Err(e) = tokio::fs::remove_dir(dir).await {
            warn!(error = ?e, path = %dir.display(), "[CLEANUP] Failed to remove empty directory");
            break;
        }
        debug!(path = %dir.display(), "[CLEANUP] Removed empty directory");
        removed.push(dir.to_path_buf());
        current = dir.parent();
    }

    removed
}
