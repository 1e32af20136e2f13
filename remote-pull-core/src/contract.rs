//! # contract: provider and collaborator interfaces
//!
//! This module defines the traits every remote-storage kind implements and the
//! collaborators the orchestrator talks to, together with the plain data types
//! passed between them.
//!
//! ## Interface & Extensibility
//! - Implement [`RemoteClient`] to wrap a network client (S3 SDK, FTP session).
//! - Implement [`Provider`] + [`ProviderFactory`] to add a remote-storage kind;
//!   register the factory in a [`crate::providers::ProviderRegistry`].
//! - Implement [`ManagedRegistry`] to hand downloaded files to a durable file registry.
//!
//! ## Mocking & Testing
//! - `RemoteClient` and `ManagedRegistry` are annotated for `mockall`, so tests can
//!   script listings, fetch failures and registration outcomes without a network.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::config::{ProviderConfig, ProviderContext};
use crate::error::{BoxError, DownloadError};
use crate::paths;

/// Kind of an object reported by a remote listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    File,
    Directory,
}

/// A raw object as reported by a [`RemoteClient`]; `key` is the full remote key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub kind: ObjectKind,
}

/// An entry selected for download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Path under the remote directory, without the remote directory prefix and
    /// without a leading slash.
    pub relative_path: String,
    pub display_name: String,
}

impl RemoteEntry {
    /// Builds an entry from a full remote key; `None` when the key does not live
    /// under `remote_dir` or names the directory itself.
    pub fn from_key(remote_dir: &str, key: &str) -> Option<Self> {
        let relative_path = paths::relative_key(remote_dir, key)?;
        Some(RemoteEntry {
            display_name: paths::display_name(&relative_path),
            relative_path,
        })
    }
}

/// A file registered in the managed registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedFile {
    pub id: String,
    pub uri: String,
    pub path: PathBuf,
}

/// Outcome of a download run.
///
/// Keys are local file paths (unmanaged runs) or managed-file ids (managed runs);
/// values are display names or managed URIs respectively. Only successfully
/// fetched (and, when managed, successfully registered) files appear here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadResult(BTreeMap<String, String>);

impl DownloadResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl FromIterator<(String, String)> for DownloadResult {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        DownloadResult(iter.into_iter().collect())
    }
}

/// Listing and fetching against one remote store.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Recursively list every object under `prefix`. An absent prefix yields an
    /// empty listing rather than an error.
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, BoxError>;

    /// Fetch the object stored under `key` into the file at `dest`.
    /// The parent directory of `dest` already exists.
    async fn fetch(&self, key: &str, dest: &Path) -> Result<(), BoxError>;
}

/// The host system's durable file registry.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ManagedRegistry: Send + Sync {
    /// Register a downloaded local file.
    async fn save(&self, local_path: &Path) -> Result<ManagedFile, BoxError>;

    /// Look up a registered file by URI.
    async fn load_by_uri(&self, uri: &str) -> Result<Option<ManagedFile>, BoxError>;

    /// Delete a registered file (record and content).
    async fn delete(&self, uri: &str) -> Result<(), BoxError>;
}

/// A connected provider for one remote-storage kind, valid for a single run.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn context(&self) -> &ProviderContext;

    /// Enumerate downloadable entries under the remote directory.
    async fn get_list(&self) -> Result<Vec<RemoteEntry>, DownloadError>;

    /// Fetch the entries into the local directory. Failed entries are left out
    /// of the result; they never abort the remaining entries.
    async fn perform_download(&self, entries: &[RemoteEntry]) -> DownloadResult;
}

/// Validates configuration for, and opens, a [`Provider`].
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Configuration keys that must resolve to a value.
    fn required_config_keys(&self) -> &[&'static str];

    /// Provider-specific preflight, run before anything else.
    fn check_requirements(&self, config: &ProviderConfig) -> Result<(), DownloadError>;

    /// Open the remote client and build the provider.
    async fn connect(&self, context: ProviderContext) -> Result<Box<dyn Provider>, DownloadError>;
}
