//! File-backed [`ManagedRegistry`]: records live in a JSON index next to the files.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::contract::{ManagedFile, ManagedRegistry};
use crate::error::{BoxError, DownloadError};
use crate::paths;

pub const URI_SCHEME: &str = "managed://";

/// Registry persisting one record per managed file, keyed by URI.
pub struct JsonFileRegistry {
    index_path: PathBuf,
    records: Mutex<BTreeMap<String, ManagedFile>>,
}

impl JsonFileRegistry {
    /// Open the registry at `index_path`, loading existing records if the index exists.
    pub async fn open(index_path: impl Into<PathBuf>) -> Result<Self, DownloadError> {
        let index_path = index_path.into();
        let records: BTreeMap<String, ManagedFile> = match tokio::fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                DownloadError::Registry(format!(
                    "cannot parse index {}: {e}",
                    index_path.display()
                ))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(DownloadError::io(&index_path, e)),
        };
        info!(index = %index_path.display(), records = records.len(), "[REGISTRY] Opened managed registry");
        Ok(JsonFileRegistry {
            index_path,
            records: Mutex::new(records),
        })
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    async fn persist(&self, records: &BTreeMap<String, ManagedFile>) -> Result<(), BoxError> {
        if let Some(parent) = self.index_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(records)?;
        tokio::fs::write(&self.index_path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl ManagedRegistry for JsonFileRegistry {
    async fn save(&self, local_path: &Path) -> Result<ManagedFile, BoxError> {
        let metadata = tokio::fs::metadata(local_path).await?;
        if !metadata.is_file() {
            return Err(format!("{} is not a regular file", local_path.display()).into());
        }
        let id = Uuid::new_v4().to_string();
        let file_name = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = ManagedFile {
            uri: format!("{URI_SCHEME}{id}/{file_name}"),
            id,
            path: paths::absolutize(local_path)?,
        };

        let mut records = self.records.lock().await;
        records.insert(file.uri.clone(), file.clone());
        if let Err(e) = self.persist(&records).await {
            records.remove(&file.uri);
            return Err(e);
        }
        debug!(uri = %file.uri, path = %file.path.display(), "[REGISTRY] Registered file");
        Ok(file)
    }

    async fn load_by_uri(&self, uri: &str) -> Result<Option<ManagedFile>, BoxError> {
        Ok(self.records.lock().await.get(uri).cloned())
    }

    async fn delete(&self, uri: &str) -> Result<(), BoxError> {
        let mut records = self.records.lock().await;
        let Some(file) = records.remove(uri) else {
            return Ok(());
        };
        // The record stays until both the file and the index are updated.
        if let Err(e) = paths::remove_file(&file.path).await {
            records.insert(uri.to_string(), file);
            return Err(e.into());
        }
        if let Err(e) = self.persist(&records).await {
            records.insert(uri.to_string(), file);
            return Err(e);
        }
        debug!(uri = %uri, "[REGISTRY] Deleted file");
        Ok(())
    }
}
