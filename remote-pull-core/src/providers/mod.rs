//! Provider registry, construction and the shared download sequence.
//!
//! Every provider run goes through the same stages:
//! construct (requirements → local dir → required keys → connect), list,
//! prepare the local directory, fetch, optionally register as managed files,
//! and report. Construction failures are fatal; fetch and registration
//! failures only drop the affected entries.

pub mod ftp;
pub mod s3;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::config::ProviderContext;
use crate::contract::{
    DownloadResult, ManagedRegistry, Provider, ProviderFactory, RemoteClient, RemoteEntry,
    RemoteObject,
};
use crate::error::DownloadError;
use crate::paths;

pub use ftp::{FtpClient, FtpFactory, FtpProvider, FtpSettings};
pub use s3::{S3Client, S3Factory, S3Provider};

/// Maps provider names to their factories. Names are matched case-insensitively.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `s3` and `ftp` providers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("s3", Arc::new(S3Factory));
        registry.register("ftp", Arc::new(FtpFactory));
        registry
    }

    pub fn register(&mut self, name: &str, factory: Arc<dyn ProviderFactory>) -> &mut Self {
        self.factories.insert(name.to_ascii_lowercase(), factory);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Look up the factory for `name`.
    ///
    /// Fails with `UnknownProvider` when nothing is registered under the name and
    /// with `InvalidProvider` when the registered factory implements another provider.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ProviderFactory>, DownloadError> {
        let key = name.to_ascii_lowercase();
        let factory = self
            .factories
            .get(&key)
            .ok_or_else(|| DownloadError::UnknownProvider(name.to_string()))?;
        if !factory.name().eq_ignore_ascii_case(&key) {
            return Err(DownloadError::InvalidProvider {
                requested: name.to_string(),
                actual: factory.name().to_string(),
            });
        }
        Ok(factory.clone())
    }
}

/// Inputs for constructing a provider; `context.local_dir` is not yet normalised.
pub struct Construction {
    pub local_root: PathBuf,
    pub context: ProviderContext,
}

/// Build a connected provider: check requirements, normalise the local
/// directory, validate required keys, then connect.
pub async fn construct(
    factory: &dyn ProviderFactory,
    construction: Construction,
) -> Result<Box<dyn Provider>, DownloadError> {
    let Construction {
        local_root,
        mut context,
    } = construction;

    factory.check_requirements(&context.config)?;

    context.local_dir = paths::normalize_local_dir(&local_root, &context.local_dir)?;

    for key in factory.required_config_keys() {
        if !context.config.contains(key) {
            error!(provider = factory.name(), key = *key, "Missing required provider configuration");
            return Err(DownloadError::missing_key(factory.name(), key));
        }
    }

    debug!(?context, "Connecting provider");
    factory.connect(context).await
}

/// The download sequence shared by all providers.
pub async fn run_provider(
    provider: &dyn Provider,
    registry: Option<&dyn ManagedRegistry>,
) -> Result<DownloadResult, DownloadError> {
    let ctx = provider.context();
    info!(
        provider = provider.name(),
        remote_dir = %ctx.remote_dir,
        local_dir = %ctx.local_dir.display(),
        managed = ctx.managed,
        "[DOWNLOAD] Starting"
    );

    let entries = provider.get_list().await?;
    if entries.is_empty() {
        info!(provider = provider.name(), remote_dir = %ctx.remote_dir, "[DOWNLOAD] Nothing to download");
        ctx.notify(&format!(
            "No files found in '{}' on {}.",
            ctx.remote_dir,
            provider.name()
        ));
        return Ok(DownloadResult::new());
    }

    paths::prepare_directory(&ctx.local_dir).await?;
    let downloaded = provider.perform_download(&entries).await;
    let fetched = downloaded.len();

    let result = if ctx.managed {
        let registry = registry.ok_or_else(|| DownloadError::Requirement {
            provider: provider.name().to_string(),
            message: "managed mode requires a managed registry".to_string(),
        })?;
        save_managed(ctx, registry, downloaded).await
    } else {
        downloaded
    };

    info!(
        provider = provider.name(),
        listed = entries.len(),
        fetched,
        kept = result.len(),
        "[DOWNLOAD] Finished"
    );
    ctx.notify(&format!(
        "Downloaded {} of {} files from '{}' ({}) to {}.",
        result.len(),
        entries.len(),
        ctx.remote_dir,
        provider.name(),
        ctx.local_dir.display()
    ));
    Ok(result)
}

/// Register every downloaded file. A file that cannot be registered is deleted
/// locally and left out of the result.
async fn save_managed(
    ctx: &ProviderContext,
    registry: &dyn ManagedRegistry,
    downloaded: DownloadResult,
) -> DownloadResult {
    let mut result = DownloadResult::new();
    for (local, display_name) in downloaded.iter() {
        let local_path = Path::new(local);
        match registry.save(local_path).await {
            Ok(file) => {
                debug!(id = %file.id, uri = %file.uri, "[REGISTRY] Saved managed file");
                result.insert(file.id, file.uri);
            }
            Err(e) => {
                warn!(error = ?e, local_path = %local, "[REGISTRY] Failed to save managed file");
                ctx.notify(&format!("Could not register {display_name}: {e}"));
                if let Err(e) = paths::remove_file(local_path).await {
                    warn!(error = ?e, local_path = %local, "[REGISTRY] Failed to remove unregistered file");
                }
            }
        }
    }
    result
}

/// Fetch `entries` through `client`, at most `ctx.concurrency` at a time.
///
/// Successful fetches are keyed by local path with the display name as value.
pub async fn fetch_each(
    ctx: &ProviderContext,
    client: &dyn RemoteClient,
    entries: &[RemoteEntry],
) -> DownloadResult {
    let pending: Vec<_> = entries
        .iter()
        .map(|entry| fetch_entry(ctx, client, entry))
        .collect();
    let outcomes: Vec<_> = stream::iter(pending)
        .buffer_unordered(ctx.concurrency.max(1))
        .collect()
        .await;

    let mut result = DownloadResult::new();
    for (entry, key, local_path, outcome) in outcomes {
        match outcome {
            Ok(()) => {
                debug!(key = %key, local_path = %local_path.display(), "[DOWNLOAD] Fetched");
                result.insert(local_path.display().to_string(), entry.display_name.clone());
            }
            Err(e) => {
                warn!(provider = %ctx.provider, error = %e, "[DOWNLOAD] Skipping entry");
                ctx.notify(&format!("Failed to download {key}: {e}"));
            }
        }
    }
    result
}

async fn fetch_entry<'a>(
    ctx: &'a ProviderContext,
    client: &'a dyn RemoteClient,
    entry: &'a RemoteEntry,
) -> (&'a RemoteEntry, String, PathBuf, Result<(), DownloadError>) {
    let local_path = ctx.local_path(entry);
    let key = ctx.remote_key(entry);
    let outcome = fetch_one(client, &key, &local_path).await;
    (entry, key, local_path, outcome)
}

async fn fetch_one(
    client: &dyn RemoteClient,
    key: &str,
    local_path: &Path,
) -> Result<(), DownloadError> {
    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::Transfer {
                key: key.to_string(),
                message: format!("cannot create {}: {e}", parent.display()),
            })?;
    }
    if let Err(e) = client.fetch(key, local_path).await {
        // Partial content must not be mistaken for a finished download.
        let _ = paths::remove_file(local_path).await;
        return Err(DownloadError::Transfer {
            key: key.to_string(),
            message: e.to_string(),
        });
    }
    Ok(())
}

/// Entries for the objects of a listing that `keep` accepts, relative to `remote_dir`.
pub(crate) fn entries_from<F>(
    remote_dir: &str,
    objects: Vec<RemoteObject>,
    keep: F,
) -> Vec<RemoteEntry>
where
    F: Fn(&RemoteObject) -> bool,
{
    objects
        .iter()
        .filter(|object| keep(object))
        .filter_map(|object| RemoteEntry::from_key(remote_dir, &object.key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderConfig, Settings};
    use crate::contract::MockRemoteClient;
    use crate::notify::MemoryNotifier;
    use serde_json::Map;
    use tempfile::tempdir;

    fn context(local_dir: &Path, notifier: Arc<MemoryNotifier>) -> ProviderContext {
        ProviderContext {
            provider: "test".into(),
            remote_dir: "incoming".into(),
            local_dir: local_dir.to_path_buf(),
            managed: false,
            verbose: true,
            concurrency: 2,
            config: ProviderConfig::new("test", Map::new(), Arc::new(Settings::default())),
            notifier,
        }
    }

    fn entry(relative: &str) -> RemoteEntry {
        RemoteEntry::from_key("", relative).unwrap()
    }

    #[tokio::test]
    async fn fetch_each_keeps_successes_and_reports_failures() {
        let dir = tempdir().unwrap();
        let notifier = Arc::new(MemoryNotifier::new());
        let ctx = context(dir.path(), notifier.clone());

        let mut client = MockRemoteClient::new();
        client.expect_fetch().returning(|key, dest| {
            if key.ends_with("bad.jpg") {
                std::fs::write(dest, b"partial").unwrap();
                Err("connection reset".into())
            } else {
                std::fs::write(dest, key.as_bytes()).unwrap();
                Ok(())
            }
        });

        let entries = vec![entry("a.jpg"), entry("sub/bad.jpg"), entry("sub/b.jpg")];
        let result = fetch_each(&ctx, &client, &entries).await;

        assert_eq!(result.len(), 2);
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("sub").join("b.jpg");
        assert_eq!(result.get(&a.display().to_string()), Some("a.jpg"));
        assert_eq!(result.get(&b.display().to_string()), Some("b.jpg"));
        assert_eq!(std::fs::read(&b).unwrap(), b"incoming/sub/b.jpg");
        assert!(!dir.path().join("sub").join("bad.jpg").exists());

        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("incoming/sub/bad.jpg"));
    }

    #[test]
    fn registry_resolves_case_insensitively() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(registry.resolve("FTP").unwrap().name(), "ftp");
        assert_eq!(registry.resolve("s3").unwrap().name(), "s3");
        assert!(matches!(
            registry.resolve("sftp"),
            Err(DownloadError::UnknownProvider(name)) if name == "sftp"
        ));
    }

    #[test]
    fn misregistered_factory_is_invalid() {
        let mut registry = ProviderRegistry::new();
        registry.register("dropbox", Arc::new(FtpFactory));
        assert!(matches!(
            registry.resolve("dropbox"),
            Err(DownloadError::InvalidProvider { actual, .. }) if actual == "ftp"
        ));
    }
}
