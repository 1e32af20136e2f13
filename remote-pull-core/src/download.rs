//! High-level entry points: download a remote directory through a named provider,
//! and clean up what a previous download produced.
//!
//! # Responsibilities
//! - Resolve the provider by name through the [`ProviderRegistry`]
//! - Merge caller options over the named defaults (caller values win)
//! - Construct the provider (fail fast on requirements, configuration, connection)
//! - Run the shared download sequence and return its [`DownloadResult`]
//! - Delete downloaded files and prune directories left empty
//!
//! The tool assumes it is not run concurrently against the same local/remote
//! directory pair; no locking is performed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::{DownloadOptions, ProviderConfig, ProviderContext, Settings};
use crate::contract::{DownloadResult, ManagedFile, ManagedRegistry};
use crate::error::DownloadError;
use crate::notify::{Notifier, TracingNotifier};
use crate::paths;
use crate::providers::{self, Construction, ProviderRegistry};
use crate::registry::URI_SCHEME;

/// The download orchestrator.
pub struct Downloader {
    settings: Arc<Settings>,
    local_root: PathBuf,
    defaults: DownloadOptions,
    providers: ProviderRegistry,
    registry: Option<Arc<dyn ManagedRegistry>>,
    notifier: Arc<dyn Notifier>,
}

impl Downloader {
    /// Orchestrator with the built-in providers, no managed registry and
    /// messages routed to `tracing`.
    pub fn new(settings: Settings) -> Result<Self, DownloadError> {
        let local_root = paths::absolutize(&settings.local_root)?;
        settings.trace_loaded();
        Ok(Downloader {
            settings: Arc::new(settings),
            local_root,
            defaults: DownloadOptions::builtin(),
            providers: ProviderRegistry::with_defaults(),
            registry: None,
            notifier: Arc::new(TracingNotifier),
        })
    }

    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn ManagedRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replace the named defaults. Unset fields still fall back to the built-in defaults.
    pub fn with_defaults(mut self, defaults: DownloadOptions) -> Self {
        self.defaults = defaults.or(DownloadOptions::builtin());
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Mirror `remote_dir` of provider `provider_name` into the local directory.
    ///
    /// Without an explicit `local_dir` the files land in `remote_dir` under the
    /// local root. Construction failures are returned; per-entry failures only
    /// shrink the result.
    pub async fn download(
        &self,
        provider_name: &str,
        remote_dir: &str,
        options: DownloadOptions,
    ) -> Result<DownloadResult, DownloadError> {
        let factory = self.providers.resolve(provider_name).map_err(|e| {
            error!(provider = provider_name, error = %e, "[DOWNLOAD] Cannot resolve provider");
            e
        })?;
        let name = factory.name().to_string();

        let options = options.or(self.defaults.clone());
        let remote_dir = paths::normalize_remote_dir(remote_dir);
        let local_dir = options
            .local_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&remote_dir));
        let managed = options.managed.unwrap_or(false);

        if managed && self.registry.is_none() {
            return Err(DownloadError::Requirement {
                provider: name,
                message: "managed mode requires a managed registry".to_string(),
            });
        }

        let context = ProviderContext {
            provider: name.clone(),
            remote_dir,
            local_dir,
            managed,
            verbose: options.verbose.unwrap_or(true),
            concurrency: options.concurrency.unwrap_or(1).max(1),
            config: ProviderConfig::new(&name, options.provider_config, self.settings.clone()),
            notifier: self.notifier.clone(),
        };

        let provider = providers::construct(
            factory.as_ref(),
            Construction {
                local_root: self.local_root.clone(),
                context,
            },
        )
        .await
        .map_err(|e| {
            error!(provider = %name, error = %e, "[DOWNLOAD] Provider construction failed");
            e
        })?;

        providers::run_provider(provider.as_ref(), self.registry.as_deref()).await
    }

    /// Delete every file of a previous result and prune directories left empty,
    /// never ascending past the local root.
    ///
    /// Entries whose value is a managed URI are deleted through the managed
    /// registry; all other keys are local paths. Already-missing files and
    /// records are skipped, so cleaning the same result twice is harmless.
    pub async fn cleanup(&self, results: &DownloadResult) -> Result<(), DownloadError> {
        info!(entries = results.len(), "[CLEANUP] Starting");
        for (key, value) in results.iter() {
            let deleted = if value.starts_with(URI_SCHEME) {
                match self.delete_managed(value).await? {
                    Some(path) => path,
                    None => {
                        debug!(uri = %value, "[CLEANUP] Managed file already gone");
                        continue;
                    }
                }
            } else {
                let path = PathBuf::from(key);
                if !paths::remove_file(&path).await? {
                    debug!(path = %path.display(), "[CLEANUP] Already gone");
                }
                path
            };
            let pruned = paths::prune_empty_dirs(&deleted, &self.local_root).await;
            debug!(file = %deleted.display(), pruned = pruned.len(), "[CLEANUP] Removed");
        }
        info!(entries = results.len(), "[CLEANUP] Finished");
        Ok(())
    }

    /// Delete the managed file behind `uri`; returns its local path, or `None`
    /// when the registry no longer knows it.
    async fn delete_managed(&self, uri: &str) -> Result<Option<PathBuf>, DownloadError> {
        let registry = self.registry.as_ref().ok_or_else(|| {
            DownloadError::Registry(format!("no managed registry configured to delete {uri}"))
        })?;
        let record = registry
            .load_by_uri(uri)
            .await
            .map_err(|e| DownloadError::Registry(format!("cannot look up {uri}: {e}")))?;
        let Some(ManagedFile { path, .. }) = record else {
            return Ok(None);
        };
        registry
            .delete(uri)
            .await
            .map_err(|e| DownloadError::Registry(format!("cannot delete {uri}: {e}")))?;
        Ok(Some(path))
    }
}
