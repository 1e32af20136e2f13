//! Run configuration: injected [`Settings`], caller [`DownloadOptions`], the
//! per-provider [`ProviderConfig`] resolver and the resolved [`ProviderContext`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::contract::RemoteEntry;
use crate::error::DownloadError;
use crate::notify::Notifier;
use crate::paths;

pub const DEFAULT_NAMESPACE: &str = "remote_pull";
pub const DEFAULT_LOCAL_ROOT: &str = "./downloads";

/// Host-level configuration handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Prefix of the named variables, `"<namespace>_<provider>_<name>"`.
    pub namespace: String,
    /// Local directories are resolved under this root; cleanup never ascends past it.
    pub local_root: PathBuf,
    /// Named variables consulted when a key is absent from `provider_config`.
    pub variables: BTreeMap<String, Value>,
    /// Index file of the managed-file registry, if managed mode is used.
    pub registry_index: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            namespace: DEFAULT_NAMESPACE.to_string(),
            local_root: PathBuf::from(DEFAULT_LOCAL_ROOT),
            variables: BTreeMap::new(),
            registry_index: None,
        }
    }
}

impl Settings {
    pub fn variable_name(&self, provider: &str, name: &str) -> String {
        format!("{}_{}_{}", self.namespace, provider, name)
    }

    pub fn variable(&self, provider: &str, name: &str) -> Option<&Value> {
        self.variables.get(&self.variable_name(provider, name))
    }

    pub fn set_variable(&mut self, provider: &str, name: &str, value: impl Into<Value>) {
        let key = self.variable_name(provider, name);
        self.variables.insert(key, value.into());
    }

    pub fn trace_loaded(&self) {
        info!(
            namespace = %self.namespace,
            local_root = %self.local_root.display(),
            variables_count = self.variables.len(),
            "Loaded Settings"
        );
        debug!(variables = ?self.variables.keys().collect::<Vec<_>>(), "Settings variable names");
    }
}

/// Caller options for one download. Unset fields fall back to the orchestrator's
/// named defaults; set fields always win.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadOptions {
    pub local_dir: Option<PathBuf>,
    pub provider_config: Map<String, Value>,
    pub managed: Option<bool>,
    pub verbose: Option<bool>,
    /// Upper bound on concurrent fetches; 1 fetches sequentially.
    pub concurrency: Option<usize>,
}

impl DownloadOptions {
    /// Built-in named defaults: no local dir, unmanaged, verbose, sequential.
    pub fn builtin() -> Self {
        DownloadOptions {
            local_dir: None,
            provider_config: Map::new(),
            managed: Some(false),
            verbose: Some(true),
            concurrency: Some(1),
        }
    }

    pub fn local_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_dir = Some(dir.into());
        self
    }

    pub fn managed(mut self, managed: bool) -> Self {
        self.managed = Some(managed);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = Some(verbose);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.provider_config.insert(key.into(), value.into());
        self
    }

    /// Fill every unset field from `fallback`. `provider_config` is merged key by
    /// key with the keys of `self` winning.
    pub fn or(self, fallback: DownloadOptions) -> DownloadOptions {
        let mut provider_config = fallback.provider_config;
        provider_config.extend(self.provider_config);
        DownloadOptions {
            local_dir: self
                .local_dir
                .filter(|dir| !dir.as_os_str().is_empty())
                .or(fallback.local_dir),
            provider_config,
            managed: self.managed.or(fallback.managed),
            verbose: self.verbose.or(fallback.verbose),
            concurrency: self.concurrency.or(fallback.concurrency),
        }
    }
}

/// Resolves provider configuration keys: explicit `provider_config` value, then
/// the named settings variable, then the caller default.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    provider: String,
    explicit: Map<String, Value>,
    settings: Arc<Settings>,
}

fn present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

impl ProviderConfig {
    pub fn new(provider: &str, explicit: Map<String, Value>, settings: Arc<Settings>) -> Self {
        ProviderConfig {
            provider: provider.to_string(),
            explicit,
            settings,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.explicit
            .get(key)
            .filter(|v| present(v))
            .or_else(|| {
                self.settings
                    .variable(&self.provider, key)
                    .filter(|v| present(v))
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.value(key).is_some()
    }

    pub fn string(&self, key: &str) -> Option<String> {
        match self.value(key)? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64, DownloadError> {
        let parsed = match self.value(key) {
            None => return Ok(default),
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(_) => None,
        };
        parsed.ok_or_else(|| self.invalid(key, "must be a non-negative integer"))
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, DownloadError> {
        let parsed = match self.value(key) {
            None => return Ok(default),
            Some(Value::Bool(b)) => Some(*b),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            Some(_) => None,
        };
        parsed.ok_or_else(|| self.invalid(key, "must be a boolean"))
    }

    fn invalid(&self, key: &str, reason: &str) -> DownloadError {
        DownloadError::Configuration {
            provider: self.provider.clone(),
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Everything a provider needs for one run, fixed at construction.
#[derive(Clone)]
pub struct ProviderContext {
    pub provider: String,
    pub remote_dir: String,
    pub local_dir: PathBuf,
    pub managed: bool,
    pub verbose: bool,
    pub concurrency: usize,
    pub config: ProviderConfig,
    pub notifier: Arc<dyn Notifier>,
}

impl ProviderContext {
    pub fn local_path(&self, entry: &RemoteEntry) -> PathBuf {
        paths::local_path(&self.local_dir, &entry.relative_path)
    }

    pub fn remote_key(&self, entry: &RemoteEntry) -> String {
        paths::join_remote(&self.remote_dir, &entry.relative_path)
    }

    /// Emit a message on the notifier when the run is verbose.
    pub fn notify(&self, message: &str) {
        if self.verbose {
            self.notifier.notify(message);
        }
    }
}

impl std::fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContext")
            .field("provider", &self.provider)
            .field("remote_dir", &self.remote_dir)
            .field("local_dir", &self.local_dir)
            .field("managed", &self.managed)
            .field("verbose", &self.verbose)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings_with(key: &str, value: Value) -> Arc<Settings> {
        let mut settings = Settings::default();
        settings.variables.insert(key.to_string(), value);
        Arc::new(settings)
    }

    #[test]
    fn caller_options_win_over_defaults() {
        let merged = DownloadOptions::default()
            .managed(true)
            .or(DownloadOptions::builtin());
        assert_eq!(merged.managed, Some(true));
        assert_eq!(merged.verbose, Some(true));
        assert_eq!(merged.concurrency, Some(1));
    }

    #[test]
    fn defaults_fill_only_unset_fields() {
        let defaults = DownloadOptions::builtin()
            .verbose(false)
            .config("bucket", "from-defaults")
            .config("region", "eu-west-1");
        let merged = DownloadOptions::default()
            .config("bucket", "from-caller")
            .local_dir("")
            .or(defaults);
        assert_eq!(merged.verbose, Some(false));
        assert_eq!(merged.local_dir, None);
        assert_eq!(merged.provider_config["bucket"], json!("from-caller"));
        assert_eq!(merged.provider_config["region"], json!("eu-west-1"));
    }

    #[test]
    fn explicit_value_beats_settings_variable() {
        let settings = settings_with("remote_pull_s3_bucket", json!("from-settings"));
        let mut explicit = Map::new();
        explicit.insert("bucket".into(), json!("explicit"));
        let config = ProviderConfig::new("s3", explicit, settings.clone());
        assert_eq!(config.string("bucket").as_deref(), Some("explicit"));

        let config = ProviderConfig::new("s3", Map::new(), settings);
        assert_eq!(config.string("bucket").as_deref(), Some("from-settings"));
    }

    #[test]
    fn empty_values_count_as_absent() {
        let settings = settings_with("remote_pull_ftp_host", json!(""));
        let mut explicit = Map::new();
        explicit.insert("host".into(), Value::Null);
        let config = ProviderConfig::new("ftp", explicit, settings);
        assert!(!config.contains("host"));
        assert_eq!(config.string_or("host", "localhost"), "localhost");
    }

    #[test]
    fn numeric_and_boolean_values_are_parsed() {
        let mut explicit = Map::new();
        explicit.insert("port".into(), json!("2121"));
        explicit.insert("timeout".into(), json!(30));
        explicit.insert("force_path_style".into(), json!("yes"));
        explicit.insert("bad".into(), json!("many"));
        let config = ProviderConfig::new("ftp", explicit, Arc::new(Settings::default()));
        assert_eq!(config.u64_or("port", 21).unwrap(), 2121);
        assert_eq!(config.u64_or("timeout", 90).unwrap(), 30);
        assert_eq!(config.u64_or("missing", 90).unwrap(), 90);
        assert!(config.bool_or("force_path_style", false).unwrap());
        assert!(matches!(
            config.u64_or("bad", 1),
            Err(DownloadError::Configuration { key, .. }) if key == "bad"
        ));
    }
}
