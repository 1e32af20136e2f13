use std::fs;
use std::path::Path;

use anyhow::Result;
use remote_pull_core::config::{DownloadOptions, Settings};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info};

/// Contents of the YAML config file: host settings plus the named download defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub settings: Settings,
    pub defaults: DownloadOptions,
}

/// Loads the YAML config file and injects provider variables from the process
/// environment. Secrets such as S3 keys are expected in the environment, not in the file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let mut config: AppConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    inject_env(&mut config.settings, std::env::vars());

    info!(
        namespace = %config.settings.namespace,
        local_root = %config.settings.local_root.display(),
        managed_registry = config.settings.registry_index.is_some(),
        "Config loaded and merged successfully"
    );
    Ok(config)
}

/// Copies `<NAMESPACE>_<PROVIDER>_<NAME>` variables into `settings.variables`
/// (lower-cased) unless the file already defines them. `AWS_REGION`, then
/// `AWS_DEFAULT_REGION`, supply the S3 region when none is set.
pub fn inject_env<I>(settings: &mut Settings, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    let prefix = format!("{}_", settings.namespace.to_ascii_uppercase());
    let mut aws_region = None;
    let mut aws_default_region = None;

    for (name, value) in vars {
        match name.as_str() {
            "AWS_REGION" => aws_region = Some(value),
            "AWS_DEFAULT_REGION" => aws_default_region = Some(value),
            _ => {
                let Some(rest) = name.strip_prefix(&prefix) else {
                    continue;
                };
                if rest.is_empty() {
                    continue;
                }
                let key = format!("{}_{}", settings.namespace, rest.to_ascii_lowercase());
                if !settings.variables.contains_key(&key) {
                    debug!(variable = %key, "Injected settings variable from environment");
                    settings.variables.insert(key, Value::String(value));
                }
            }
        }
    }

    if settings.variable("s3", "region").is_none() {
        if let Some(region) = aws_region.or(aws_default_region).filter(|r| !r.is_empty()) {
            debug!(region = %region, "Using AWS region from environment");
            settings.set_variable("s3", "region", region);
        }
    }
}
