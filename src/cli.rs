//! Command line front end for remote-pull.
//!
//! ## Features
//!
//! - `download`: mirror a remote S3 or FTP directory into a local directory,
//!   optionally registering every file in the managed registry.
//! - `cleanup`: delete the files named by a stored result map and prune the
//!   directories left empty below the local root.
//!
//! ## How To Use
//!
//! ```sh
//! remote-pull download --config remote-pull.yaml --provider ftp --remote-dir pub/in
//! remote-pull download --config remote-pull.yaml --provider s3 --remote-dir in \
//!     --set bucket=media --results results.json
//! remote-pull cleanup --config remote-pull.yaml --results results.json
//! ```
//!
//! Without `--results` the result map is printed on stdout as JSON and the
//! progress notices move to stderr, so stdout can be piped straight into a
//! JSON consumer. With `--results` the notices stay on stdout.
//!
//! ## Extending
//!
//! New providers are registered in `remote_pull_core::providers`; the CLI only
//! forwards the provider name and `--set` pairs, so no change is needed here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use remote_pull_core::config::DownloadOptions;
use remote_pull_core::contract::DownloadResult;
use remote_pull_core::notify::{Notifier, SilentNotifier, StderrNotifier, StdoutNotifier};
use remote_pull_core::registry::JsonFileRegistry;
use remote_pull_core::Downloader;
use serde_json::Value;

use crate::load_config::{load_config, AppConfig};

/// CLI for remote-pull: mirror remote S3/FTP directories locally.
#[derive(Parser)]
#[clap(
    name = "remote-pull",
    version,
    about = "Mirror a remote S3 or FTP directory tree into a local directory"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download every file under a remote directory
    Download {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Provider name, e.g. `s3` or `ftp`
        #[clap(long)]
        provider: String,
        /// Remote directory to mirror; `/` for the remote root
        #[clap(long)]
        remote_dir: String,
        /// Destination directory; relative paths resolve under the local root
        #[clap(long)]
        local_dir: Option<PathBuf>,
        /// Register downloaded files in the managed registry
        #[clap(long)]
        managed: bool,
        /// Suppress progress and summary messages
        #[clap(long)]
        quiet: bool,
        /// Maximum number of concurrent fetches
        #[clap(long)]
        concurrency: Option<usize>,
        /// Provider configuration value, repeatable
        #[clap(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        set: Vec<(String, String)>,
        /// Write the result map to this JSON file instead of stdout
        #[clap(long)]
        results: Option<PathBuf>,
    },
    /// Delete the files of a stored download result and prune empty directories
    Cleanup {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// JSON file written by `download --results`
        #[clap(long)]
        results: PathBuf,
    },
}

/// Where the progress and summary notices of a download go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notices {
    Silent,
    Stdout,
    /// The result JSON owns stdout.
    Stderr,
}

impl Notices {
    fn choose(quiet: bool, results_file: bool) -> Self {
        match (quiet, results_file) {
            (true, _) => Notices::Silent,
            (false, true) => Notices::Stdout,
            (false, false) => Notices::Stderr,
        }
    }

    fn notifier(self) -> Arc<dyn Notifier> {
        match self {
            Notices::Silent => Arc::new(SilentNotifier),
            Notices::Stdout => Arc::new(StdoutNotifier),
            Notices::Stderr => Arc::new(StderrNotifier),
        }
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

async fn build_downloader(config: AppConfig, notifier: Arc<dyn Notifier>) -> Result<Downloader> {
    let registry_index = config.settings.registry_index.clone();
    let mut downloader = Downloader::new(config.settings)?
        .with_defaults(config.defaults)
        .with_notifier(notifier);
    if let Some(index) = registry_index {
        let registry = JsonFileRegistry::open(&index)
            .await
            .with_context(|| format!("Failed to open managed registry {}", index.display()))?;
        downloader = downloader.with_registry(Arc::new(registry));
    }
    Ok(downloader)
}

fn write_results(results: &DownloadResult, path: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(results)?;
    match path {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("Failed to write results to {}", path.display())),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}

fn read_results(path: &Path) -> Result<DownloadResult> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read results file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse results file {}", path.display()))
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    let result = match cli.command {
        Commands::Download {
            config,
            provider,
            remote_dir,
            local_dir,
            managed,
            quiet,
            concurrency,
            set,
            results,
        } => {
            let mut options = DownloadOptions::default();
            options.local_dir = local_dir;
            options.concurrency = concurrency;
            if managed {
                options.managed = Some(true);
            }
            if quiet {
                options.verbose = Some(false);
            }
            for (key, value) in set {
                options.provider_config.insert(key, Value::String(value));
            }
            let notifier = Notices::choose(quiet, results.is_some()).notifier();

            let downloaded = async {
                let config = load_config(config)?;
                let downloader = build_downloader(config, notifier).await?;
                let downloaded = downloader.download(&provider, &remote_dir, options).await?;
                write_results(&downloaded, results.as_deref())?;
                Ok::<_, anyhow::Error>(downloaded)
            }
            .await;
            match downloaded {
                Ok(downloaded) => {
                    tracing::info!(provider = %provider, files = downloaded.len(), "Download complete");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("[ERROR] Download failed: {:#}", e);
                    Err(e)
                }
            }
        }
        Commands::Cleanup { config, results } => {
            let cleaned = async {
                let config = load_config(config)?;
                let stored = read_results(&results)?;
                let downloader = build_downloader(config, Arc::new(SilentNotifier)).await?;
                downloader.cleanup(&stored).await?;
                Ok::<_, anyhow::Error>(stored.len())
            }
            .await;
            match cleaned {
                Ok(count) => {
                    println!("Cleaned up {count} files.");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("[ERROR] Cleanup failed: {:#}", e);
                    Err(e)
                }
            }
        }
    };

    let exit_span = tracing::info_span!("exit");
    exit_span.in_scope(|| {
        tracing::info!(success = result.is_ok(), "exit");
    });

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_pairs_split_on_the_first_equals_sign() {
        assert_eq!(
            parse_key_value("endpoint_url=http://minio:9000/?a=b"),
            Ok(("endpoint_url".to_string(), "http://minio:9000/?a=b".to_string()))
        );
        assert!(parse_key_value("bucket").is_err());
        assert!(parse_key_value("=value").is_err());
    }

    #[test]
    fn flags_parse_into_download_command() {
        let cli = Cli::parse_from([
            "remote-pull",
            "download",
            "--config",
            "config.yaml",
            "--provider",
            "s3",
            "--remote-dir",
            "incoming",
            "--set",
            "bucket=media",
            "--set",
            "region=eu-west-1",
            "--quiet",
        ]);
        match cli.command {
            Commands::Download {
                provider,
                set,
                quiet,
                managed,
                ..
            } => {
                assert_eq!(provider, "s3");
                assert_eq!(set.len(), 2);
                assert!(quiet);
                assert!(!managed);
            }
            Commands::Cleanup { .. } => panic!("expected download"),
        }
    }

    #[test]
    fn notices_leave_stdout_to_printed_results() {
        assert_eq!(Notices::choose(false, false), Notices::Stderr);
        assert_eq!(Notices::choose(false, true), Notices::Stdout);
        assert_eq!(Notices::choose(true, false), Notices::Silent);
        assert_eq!(Notices::choose(true, true), Notices::Silent);
    }
}
