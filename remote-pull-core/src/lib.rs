#![doc = "remote-pull-core: core logic library for remote-pull."]

//! This crate contains the provider contract, the S3 and FTP providers, the download
//! orchestrator and the managed-file registry. CLI glue lives in the `remote-pull` crate.
//!
//! # Usage
//! Build a [`download::Downloader`] from [`config::Settings`], call
//! [`download::Downloader::download`] with a provider name and a remote directory, and
//! later hand the returned [`contract::DownloadResult`] to [`download::Downloader::cleanup`].

pub mod config;
pub mod contract;
pub mod download;
pub mod error;
pub mod notify;
pub mod paths;
pub mod providers;
pub mod registry;

pub use config::{DownloadOptions, ProviderConfig, ProviderContext, Settings};
pub use contract::{DownloadResult, ManagedFile, RemoteEntry, RemoteObject};
pub use download::Downloader;
pub use error::DownloadError;
