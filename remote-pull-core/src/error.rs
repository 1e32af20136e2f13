use std::path::PathBuf;

/// Error type used at collaborator boundaries (remote clients, registries).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of a download or cleanup run.
///
/// Construction-stage variants (`Requirement`, `Configuration`, `Connection`,
/// `UnknownProvider`, `InvalidProvider`) abort a run before any file is written.
/// `Transfer` describes a single entry and is absorbed by the per-entry loops.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("requirement not met for provider {provider}: {message}")]
    Requirement { provider: String, message: String },

    #[error("invalid configuration for provider {provider}: `{key}` {reason}")]
    Configuration {
        provider: String,
        key: String,
        reason: String,
    },

    #[error("connection to {provider} failed: {message}")]
    Connection { provider: String, message: String },

    #[error("transfer of {key} failed: {message}")]
    Transfer { key: String, message: String },

    #[error("no provider registered under `{0}`")]
    UnknownProvider(String),

    #[error("provider registered under `{requested}` is implemented by `{actual}`")]
    InvalidProvider { requested: String, actual: String },

    #[error("managed registry failure: {0}")]
    Registry(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    pub(crate) fn missing_key(provider: &str, key: &str) -> Self {
        DownloadError::Configuration {
            provider: provider.to_string(),
            key: key.to_string(),
            reason: "is required".to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DownloadError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn connection(provider: &str, message: impl std::fmt::Display) -> Self {
        DownloadError::Connection {
            provider: provider.to_string(),
            message: message.to_string(),
        }
    }

    /// True for the failures that abort a run before any transfer happens.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DownloadError::Transfer { .. })
    }
}
