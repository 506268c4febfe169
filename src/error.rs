//! Error types shared across the environment, connection and chaos layers

use thiserror::Error;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ValidationError`).
/// This is idiomatic for error enums and improves readability at call sites.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Timed out: {0}")]
    TimeoutError(String),

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Invalid state: {0}")]
    StateError(String),
}

impl Error {
    /// True when the underlying Kubernetes API call returned 404.
    ///
    /// Deletes against already-absent resources are treated as success in
    /// several places (uninstall, chaos stop), so callers need a cheap check.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 404,
            Error::NotFoundError(_) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
