//! Error types for the local drive provider.

use std::path::PathBuf;
use thiserror::Error;

/// Local drive provider errors.
#[derive(Error, Debug)]
pub enum LocalDriveError {
    /// Path does not exist.
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    /// Underlying filesystem I/O failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<LocalDriveError> for provider_traits::ProviderError {
    fn from(error: LocalDriveError) -> Self {
        match error {
            LocalDriveError::NotFound(path) => provider_traits::ProviderError::NotFound {
                path: path.display().to_string(),
            },
            LocalDriveError::Io { path, source } => provider_traits::ProviderError::Transfer(
                format!("{}: {}", path.display(), source),
            ),
        }
    }
}
