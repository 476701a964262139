use thiserror::Error;

/// Errors surfaced by storage providers.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The requested path does not exist on the backend.
    #[error("Not found: {path}")]
    NotFound { path: String },

    /// I/O or authentication failure during a transfer. Retryable with
    /// backoff by the queue engine.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Explicit transient signal from the backend (throttling, quota,
    /// expired token). `retry_after_secs` carries a vendor-provided hint
    /// when one exists.
    #[error("Retryable provider error: {message}")]
    Retryable {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// The provider is misconfigured (missing root, bad credentials file).
    /// Not retryable; the site should be treated as inactive.
    #[error("Provider configuration error: {0}")]
    Configuration(String),
}

impl ProviderError {
    /// Whether the engine should retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transfer(_) | Self::Retryable { .. })
    }

    /// Vendor-provided retry-after hint, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Retryable {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
