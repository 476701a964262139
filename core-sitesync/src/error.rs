use provider_traits::ProviderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Site is not configured for this project. Fatal to the affected job
    /// only.
    #[error("Unknown site: {site}")]
    UnknownSite { site: String },

    /// Source file is missing on the backend. The pair is not retried until
    /// a source reappears.
    #[error("Not found: {path}")]
    NotFound { path: String },

    /// I/O or auth failure during a transfer. Retried with backoff.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Explicit throttling/quota signal from an adapter. Retried with
    /// backoff, honoring a vendor retry-after hint when present.
    #[error("Retryable error: {message}")]
    Retryable {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Destination content does not match the recorded hash after transfer.
    /// Counted toward the same attempt ceiling as transfer errors.
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// No site currently holds the file. Retried only when ledger state
    /// changes, not on a timer.
    #[error("No source site available")]
    NoSourceAvailable,

    /// Transfer aborted by user request. Not an error state in the ledger.
    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Transfer timed out after {0} seconds")]
    Timeout(u64),

    /// Invalid project/site configuration (duplicate site names, wrong
    /// active-site count, misconfigured provider). Surfaced at setup time,
    /// never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid sync status: {0}")]
    InvalidStatus(String),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    /// Ledger store failure. Fatal to dispatch until the store is reachable
    /// again.
    #[error("Database error: {0}")]
    Database(String),
}

impl SyncError {
    /// Whether the queue engine should retry the pair with backoff.
    ///
    /// `NotFound` and `NoSourceAvailable` are excluded: they are revived by
    /// ledger changes (a source appearing), not by elapsed time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transfer(_) | Self::Retryable { .. } | Self::HashMismatch { .. } | Self::Timeout(_)
        )
    }

    /// Vendor-provided retry-after hint in seconds, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Retryable {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

impl From<ProviderError> for SyncError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::NotFound { path } => Self::NotFound { path },
            ProviderError::Transfer(message) => Self::Transfer(message),
            ProviderError::Retryable {
                message,
                retry_after_secs,
            } => Self::Retryable {
                message,
                retry_after_secs,
            },
            ProviderError::Configuration(message) => Self::Configuration(message),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
