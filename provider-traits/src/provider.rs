//! The `StorageProvider` trait and its supporting types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Size and content hash of a remote file.
///
/// The hash is the comparison key across sites: two sites hold "the same
/// file" iff the hashes match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// File size in bytes.
    pub size: u64,
    /// Hex-encoded content hash (SHA-256 for the bundled adapters).
    pub hash: String,
}

/// Static capability descriptor for a provider.
///
/// The queue engine sizes per-site concurrency and pacing from this; it is
/// queried once when the site registry is built and treated as immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCapabilities {
    /// Maximum concurrent operations the backend tolerates.
    pub max_concurrency: usize,
    /// Whether interrupted transfers can be resumed.
    pub supports_resume: bool,
    /// Operations-per-second budget for rate-limited backends. `None` means
    /// unthrottled.
    pub rate_limit_per_second: Option<u32>,
}

impl Default for TransferCapabilities {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            supports_resume: false,
            rate_limit_per_second: None,
        }
    }
}

/// Uniform interface over a concrete storage backend.
///
/// Paths are backend-relative (the adapter owns its root). All methods take
/// `&self`; implementations own their credential/session state exclusively
/// and must be safe to call from concurrent transfer workers.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// True when the provider has a working configuration (root reachable,
    /// credentials valid). Sites whose provider is inactive are skipped by
    /// the scan loop.
    async fn is_active(&self) -> bool;

    /// Check whether `path` exists on the backend.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Retrieve size and content hash for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ProviderError::NotFound`] if the path is absent.
    async fn stat(&self, path: &Path) -> Result<FileStat>;

    /// Copy a local staging file to `dest_path` on the backend.
    ///
    /// Must stage into a temporary location and promote atomically; a partial
    /// upload is never visible at `dest_path`. Returns the stat of the
    /// promoted file.
    async fn upload(&self, local_tmp_path: &Path, dest_path: &Path) -> Result<FileStat>;

    /// Copy `src_path` from the backend into a local staging file.
    ///
    /// The staging file itself is written atomically (temp + rename) so an
    /// aborted download never leaves a truncated file at `local_tmp_path`.
    async fn download(&self, src_path: &Path, local_tmp_path: &Path) -> Result<()>;

    /// Best-effort delete. Failures are logged by callers, never fatal.
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Capability descriptor used for concurrency and pacing decisions.
    fn capabilities(&self) -> TransferCapabilities;
}

impl std::fmt::Debug for dyn StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn StorageProvider")
    }
}
