//! Local filesystem implementation of `StorageProvider`.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use provider_traits::{FileStat, ProviderError, Result, StorageProvider, TransferCapabilities};

use crate::error::LocalDriveError;

/// Read buffer size for hashing and copying.
const CHUNK_SIZE: usize = 64 * 1024;

/// Unlinks the staging file on drop unless the copy was promoted.
///
/// Runs from `Drop` so it also fires when the owning future is dropped at an
/// await point.
struct StagingGuard {
    path: Option<PathBuf>,
}

impl StagingGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Storage provider over a local directory root.
///
/// All contract paths are relative to `root`. Concurrency is bounded only by
/// disk throughput, so the capability descriptor advertises a generous
/// parallelism budget and no rate limit.
pub struct LocalDriveProvider {
    root: PathBuf,
    max_concurrency: usize,
}

impl LocalDriveProvider {
    /// Create a provider rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_concurrency: 8,
        }
    }

    /// Override the advertised concurrency budget.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Root directory this provider serves.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Staging name next to the final destination, so the promoting rename
    /// stays on one filesystem.
    fn staging_path(dest: &Path) -> PathBuf {
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        dest.with_file_name(format!("{}.part-{}", file_name, Uuid::new_v4()))
    }

    async fn hash_file(path: &Path) -> std::result::Result<(u64, String), LocalDriveError> {
        let mut file = fs::File::open(path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LocalDriveError::NotFound(path.to_path_buf())
            } else {
                LocalDriveError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let read = file.read(&mut buf).await.map_err(|source| LocalDriveError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            size += read as u64;
        }

        Ok((size, format!("{:x}", hasher.finalize())))
    }

    /// Copy `src` to `dest` through a staging file promoted by rename.
    ///
    /// The copy is a chunked loop rather than a single `fs::copy`, so a
    /// caller dropping the future mid-transfer (cancellation, timeout) stops
    /// writing at the next chunk boundary; the staging guard then unlinks the
    /// partial file. No error or cancellation path leaves `.part-*` residue.
    async fn copy_atomic(
        src: &Path,
        dest: &Path,
    ) -> std::result::Result<(), LocalDriveError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| LocalDriveError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let mut reader = fs::File::open(src).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LocalDriveError::NotFound(src.to_path_buf())
            } else {
                LocalDriveError::Io {
                    path: src.to_path_buf(),
                    source,
                }
            }
        })?;

        let staging = Self::staging_path(dest);
        let mut guard = StagingGuard::new(staging.clone());
        let mut writer = fs::File::create(&staging)
            .await
            .map_err(|source| LocalDriveError::Io {
                path: staging.clone(),
                source,
            })?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let read = reader
                .read(&mut buf)
                .await
                .map_err(|source| LocalDriveError::Io {
                    path: src.to_path_buf(),
                    source,
                })?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buf[..read])
                .await
                .map_err(|source| LocalDriveError::Io {
                    path: staging.clone(),
                    source,
                })?;
        }
        writer
            .flush()
            .await
            .map_err(|source| LocalDriveError::Io {
                path: staging.clone(),
                source,
            })?;
        drop(writer);

        fs::rename(&staging, dest)
            .await
            .map_err(|source| LocalDriveError::Io {
                path: dest.to_path_buf(),
                source,
            })?;
        guard.disarm();

        debug!(dest = %dest.display(), "Promoted staged file");
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for LocalDriveProvider {
    async fn is_active(&self) -> bool {
        fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let absolute = self.absolute(path);
        Ok(fs::try_exists(&absolute).await.map_err(|source| {
            ProviderError::from(LocalDriveError::Io {
                path: absolute.clone(),
                source,
            })
        })?)
    }

    async fn stat(&self, path: &Path) -> Result<FileStat> {
        let absolute = self.absolute(path);
        let (size, hash) = Self::hash_file(&absolute).await?;
        Ok(FileStat { size, hash })
    }

    async fn upload(&self, local_tmp_path: &Path, dest_path: &Path) -> Result<FileStat> {
        let absolute = self.absolute(dest_path);
        Self::copy_atomic(local_tmp_path, &absolute).await?;
        let (size, hash) = Self::hash_file(&absolute).await?;
        Ok(FileStat { size, hash })
    }

    async fn download(&self, src_path: &Path, local_tmp_path: &Path) -> Result<()> {
        let absolute = self.absolute(src_path);
        if !fs::try_exists(&absolute).await.unwrap_or(false) {
            return Err(LocalDriveError::NotFound(absolute).into());
        }
        Self::copy_atomic(&absolute, local_tmp_path).await?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let absolute = self.absolute(path);
        if let Err(source) = fs::remove_file(&absolute).await {
            if source.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %absolute.display(), error = %source, "Best-effort remove failed");
            }
        }
        Ok(())
    }

    fn capabilities(&self) -> TransferCapabilities {
        TransferCapabilities {
            max_concurrency: self.max_concurrency,
            supports_resume: false,
            rate_limit_per_second: None,
        }
    }
}
