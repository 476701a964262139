//! End-to-end reconciliation tests: real SQLite ledger, real local-drive
//! providers on scratch directories, plus scripted providers for failure
//! injection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::Notify;

use core_sitesync::{
    BackoffPolicy, EngineConfig, FileId, FileInfo, PresenceLedger, QueueEngine, Representation,
    SiteConfig, SiteRegistry, SiteRole, SiteWant, SqlitePresenceLedger, SyncState,
};
use provider_local_drive::LocalDriveProvider;
use provider_traits::{FileStat, ProviderError, StorageProvider, TransferCapabilities};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("core_sitesync=debug")
        .with_test_writer()
        .try_init();
}

fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "sitesync-test-{}-{}",
        label,
        uuid::Uuid::new_v4()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn ledger() -> Arc<SqlitePresenceLedger> {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    let ledger = SqlitePresenceLedger::new(pool);
    ledger.initialize().await.unwrap();
    Arc::new(ledger)
}

/// Write `content` under the site root and build the matching `FileInfo` by
/// asking the provider for the authoritative size/hash.
async fn seed_file(
    provider: &LocalDriveProvider,
    root: &Path,
    rel_path: &str,
    content: &[u8],
) -> FileInfo {
    let full = root.join(rel_path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(&full, content).unwrap();
    let stat = provider.stat(Path::new(rel_path)).await.unwrap();
    FileInfo::new(rel_path, stat.size, stat.hash)
}

async fn wait_for_state(
    ledger: &dyn PresenceLedger,
    file_id: FileId,
    site: &str,
    expected: SyncState,
) {
    for _ in 0..100 {
        let status = ledger.status(file_id, site).await.unwrap();
        if status.map(|s| s.state) == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("pair never reached {expected} at {site}");
}

/// Recursively check a site root for leftover `.part-*` staging files.
fn no_staging_residue(root: &Path) -> bool {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return true,
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains(".part-") {
            return false;
        }
        if entry.path().is_dir() && !no_staging_residue(&entry.path()) {
            return false;
        }
    }
    true
}

fn engine_config(work_dir: PathBuf) -> EngineConfig {
    EngineConfig {
        global_concurrency: 8,
        scan_interval_secs: 3600,
        transfer_timeout_secs: Some(30),
        backoff: BackoffPolicy::fixed(1_000, 10_000, 3),
        work_dir,
    }
}

/// Delegates to a real local drive but fails the first `fail_count` uploads.
struct FlakyProvider {
    inner: LocalDriveProvider,
    remaining_failures: AtomicUsize,
}

#[async_trait]
impl StorageProvider for FlakyProvider {
    async fn is_active(&self) -> bool {
        true
    }

    async fn exists(&self, path: &Path) -> provider_traits::Result<bool> {
        self.inner.exists(path).await
    }

    async fn stat(&self, path: &Path) -> provider_traits::Result<FileStat> {
        self.inner.stat(path).await
    }

    async fn upload(
        &self,
        local_tmp_path: &Path,
        dest_path: &Path,
    ) -> provider_traits::Result<FileStat> {
        if self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::Retryable {
                message: "injected throttle".into(),
                retry_after_secs: None,
            });
        }
        self.inner.upload(local_tmp_path, dest_path).await
    }

    async fn download(
        &self,
        src_path: &Path,
        local_tmp_path: &Path,
    ) -> provider_traits::Result<()> {
        self.inner.download(src_path, local_tmp_path).await
    }

    async fn remove(&self, path: &Path) -> provider_traits::Result<()> {
        self.inner.remove(path).await
    }

    fn capabilities(&self) -> TransferCapabilities {
        TransferCapabilities {
            max_concurrency: 2,
            supports_resume: false,
            rate_limit_per_second: None,
        }
    }
}

/// Uploads park until `release` is notified; used to hold transfers in
/// flight for cancellation and concurrency tests.
struct GatedProvider {
    inner: LocalDriveProvider,
    release: Arc<Notify>,
    started: Arc<Notify>,
    max_concurrency: usize,
}

#[async_trait]
impl StorageProvider for GatedProvider {
    async fn is_active(&self) -> bool {
        true
    }

    async fn exists(&self, path: &Path) -> provider_traits::Result<bool> {
        self.inner.exists(path).await
    }

    async fn stat(&self, path: &Path) -> provider_traits::Result<FileStat> {
        self.inner.stat(path).await
    }

    async fn upload(
        &self,
        local_tmp_path: &Path,
        dest_path: &Path,
    ) -> provider_traits::Result<FileStat> {
        self.started.notify_one();
        self.release.notified().await;
        self.inner.upload(local_tmp_path, dest_path).await
    }

    async fn download(
        &self,
        src_path: &Path,
        local_tmp_path: &Path,
    ) -> provider_traits::Result<()> {
        self.inner.download(src_path, local_tmp_path).await
    }

    async fn remove(&self, path: &Path) -> provider_traits::Result<()> {
        self.inner.remove(path).await
    }

    fn capabilities(&self) -> TransferCapabilities {
        TransferCapabilities {
            max_concurrency: self.max_concurrency,
            supports_resume: false,
            rate_limit_per_second: None,
        }
    }
}

#[tokio::test]
async fn test_publish_reaches_remote_site() {
    init_tracing();
    let studio_root = scratch_dir("studio");
    let remote_root = scratch_dir("remote");
    let studio = LocalDriveProvider::new(&studio_root);

    let file = seed_file(&studio, &studio_root, "sh010/beauty.0001.exr", b"exr-bytes").await;
    let repre = Representation::new("sh010", "renderMain", 1, "exr", vec![file.clone()]);

    let registry = Arc::new(
        SiteRegistry::builder("demo")
            .site(SiteConfig::new("studio", SiteRole::Active), Arc::new(studio))
            .site(
                SiteConfig::new("gdrive", SiteRole::Remote),
                Arc::new(LocalDriveProvider::new(&remote_root)),
            )
            .build()
            .unwrap(),
    );
    let ledger = ledger().await;
    let engine = QueueEngine::new(registry, ledger.clone(), engine_config(scratch_dir("work")));

    engine.register_publish(&repre).await.unwrap();

    // The active site is present immediately, before any transfer runs.
    let status = ledger.status(file.id, "studio").await.unwrap().unwrap();
    assert_eq!(status.state, SyncState::Available);

    let dispatched = engine.scan_once().await.unwrap();
    assert_eq!(dispatched, 1);
    wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Available).await;

    let copied = std::fs::read(remote_root.join("sh010/beauty.0001.exr")).unwrap();
    assert_eq!(copied, b"exr-bytes");

    // Nothing left to do.
    assert_eq!(engine.scan_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_transfer_retries_after_backoff() {
    init_tracing();
    let studio_root = scratch_dir("studio");
    let remote_root = scratch_dir("remote");
    let studio = LocalDriveProvider::new(&studio_root);

    let file = seed_file(&studio, &studio_root, "shot/cache.abc", b"abc-data").await;
    let repre = Representation::new("shot", "animCache", 1, "abc", vec![file.clone()]);

    let registry = Arc::new(
        SiteRegistry::builder("demo")
            .site(SiteConfig::new("studio", SiteRole::Active), Arc::new(studio))
            .site(
                SiteConfig::new("gdrive", SiteRole::Remote),
                Arc::new(FlakyProvider {
                    inner: LocalDriveProvider::new(&remote_root),
                    remaining_failures: AtomicUsize::new(2),
                }),
            )
            .build()
            .unwrap(),
    );
    let ledger = ledger().await;
    let engine = QueueEngine::new(registry, ledger.clone(), engine_config(scratch_dir("work")));

    engine.register_publish(&repre).await.unwrap();
    assert_eq!(engine.scan_once().await.unwrap(), 1);
    wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Failed).await;

    let status = ledger.status(file.id, "gdrive").await.unwrap().unwrap();
    assert_eq!(status.retry_count, 1);
    let first_deadline = status.next_eligible_at.unwrap();

    // Still inside the backoff window.
    assert_eq!(engine.scan_once().await.unwrap(), 0);

    // Second attempt fails again; the deadline moves further out (the delay
    // doubles from 1s to 2s).
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(engine.scan_once().await.unwrap(), 1);
    wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Failed).await;
    let status = ledger.status(file.id, "gdrive").await.unwrap().unwrap();
    assert_eq!(status.retry_count, 2);
    assert!(status.next_eligible_at.unwrap() > first_deadline);

    tokio::time::sleep(Duration::from_millis(2_200)).await;
    assert_eq!(engine.scan_once().await.unwrap(), 1);
    wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Available).await;

    let status = ledger.status(file.id, "gdrive").await.unwrap().unwrap();
    assert_eq!(status.retry_count, 0);
    assert!(status.last_error.is_none());
}

/// Uploads succeed but report a stat that never matches the recorded hash.
struct CorruptingProvider {
    inner: LocalDriveProvider,
}

#[async_trait]
impl StorageProvider for CorruptingProvider {
    async fn is_active(&self) -> bool {
        true
    }

    async fn exists(&self, path: &Path) -> provider_traits::Result<bool> {
        self.inner.exists(path).await
    }

    async fn stat(&self, path: &Path) -> provider_traits::Result<FileStat> {
        self.inner.stat(path).await
    }

    async fn upload(
        &self,
        local_tmp_path: &Path,
        dest_path: &Path,
    ) -> provider_traits::Result<FileStat> {
        let stat = self.inner.upload(local_tmp_path, dest_path).await?;
        Ok(FileStat {
            size: stat.size,
            hash: format!("corrupt-{}", stat.hash),
        })
    }

    async fn download(
        &self,
        src_path: &Path,
        local_tmp_path: &Path,
    ) -> provider_traits::Result<()> {
        self.inner.download(src_path, local_tmp_path).await
    }

    async fn remove(&self, path: &Path) -> provider_traits::Result<()> {
        self.inner.remove(path).await
    }

    fn capabilities(&self) -> TransferCapabilities {
        TransferCapabilities::default()
    }
}

#[tokio::test]
async fn test_hash_mismatch_is_retried_and_destination_cleaned() {
    init_tracing();
    let studio_root = scratch_dir("studio");
    let remote_root = scratch_dir("remote");
    let studio = LocalDriveProvider::new(&studio_root);

    let file = seed_file(&studio, &studio_root, "shot/geo.abc", b"alembic-bytes").await;
    let repre = Representation::new("shot", "model", 1, "abc", vec![file.clone()]);

    let registry = Arc::new(
        SiteRegistry::builder("demo")
            .site(SiteConfig::new("studio", SiteRole::Active), Arc::new(studio))
            .site(
                SiteConfig::new("gdrive", SiteRole::Remote),
                Arc::new(CorruptingProvider {
                    inner: LocalDriveProvider::new(&remote_root),
                }),
            )
            .build()
            .unwrap(),
    );
    let ledger = ledger().await;
    let engine = QueueEngine::new(registry, ledger.clone(), engine_config(scratch_dir("work")));

    engine.register_publish(&repre).await.unwrap();
    assert_eq!(engine.scan_once().await.unwrap(), 1);
    wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Failed).await;

    // A mismatch counts toward the attempt ceiling like any transfer error.
    let status = ledger.status(file.id, "gdrive").await.unwrap().unwrap();
    assert_eq!(status.retry_count, 1);
    assert!(status.next_eligible_at.is_some());
    assert!(status.last_error.unwrap().contains("Hash mismatch"));

    // The corrupt destination copy was removed.
    assert!(!remote_root.join("shot/geo.abc").exists());
}

#[tokio::test]
async fn test_three_retryable_failures_then_success() {
    init_tracing();
    let studio_root = scratch_dir("studio");
    let remote_root = scratch_dir("remote");
    let studio = LocalDriveProvider::new(&studio_root);

    let file = seed_file(&studio, &studio_root, "shot/layout.ma", b"maya-bytes").await;
    let repre = Representation::new("shot", "layout", 1, "ma", vec![file.clone()]);

    let registry = Arc::new(
        SiteRegistry::builder("demo")
            .site(SiteConfig::new("studio", SiteRole::Active), Arc::new(studio))
            .site(
                SiteConfig::new("gdrive", SiteRole::Remote),
                Arc::new(FlakyProvider {
                    inner: LocalDriveProvider::new(&remote_root),
                    remaining_failures: AtomicUsize::new(3),
                }),
            )
            .build()
            .unwrap(),
    );
    let ledger = ledger().await;
    // Ceiling above three so the third failure still schedules a retry.
    let config = EngineConfig {
        backoff: BackoffPolicy::fixed(1_000, 2_000, 4),
        ..engine_config(scratch_dir("work"))
    };
    let engine = QueueEngine::new(registry, ledger.clone(), config);

    engine.register_publish(&repre).await.unwrap();

    // Delays for attempts 1..3 are 1s, 2s, 2s (capped).
    for (expected_retries, delay_ms) in [(1u32, 1_200u64), (2, 2_200), (3, 2_200)] {
        assert_eq!(engine.scan_once().await.unwrap(), 1);
        wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Failed).await;
        let status = ledger.status(file.id, "gdrive").await.unwrap().unwrap();
        assert_eq!(status.retry_count, expected_retries);
        assert!(status.next_eligible_at.is_some());
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    assert_eq!(engine.scan_once().await.unwrap(), 1);
    wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Available).await;
    let status = ledger.status(file.id, "gdrive").await.unwrap().unwrap();
    assert_eq!(status.retry_count, 0);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_concurrent_scans_dispatch_each_pair_once() {
    init_tracing();
    let studio_root = scratch_dir("studio");
    let remote_root = scratch_dir("remote");
    let studio = LocalDriveProvider::new(&studio_root);

    let file = seed_file(&studio, &studio_root, "sh040/beauty.exr", b"exr-bytes").await;
    let repre = Representation::new("sh040", "renderMain", 1, "exr", vec![file.clone()]);

    let release = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());
    let registry = Arc::new(
        SiteRegistry::builder("demo")
            .site(SiteConfig::new("studio", SiteRole::Active), Arc::new(studio))
            .site(
                SiteConfig::new("gdrive", SiteRole::Remote),
                // Generous ceiling: admission alone must not dedupe; the
                // ledger claim has to.
                Arc::new(GatedProvider {
                    inner: LocalDriveProvider::new(&remote_root),
                    release: Arc::clone(&release),
                    started: Arc::clone(&started),
                    max_concurrency: 8,
                }),
            )
            .build()
            .unwrap(),
    );
    let ledger = ledger().await;
    let engine = QueueEngine::new(registry, ledger.clone(), engine_config(scratch_dir("work")));

    engine.register_publish(&repre).await.unwrap();

    let (a, b, c) = tokio::join!(engine.scan_once(), engine.scan_once(), engine.scan_once());
    assert_eq!(a.unwrap() + b.unwrap() + c.unwrap(), 1);
    assert_eq!(engine.active_jobs().await.len(), 1);

    release.notify_one();
    wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Available).await;
}

#[tokio::test]
async fn test_missing_source_parks_until_source_appears() {
    init_tracing();
    let studio_root = scratch_dir("studio");
    let remote_root = scratch_dir("remote");
    let studio = LocalDriveProvider::new(&studio_root);

    // Publish metadata only; no site actually holds the file yet.
    let file = FileInfo::new("late/file.ma", 9, "unknown");
    let repre = Representation::new("late", "workfile", 1, "ma", vec![file.clone()]);

    let registry = Arc::new(
        SiteRegistry::builder("demo")
            .site(
                SiteConfig::new("studio", SiteRole::Active),
                Arc::new(studio),
            )
            .site(
                SiteConfig::new("gdrive", SiteRole::Remote),
                Arc::new(LocalDriveProvider::new(&remote_root)),
            )
            .build()
            .unwrap(),
    );
    let ledger = ledger().await;
    let engine = QueueEngine::new(
        Arc::clone(&registry),
        ledger.clone(),
        engine_config(scratch_dir("work")),
    );

    let wants = vec![SiteWant::wanted("studio"), SiteWant::wanted("gdrive")];
    ledger.upsert_publish(&repre, &wants).await.unwrap();

    assert_eq!(engine.scan_once().await.unwrap(), 2);
    wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Failed).await;
    let status = ledger.status(file.id, "gdrive").await.unwrap().unwrap();
    assert!(status.awaiting_source);
    assert!(status.next_eligible_at.is_none());

    // Time alone never revives the pair.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.scan_once().await.unwrap(), 0);

    // The file lands at the studio; seed content matching the recorded hash
    // path and mark it present.
    let studio_provider = registry.resolve("studio").unwrap();
    std::fs::create_dir_all(studio_root.join("late")).unwrap();
    std::fs::write(studio_root.join("late/file.ma"), b"maya-file").unwrap();
    let stat = studio_provider.stat(Path::new("late/file.ma")).await.unwrap();
    ledger.mark_present(file.id, "studio", &stat).await.unwrap();

    let status = ledger.status(file.id, "gdrive").await.unwrap().unwrap();
    assert_eq!(status.state, SyncState::NotAvailable);
    assert!(!status.awaiting_source);
}

#[tokio::test]
async fn test_cancel_in_flight_transfer() {
    init_tracing();
    let studio_root = scratch_dir("studio");
    let remote_root = scratch_dir("remote");
    let studio = LocalDriveProvider::new(&studio_root);

    let file = seed_file(&studio, &studio_root, "big/plate.mov", b"mov-bytes").await;
    let repre = Representation::new("big", "plate", 1, "mov", vec![file.clone()]);

    let release = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());
    let registry = Arc::new(
        SiteRegistry::builder("demo")
            .site(SiteConfig::new("studio", SiteRole::Active), Arc::new(studio))
            .site(
                SiteConfig::new("gdrive", SiteRole::Remote),
                Arc::new(GatedProvider {
                    inner: LocalDriveProvider::new(&remote_root),
                    release: Arc::clone(&release),
                    started: Arc::clone(&started),
                    max_concurrency: 2,
                }),
            )
            .build()
            .unwrap(),
    );
    let ledger = ledger().await;
    let engine = QueueEngine::new(registry, ledger.clone(), engine_config(scratch_dir("work")));

    engine.register_publish(&repre).await.unwrap();
    assert_eq!(engine.scan_once().await.unwrap(), 1);
    started.notified().await;

    assert_eq!(engine.active_jobs().await.len(), 1);
    assert!(engine.cancel(file.id, "gdrive").await);
    wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::NotAvailable).await;

    // Cancellation is not a failure.
    let status = ledger.status(file.id, "gdrive").await.unwrap().unwrap();
    assert_eq!(status.retry_count, 0);

    // The worker unregisters itself right after recording the outcome.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.active_jobs().await.is_empty());

    // No partial artifact is visible at the destination, and no staging
    // residue either.
    assert!(!remote_root.join("big/plate.mov").exists());
    assert!(no_staging_residue(&remote_root));

    // Cancelling a pair with no running job reports false.
    assert!(!engine.cancel(file.id, "gdrive").await);
}

#[tokio::test]
async fn test_fanout_to_two_remotes_does_not_collide() {
    init_tracing();
    let studio_root = scratch_dir("studio");
    let fast_root = scratch_dir("fast");
    let slow_root = scratch_dir("slow");
    let studio = LocalDriveProvider::new(&studio_root);

    let file = seed_file(&studio, &studio_root, "sh030/beauty.exr", b"exr-bytes").await;
    let repre = Representation::new("sh030", "renderMain", 1, "exr", vec![file.clone()]);

    // The slow remote holds its upload until the fast one has fully
    // finished, so both transfers of the same file overlap.
    let release = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());
    let registry = Arc::new(
        SiteRegistry::builder("demo")
            .site(SiteConfig::new("studio", SiteRole::Active), Arc::new(studio))
            .site(
                SiteConfig::new("fast", SiteRole::Remote),
                Arc::new(LocalDriveProvider::new(&fast_root)),
            )
            .site(
                SiteConfig::new("slow", SiteRole::Remote),
                Arc::new(GatedProvider {
                    inner: LocalDriveProvider::new(&slow_root),
                    release: Arc::clone(&release),
                    started: Arc::clone(&started),
                    max_concurrency: 2,
                }),
            )
            .build()
            .unwrap(),
    );
    let ledger = ledger().await;
    let engine = QueueEngine::new(registry, ledger.clone(), engine_config(scratch_dir("work")));

    engine.register_publish(&repre).await.unwrap();
    assert_eq!(engine.scan_once().await.unwrap(), 2);

    started.notified().await;
    wait_for_state(ledger.as_ref(), file.id, "fast", SyncState::Available).await;

    // The fast worker has cleaned up after itself; releasing the slow one
    // must still find its own staging copy intact.
    release.notify_one();
    wait_for_state(ledger.as_ref(), file.id, "slow", SyncState::Available).await;

    let status = ledger.status(file.id, "slow").await.unwrap().unwrap();
    assert!(!status.awaiting_source);
    assert_eq!(
        std::fs::read(slow_root.join("sh030/beauty.exr")).unwrap(),
        b"exr-bytes"
    );
}

#[tokio::test]
async fn test_site_concurrency_ceiling() {
    init_tracing();
    let studio_root = scratch_dir("studio");
    let remote_root = scratch_dir("remote");
    let studio = LocalDriveProvider::new(&studio_root);

    let file_a = seed_file(&studio, &studio_root, "seq/f.0001.exr", b"frame-1").await;
    let file_b = seed_file(&studio, &studio_root, "seq/f.0002.exr", b"frame-2").await;
    let file_c = seed_file(&studio, &studio_root, "seq/f.0003.exr", b"frame-3").await;
    let repre = Representation::new(
        "seq",
        "renderMain",
        1,
        "exr",
        vec![file_a.clone(), file_b.clone(), file_c.clone()],
    );

    let release = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());
    let registry = Arc::new(
        SiteRegistry::builder("demo")
            .site(SiteConfig::new("studio", SiteRole::Active), Arc::new(studio))
            .site(
                SiteConfig::new("gdrive", SiteRole::Remote),
                Arc::new(GatedProvider {
                    inner: LocalDriveProvider::new(&remote_root),
                    release: Arc::clone(&release),
                    started: Arc::clone(&started),
                    max_concurrency: 1,
                }),
            )
            .build()
            .unwrap(),
    );
    let ledger = ledger().await;
    let engine = QueueEngine::new(registry, ledger.clone(), engine_config(scratch_dir("work")));

    engine.register_publish(&repre).await.unwrap();

    // Only one slot at the remote, so only one job is admitted per scan.
    assert_eq!(engine.scan_once().await.unwrap(), 1);
    started.notified().await;
    assert_eq!(engine.scan_once().await.unwrap(), 0);
    assert_eq!(engine.active_jobs().await.len(), 1);

    // Finish all three, one slot at a time.
    for _ in 0..3 {
        release.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.scan_once().await.unwrap();
    }
    release.notify_one();
    for file in [&file_a, &file_b, &file_c] {
        wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Available).await;
    }
}

#[tokio::test]
async fn test_revalidation_downgrades_missing_remote() {
    init_tracing();
    let studio_root = scratch_dir("studio");
    let remote_root = scratch_dir("remote");
    let studio = LocalDriveProvider::new(&studio_root);

    let file = seed_file(&studio, &studio_root, "look/tex.png", b"png-bytes").await;
    let repre = Representation::new("look", "texture", 1, "png", vec![file.clone()]);

    let registry = Arc::new(
        SiteRegistry::builder("demo")
            .site(SiteConfig::new("studio", SiteRole::Active), Arc::new(studio))
            .site(
                SiteConfig::new("gdrive", SiteRole::Remote),
                Arc::new(LocalDriveProvider::new(&remote_root)),
            )
            .build()
            .unwrap(),
    );
    let ledger = ledger().await;
    let engine = QueueEngine::new(registry, ledger.clone(), engine_config(scratch_dir("work")));

    engine.register_publish(&repre).await.unwrap();
    engine.scan_once().await.unwrap();
    wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Available).await;

    // Content disappears behind the engine's back.
    std::fs::remove_file(remote_root.join("look/tex.png")).unwrap();
    assert_eq!(engine.revalidate().await.unwrap(), 1);

    let status = ledger.status(file.id, "gdrive").await.unwrap().unwrap();
    assert_eq!(status.state, SyncState::NotAvailable);

    // The next scan repairs the site.
    assert_eq!(engine.scan_once().await.unwrap(), 1);
    wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Available).await;
}

#[tokio::test]
async fn test_pause_resume_and_reset() {
    init_tracing();
    let studio_root = scratch_dir("studio");
    let remote_root = scratch_dir("remote");
    let studio = LocalDriveProvider::new(&studio_root);

    let file = seed_file(&studio, &studio_root, "shot/comp.nk", b"nuke-script").await;
    let repre = Representation::new("shot", "compScript", 1, "nk", vec![file.clone()]);

    let registry = Arc::new(
        SiteRegistry::builder("demo")
            .site(SiteConfig::new("studio", SiteRole::Active), Arc::new(studio))
            .site(
                SiteConfig::new("gdrive", SiteRole::Remote),
                Arc::new(LocalDriveProvider::new(&remote_root)),
            )
            .build()
            .unwrap(),
    );
    let ledger = ledger().await;
    let engine = QueueEngine::new(registry, ledger.clone(), engine_config(scratch_dir("work")));

    engine.register_publish(&repre).await.unwrap();
    engine.pause(file.id, "gdrive").await.unwrap();

    assert_eq!(engine.scan_once().await.unwrap(), 0);
    let status = ledger.status(file.id, "gdrive").await.unwrap().unwrap();
    assert_eq!(status.state, SyncState::Paused);

    engine.resume(file.id, "gdrive").await.unwrap();
    assert_eq!(engine.scan_once().await.unwrap(), 1);
    wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Available).await;
}

#[tokio::test]
async fn test_run_loop_reacts_to_trigger() {
    init_tracing();
    let studio_root = scratch_dir("studio");
    let remote_root = scratch_dir("remote");
    let studio = LocalDriveProvider::new(&studio_root);

    let file = seed_file(&studio, &studio_root, "shot/grade.cube", b"lut-bytes").await;
    let repre = Representation::new("shot", "grade", 1, "cube", vec![file.clone()]);

    let registry = Arc::new(
        SiteRegistry::builder("demo")
            .site(SiteConfig::new("studio", SiteRole::Active), Arc::new(studio))
            .site(
                SiteConfig::new("gdrive", SiteRole::Remote),
                Arc::new(LocalDriveProvider::new(&remote_root)),
            )
            .build()
            .unwrap(),
    );
    let ledger = ledger().await;
    let engine = Arc::new(QueueEngine::new(
        registry,
        ledger.clone(),
        engine_config(scratch_dir("work")),
    ));

    let shutdown = tokio_util::sync::CancellationToken::new();
    let runner = {
        let engine = Arc::clone(&engine);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };

    // register_publish wakes the loop itself; no manual trigger needed.
    engine.register_publish(&repre).await.unwrap();
    wait_for_state(ledger.as_ref(), file.id, "gdrive", SyncState::Available).await;

    shutdown.cancel();
    runner.await.unwrap();
}
