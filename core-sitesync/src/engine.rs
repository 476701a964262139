//! # Queue Engine
//!
//! The reconciliation loop. Periodically (and on demand) scans the ledger for
//! pairs that are wanted but absent, claims them, and runs bounded transfer
//! jobs that move file content from a source site to the destination site via
//! a local staging file.
//!
//! Admission control is layered: a global concurrency ceiling, then a per-site
//! ceiling derived from each provider's capability descriptor, then the
//! ledger's atomic claim. Permits are acquired before claiming so a pair is
//! never marked IN_PROGRESS without a worker slot to run it.
//!
//! All durable state lives in the ledger. The engine itself holds only
//! in-flight bookkeeping (cancellation tokens), so a crash mid-transfer is
//! recovered by [`QueueEngine::recover`] plus the next scan.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::ledger::{PresenceLedger, SiteWant, TransferCandidate};
use crate::limiter::RateLimiter;
use crate::model::{FileId, Representation};
use crate::registry::{SiteRegistry, SiteRole};
use crate::{Result, SyncError};
use provider_traits::{FileStat, StorageProvider};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ceiling across all sites.
    pub global_concurrency: usize,
    /// Seconds between ledger scans when nothing triggers one earlier.
    pub scan_interval_secs: u64,
    /// Per-transfer deadline; `None` disables the timeout.
    pub transfer_timeout_secs: Option<u64>,
    /// Retry curve applied to failed pairs.
    pub backoff: BackoffPolicy,
    /// Directory for staging files while content moves between providers.
    pub work_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 16,
            scan_interval_secs: 60,
            transfer_timeout_secs: Some(3_600),
            backoff: BackoffPolicy::default(),
            work_dir: std::env::temp_dir().join("sitesync-staging"),
        }
    }
}

/// Descriptor of one in-flight transfer, for status displays.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub file_id: FileId,
    pub site_name: String,
    pub path: String,
    pub size: u64,
}

struct SiteLimits {
    semaphore: Arc<Semaphore>,
    limiter: Option<Arc<RateLimiter>>,
}

/// Reconciliation engine for one project.
pub struct QueueEngine {
    registry: Arc<SiteRegistry>,
    ledger: Arc<dyn PresenceLedger>,
    config: EngineConfig,
    global: Arc<Semaphore>,
    site_limits: HashMap<String, SiteLimits>,
    in_flight: Arc<Mutex<HashMap<(FileId, String), (CancellationToken, TransferJob)>>>,
    wakeup: Arc<Notify>,
}

impl QueueEngine {
    pub fn new(
        registry: Arc<SiteRegistry>,
        ledger: Arc<dyn PresenceLedger>,
        config: EngineConfig,
    ) -> Self {
        let mut site_limits = HashMap::new();
        for site in registry.all_sites() {
            // all_sites only yields configured names.
            if let Ok(caps) = registry.capabilities(site) {
                site_limits.insert(
                    site.to_string(),
                    SiteLimits {
                        semaphore: Arc::new(Semaphore::new(caps.max_concurrency.max(1))),
                        limiter: caps
                            .rate_limit_per_second
                            .map(|per_second| Arc::new(RateLimiter::new(per_second))),
                    },
                );
            }
        }

        Self {
            registry,
            ledger,
            global: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            site_limits,
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            wakeup: Arc::new(Notify::new()),
        }
    }

    /// Register a freshly published representation: persist it, mark the
    /// active site as holding every file, and wake the scan loop.
    #[tracing::instrument(skip_all, fields(representation_id = %representation.id))]
    pub async fn register_publish(&self, representation: &Representation) -> Result<()> {
        let wants: Vec<SiteWant> = self
            .registry
            .all_sites()
            .iter()
            .map(|site| {
                let enabled = self
                    .registry
                    .site_config(site)
                    .map(|c| c.enabled)
                    .unwrap_or(false);
                SiteWant {
                    site_name: site.to_string(),
                    wanted: enabled,
                }
            })
            .collect();

        self.ledger.upsert_publish(representation, &wants).await?;

        let active = self.registry.active_site().to_string();
        for file in &representation.files {
            self.ledger
                .mark_present(
                    file.id,
                    &active,
                    &FileStat {
                        size: file.size,
                        hash: file.hash.clone(),
                    },
                )
                .await?;
        }

        self.wakeup.notify_one();
        Ok(())
    }

    /// Request an immediate scan instead of waiting for the interval.
    pub fn trigger_scan(&self) {
        self.wakeup.notify_one();
    }

    /// Cancel one in-flight transfer. Returns `false` when the pair is not
    /// currently running.
    pub async fn cancel(&self, file_id: FileId, site_name: &str) -> bool {
        let in_flight = self.in_flight.lock().await;
        match in_flight.get(&(file_id, site_name.to_string())) {
            Some((token, _)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of currently running jobs.
    pub async fn active_jobs(&self) -> Vec<TransferJob> {
        self.in_flight
            .lock()
            .await
            .values()
            .map(|(_, job)| job.clone())
            .collect()
    }

    /// Reset pairs stranded IN_PROGRESS by a previous process crash.
    ///
    /// Must run once before the first scan; any pair IN_PROGRESS at that
    /// point has no live worker.
    pub async fn recover(&self) -> Result<u64> {
        self.ledger.recover_in_progress().await
    }

    /// Run the reconciliation loop until `shutdown` fires. In-flight jobs are
    /// cancelled and recorded before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            project = self.registry.project(),
            interval_secs = self.config.scan_interval_secs,
            "Queue engine started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(self.config.scan_interval_secs)) => {},
                _ = self.wakeup.notified() => {},
            }

            if let Err(e) = self.scan_once().await {
                error!(error = %e, "Scan cycle failed");
            }
        }

        // Propagate shutdown to workers; they record a cancel outcome.
        {
            let in_flight = self.in_flight.lock().await;
            for (token, _) in in_flight.values() {
                token.cancel();
            }
        }
        // Workers hold permits; once all are released every job has settled.
        let _ = self
            .global
            .acquire_many(self.config.global_concurrency.max(1) as u32)
            .await;

        info!(project = self.registry.project(), "Queue engine stopped");
    }

    /// One scan-and-dispatch cycle. Visits destination sites in registry
    /// order (active first, then remotes by priority) and dispatches every
    /// eligible pair that fits under the concurrency ceilings.
    pub async fn scan_once(&self) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut dispatched = 0;

        'sites: for site in self.registry.enabled_sites() {
            let candidates = self.ledger.candidates(site, now).await?;
            if candidates.is_empty() {
                continue;
            }
            if !self.registry.resolve(site)?.is_active().await {
                warn!(site, "Site backend not reachable, skipping scan");
                continue;
            }
            debug!(site, count = candidates.len(), "Scan found eligible pairs");

            for candidate in candidates {
                let Ok(global_permit) = Arc::clone(&self.global).try_acquire_owned() else {
                    // Global ceiling reached; later sites cannot fit either.
                    break 'sites;
                };
                let Some(limits) = self.site_limits.get(site) else {
                    continue 'sites;
                };
                let Ok(site_permit) = Arc::clone(&limits.semaphore).try_acquire_owned() else {
                    // This site is saturated; try the next one.
                    continue 'sites;
                };

                if !self.ledger.claim(candidate.file_id, site, now).await? {
                    // Lost the race or eligibility changed; skip.
                    continue;
                }

                self.spawn_worker(site, candidate, global_permit, site_permit)
                    .await;
                dispatched += 1;
            }
        }

        if dispatched > 0 {
            debug!(dispatched, "Scan cycle dispatched jobs");
        }
        Ok(dispatched)
    }

    async fn spawn_worker(
        &self,
        site: &str,
        candidate: TransferCandidate,
        global_permit: OwnedSemaphorePermit,
        site_permit: OwnedSemaphorePermit,
    ) {
        let token = CancellationToken::new();
        let job = TransferJob {
            file_id: candidate.file_id,
            site_name: site.to_string(),
            path: candidate.path.clone(),
            size: candidate.size,
        };
        {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.insert(
                (candidate.file_id, site.to_string()),
                (token.clone(), job),
            );
        }

        let worker = Worker {
            registry: Arc::clone(&self.registry),
            ledger: Arc::clone(&self.ledger),
            backoff: self.config.backoff,
            transfer_timeout_secs: self.config.transfer_timeout_secs,
            work_dir: self.config.work_dir.clone(),
            limiter: self
                .site_limits
                .get(site)
                .and_then(|l| l.limiter.as_ref().map(Arc::clone)),
            dest_site: site.to_string(),
        };
        let in_flight = Arc::clone(&self.in_flight);
        let wakeup = Arc::clone(&self.wakeup);

        tokio::spawn(async move {
            let file_id = candidate.file_id;
            let dest = worker.dest_site.clone();
            worker.execute(candidate, token).await;
            in_flight.lock().await.remove(&(file_id, dest));
            drop(site_permit);
            drop(global_permit);
            // A finished job may have freed a slot or created a new source.
            wakeup.notify_one();
        });
    }

    /// Verify AVAILABLE pairs against the backends and downgrade stale ones.
    ///
    /// Intended to run far less often than the scan loop; a downgraded pair
    /// re-enters the normal dispatch path.
    #[tracing::instrument(skip_all, fields(project = self.registry.project()))]
    pub async fn revalidate(&self) -> Result<usize> {
        let mut downgraded = 0;
        for site in self.registry.enabled_sites() {
            let provider = self.registry.resolve(site)?;
            for entry in self.ledger.available_files(site).await? {
                match provider.stat(std::path::Path::new(&entry.path)).await {
                    Ok(stat) if stat.hash == entry.hash => {}
                    Ok(stat) => {
                        self.ledger
                            .downgrade_available(
                                entry.file_id,
                                site,
                                &format!("content hash changed: {}", stat.hash),
                            )
                            .await?;
                        downgraded += 1;
                    }
                    Err(provider_traits::ProviderError::NotFound { .. }) => {
                        self.ledger
                            .downgrade_available(entry.file_id, site, "file missing at site")
                            .await?;
                        downgraded += 1;
                    }
                    Err(e) => {
                        // Transient backend trouble; leave the row alone.
                        warn!(site, path = %entry.path, error = %e, "Revalidation probe failed");
                    }
                }
            }
        }
        if downgraded > 0 {
            self.wakeup.notify_one();
        }
        Ok(downgraded)
    }

    /// Pause a pair (delegates to the ledger; no effect mid-transfer).
    pub async fn pause(&self, file_id: FileId, site_name: &str) -> Result<()> {
        self.ledger.pause(file_id, site_name).await
    }

    /// Resume a paused pair and wake the scan loop.
    pub async fn resume(&self, file_id: FileId, site_name: &str) -> Result<()> {
        self.ledger.resume(file_id, site_name).await?;
        self.wakeup.notify_one();
        Ok(())
    }

    /// Clear failure bookkeeping and wake the scan loop.
    pub async fn reset_status(&self, file_id: FileId, site_name: &str) -> Result<()> {
        self.ledger.reset_status(file_id, site_name).await?;
        self.wakeup.notify_one();
        Ok(())
    }

    /// Change dispatch priority for a pair.
    pub async fn set_priority(
        &self,
        file_id: FileId,
        site_name: &str,
        priority: i32,
    ) -> Result<()> {
        self.ledger.set_priority(file_id, site_name, priority).await
    }
}

/// State captured for one spawned transfer.
struct Worker {
    registry: Arc<SiteRegistry>,
    ledger: Arc<dyn PresenceLedger>,
    backoff: BackoffPolicy,
    transfer_timeout_secs: Option<u64>,
    work_dir: PathBuf,
    limiter: Option<Arc<RateLimiter>>,
    dest_site: String,
}

impl Worker {
    async fn execute(&self, candidate: TransferCandidate, token: CancellationToken) {
        let outcome = self.transfer(&candidate, &token).await;
        let file_id = candidate.file_id;

        match outcome {
            Ok(stat) => {
                info!(
                    %file_id,
                    site = %self.dest_site,
                    path = %candidate.path,
                    size = stat.size,
                    "Transfer complete"
                );
                if let Err(e) = self.ledger.record_success(file_id, &self.dest_site, &stat).await {
                    error!(%file_id, error = %e, "Failed to record transfer success");
                }
            }
            Err(SyncError::Cancelled) => {
                info!(%file_id, site = %self.dest_site, "Transfer cancelled");
                if let Err(e) = self.ledger.record_cancel(file_id, &self.dest_site).await {
                    error!(%file_id, error = %e, "Failed to record cancellation");
                }
            }
            Err(error) => {
                if let Err(e) = self
                    .ledger
                    .record_failure(file_id, &self.dest_site, &error, &self.backoff)
                    .await
                {
                    error!(%file_id, error = %e, "Failed to record transfer failure");
                }
            }
        }
    }

    /// Move content for one pair: pick a source site, download to a staging
    /// file, upload to the destination, verify the hash.
    async fn transfer(
        &self,
        candidate: &TransferCandidate,
        token: &CancellationToken,
    ) -> Result<FileStat> {
        let source_site = self.pick_source(candidate.file_id).await?;
        let source = self.registry.resolve(&source_site)?;
        let dest = self.registry.resolve(&self.dest_site)?;

        debug!(
            file_id = %candidate.file_id,
            source = %source_site,
            dest = %self.dest_site,
            path = %candidate.path,
            "Starting transfer"
        );

        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        // Keyed by (file, destination): the same file may be in flight to
        // several sites at once, and they must not share a staging file.
        let staging = self
            .work_dir
            .join(format!("{}-{}.staging", candidate.file_id, self.dest_site));
        let result = self
            .run_transfer(candidate, source, dest, &staging, token)
            .await;
        // Best-effort staging cleanup on any outcome.
        let _ = tokio::fs::remove_file(&staging).await;
        result
    }

    async fn run_transfer(
        &self,
        candidate: &TransferCandidate,
        source: Arc<dyn StorageProvider>,
        dest: Arc<dyn StorageProvider>,
        staging: &std::path::Path,
        token: &CancellationToken,
    ) -> Result<FileStat> {
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| SyncError::Transfer(format!("staging dir: {}", e)))?;

        let path = std::path::Path::new(&candidate.path);
        let body = async {
            source.download(path, staging).await?;
            let stat = dest.upload(staging, path).await?;
            Ok::<FileStat, SyncError>(stat)
        };

        let stat = match self.transfer_timeout_secs {
            Some(secs) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(SyncError::Cancelled),
                    result = tokio::time::timeout(Duration::from_secs(secs), body) => {
                        result.map_err(|_| SyncError::Timeout(secs))??
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = token.cancelled() => return Err(SyncError::Cancelled),
                    result = body => result?,
                }
            }
        };

        if stat.hash != candidate.hash {
            // Do not leave corrupt content marked present at the site.
            let _ = dest.remove(path).await;
            return Err(SyncError::HashMismatch {
                expected: candidate.hash.clone(),
                actual: stat.hash,
            });
        }

        Ok(stat)
    }

    /// Pick the source site: the active site when it holds the file,
    /// otherwise the first holding remote in priority order.
    async fn pick_source(&self, file_id: FileId) -> Result<String> {
        let holding = self.ledger.sites_holding(file_id).await?;
        if holding.is_empty() {
            return Err(SyncError::NoSourceAvailable);
        }

        let active = self.registry.active_site();
        if holding.iter().any(|s| s == active) && active != self.dest_site {
            return Ok(active.to_string());
        }
        for site in self.registry.list_sites(SiteRole::Remote) {
            if site != self.dest_site && holding.iter().any(|s| s == site) {
                return Ok(site.to_string());
            }
        }
        Err(SyncError::NoSourceAvailable)
    }
}
