//! # Presence Ledger
//!
//! The authoritative, durable record of which sites hold, want, or failed to
//! receive every tracked file. The queue engine is the only writer of status
//! transitions; the query service only reads.
//!
//! ## Concurrency
//!
//! The at-most-one-in-flight-job invariant is enforced here: [`claim`]
//! performs a single conditional `UPDATE` that moves a pair from
//! NOT_AVAILABLE/FAILED to IN_PROGRESS only when it is still eligible, so two
//! concurrent scan cycles can never both dispatch the same pair. Once a pair
//! is IN_PROGRESS only the worker that claimed it records an outcome, which
//! keeps per-pair transitions totally ordered without long-held locks.
//!
//! [`claim`]: PresenceLedger::claim

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::model::{FileId, Representation, RepresentationId};
use crate::status::{SiteStatus, SyncState};
use crate::{Result, SyncError};
use provider_traits::FileStat;

/// Desired-state entry for one site at publish time.
#[derive(Debug, Clone)]
pub struct SiteWant {
    pub site_name: String,
    pub wanted: bool,
}

impl SiteWant {
    pub fn wanted(site_name: impl Into<String>) -> Self {
        Self {
            site_name: site_name.into(),
            wanted: true,
        }
    }

    pub fn unwanted(site_name: impl Into<String>) -> Self {
        Self {
            site_name: site_name.into(),
            wanted: false,
        }
    }
}

/// A (file, site) pair eligible for transfer, joined with file metadata.
#[derive(Debug, Clone)]
pub struct TransferCandidate {
    pub file_id: FileId,
    pub representation_id: RepresentationId,
    pub path: String,
    pub size: u64,
    pub hash: String,
    pub retry_count: u32,
    pub priority: i32,
}

/// Persistence contract for the presence ledger.
#[async_trait]
pub trait PresenceLedger: Send + Sync {
    /// Insert a representation with its files and initialize per-site status
    /// rows. Idempotent: repeated calls with the same representation id leave
    /// the ledger unchanged.
    async fn upsert_publish(&self, representation: &Representation, sites: &[SiteWant])
        -> Result<()>;

    /// Record that a site already holds a file (publish-time presence of the
    /// active site, or operator fix-up). Also revives pairs parked on
    /// `NoSourceAvailable`.
    async fn mark_present(&self, file_id: FileId, site_name: &str, stat: &FileStat) -> Result<()>;

    /// Toggle the desired state without touching transfer history.
    async fn mark_wanted(&self, file_id: FileId, site_name: &str, wanted: bool) -> Result<()>;

    /// Atomically transition an eligible pair to IN_PROGRESS. Returns `false`
    /// when the pair was already claimed, paused, unwanted, or not yet past
    /// its backoff deadline.
    async fn claim(&self, file_id: FileId, site_name: &str, now: i64) -> Result<bool>;

    /// Fold a successful, hash-verified transfer back into the ledger.
    async fn record_success(&self, file_id: FileId, site_name: &str, stat: &FileStat)
        -> Result<()>;

    /// Fold a failed transfer back into the ledger, computing the next retry
    /// deadline from `policy` (or parking the pair when attempts are
    /// exhausted or no source exists).
    async fn record_failure(
        &self,
        file_id: FileId,
        site_name: &str,
        error: &SyncError,
        policy: &BackoffPolicy,
    ) -> Result<()>;

    /// User-initiated abort: back to NOT_AVAILABLE, retry count untouched.
    async fn record_cancel(&self, file_id: FileId, site_name: &str) -> Result<()>;

    /// Eligible pairs for a destination site, highest priority first.
    async fn candidates(&self, site_name: &str, now: i64) -> Result<Vec<TransferCandidate>>;

    /// Sites currently holding a file (state AVAILABLE), ordered by name.
    async fn sites_holding(&self, file_id: FileId) -> Result<Vec<String>>;

    /// AVAILABLE pairs at a site, for revalidation scans.
    async fn available_files(&self, site_name: &str) -> Result<Vec<TransferCandidate>>;

    /// Full status row for one pair.
    async fn status(&self, file_id: FileId, site_name: &str) -> Result<Option<SiteStatus>>;

    /// Pause a pair; PAUSED pairs are never auto-selected. No-op when the
    /// pair is mid-transfer.
    async fn pause(&self, file_id: FileId, site_name: &str) -> Result<()>;

    /// Resume a paused pair back to NOT_AVAILABLE.
    async fn resume(&self, file_id: FileId, site_name: &str) -> Result<()>;

    /// Manual retry: clear failure bookkeeping and make the pair immediately
    /// eligible.
    async fn reset_status(&self, file_id: FileId, site_name: &str) -> Result<()>;

    /// Set dispatch priority for a pair.
    async fn set_priority(&self, file_id: FileId, site_name: &str, priority: i32) -> Result<()>;

    /// Reset every IN_PROGRESS pair back to NOT_AVAILABLE. Called once at
    /// engine startup, when no worker can still be alive for them.
    async fn recover_in_progress(&self) -> Result<u64>;

    /// Revalidation found the remote content missing or changed: downgrade
    /// AVAILABLE back to NOT_AVAILABLE.
    async fn downgrade_available(
        &self,
        file_id: FileId,
        site_name: &str,
        reason: &str,
    ) -> Result<()>;
}

/// SQLite-backed presence ledger.
pub struct SqlitePresenceLedger {
    pool: SqlitePool,
}

impl SqlitePresenceLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS representations (
                id TEXT PRIMARY KEY,
                folder TEXT NOT NULL,
                product TEXT NOT NULL,
                version INTEGER NOT NULL,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS representation_files (
                id TEXT PRIMARY KEY,
                representation_id TEXT NOT NULL REFERENCES representations(id),
                path TEXT NOT NULL,
                size INTEGER NOT NULL,
                hash TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS site_status (
                file_id TEXT NOT NULL REFERENCES representation_files(id),
                site_name TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'NOT_AVAILABLE',
                wanted INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                updated_at INTEGER NOT NULL,
                next_eligible_at INTEGER,
                awaiting_source INTEGER NOT NULL DEFAULT 0,
                remote_size INTEGER,
                remote_hash TEXT,
                priority INTEGER NOT NULL DEFAULT 50,
                PRIMARY KEY (file_id, site_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_site_status_scan
            ON site_status(site_name, state, wanted, priority DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_files_representation
            ON representation_files(representation_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn candidate_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TransferCandidate> {
        Ok(TransferCandidate {
            file_id: FileId::from_string(&row.get::<String, _>("id"))?,
            representation_id: RepresentationId::from_string(
                &row.get::<String, _>("representation_id"),
            )?,
            path: row.get("path"),
            size: row.get::<i64, _>("size") as u64,
            hash: row.get("hash"),
            retry_count: row.get::<i64, _>("retry_count") as u32,
            priority: row.get::<i64, _>("priority") as i32,
        })
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl PresenceLedger for SqlitePresenceLedger {
    async fn upsert_publish(
        &self,
        representation: &Representation,
        sites: &[SiteWant],
    ) -> Result<()> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO representations (id, folder, product, version, name, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(representation.id.as_str())
        .bind(&representation.folder)
        .bind(&representation.product)
        .bind(representation.version)
        .bind(&representation.name)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        for file in &representation.files {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO representation_files (id, representation_id, path, size, hash)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(file.id.as_str())
            .bind(representation.id.as_str())
            .bind(&file.path)
            .bind(file.size as i64)
            .bind(&file.hash)
            .execute(&mut *tx)
            .await?;

            for site in sites {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO site_status
                        (file_id, site_name, state, wanted, updated_at)
                    VALUES (?, ?, 'NOT_AVAILABLE', ?, ?)
                    "#,
                )
                .bind(file.id.as_str())
                .bind(&site.site_name)
                .bind(site.wanted as i64)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        if inserted > 0 {
            info!(
                representation_id = %representation.id,
                folder = %representation.folder,
                product = %representation.product,
                version = representation.version,
                file_count = representation.files.len(),
                "Registered published representation"
            );
        } else {
            debug!(
                representation_id = %representation.id,
                "Representation already registered, upsert ignored"
            );
        }

        Ok(())
    }

    async fn mark_present(&self, file_id: FileId, site_name: &str, stat: &FileStat) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            UPDATE site_status SET
                state = 'AVAILABLE',
                retry_count = 0,
                last_error = NULL,
                next_eligible_at = NULL,
                awaiting_source = 0,
                remote_size = ?,
                remote_hash = ?,
                updated_at = ?
            WHERE file_id = ? AND site_name = ?
            "#,
        )
        .bind(stat.size as i64)
        .bind(&stat.hash)
        .bind(now)
        .bind(file_id.as_str())
        .bind(site_name)
        .execute(&self.pool)
        .await?;

        // A source exists now; revive pairs that were parked on it.
        sqlx::query(
            r#"
            UPDATE site_status SET
                state = 'NOT_AVAILABLE',
                awaiting_source = 0,
                last_error = NULL,
                next_eligible_at = NULL,
                updated_at = ?
            WHERE file_id = ? AND awaiting_source = 1 AND state = 'FAILED'
            "#,
        )
        .bind(now)
        .bind(file_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_wanted(&self, file_id: FileId, site_name: &str, wanted: bool) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT INTO site_status (file_id, site_name, state, wanted, updated_at)
            VALUES (?, ?, 'NOT_AVAILABLE', ?, ?)
            ON CONFLICT (file_id, site_name)
            DO UPDATE SET wanted = excluded.wanted, updated_at = excluded.updated_at
            "#,
        )
        .bind(file_id.as_str())
        .bind(site_name)
        .bind(wanted as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(%file_id, site = site_name, wanted, "Toggled wanted state");
        Ok(())
    }

    async fn claim(&self, file_id: FileId, site_name: &str, now: i64) -> Result<bool> {
        let claimed = sqlx::query(
            r#"
            UPDATE site_status SET
                state = 'IN_PROGRESS',
                updated_at = ?
            WHERE file_id = ? AND site_name = ?
              AND wanted = 1 AND awaiting_source = 0
              AND (
                  state = 'NOT_AVAILABLE'
                  OR (state = 'FAILED'
                      AND next_eligible_at IS NOT NULL
                      AND next_eligible_at <= ?)
              )
            "#,
        )
        .bind(now)
        .bind(file_id.as_str())
        .bind(site_name)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if claimed {
            debug!(%file_id, site = site_name, "Claimed pair for transfer");
        }
        Ok(claimed)
    }

    async fn record_success(
        &self,
        file_id: FileId,
        site_name: &str,
        stat: &FileStat,
    ) -> Result<()> {
        let now = now_ts();
        let updated = sqlx::query(
            r#"
            UPDATE site_status SET
                state = 'AVAILABLE',
                retry_count = 0,
                last_error = NULL,
                next_eligible_at = NULL,
                awaiting_source = 0,
                remote_size = ?,
                remote_hash = ?,
                updated_at = ?
            WHERE file_id = ? AND site_name = ? AND state = 'IN_PROGRESS'
            "#,
        )
        .bind(stat.size as i64)
        .bind(&stat.hash)
        .bind(now)
        .bind(file_id.as_str())
        .bind(site_name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            warn!(%file_id, site = site_name, "Success recorded for a pair not in progress");
        }

        // Revive pairs waiting for a source of this file.
        sqlx::query(
            r#"
            UPDATE site_status SET
                state = 'NOT_AVAILABLE',
                awaiting_source = 0,
                last_error = NULL,
                next_eligible_at = NULL,
                updated_at = ?
            WHERE file_id = ? AND awaiting_source = 1 AND state = 'FAILED'
            "#,
        )
        .bind(now)
        .bind(file_id.as_str())
        .execute(&self.pool)
        .await?;

        info!(%file_id, site = site_name, size = stat.size, "File available at site");
        Ok(())
    }

    async fn record_failure(
        &self,
        file_id: FileId,
        site_name: &str,
        error: &SyncError,
        policy: &BackoffPolicy,
    ) -> Result<()> {
        let now = now_ts();
        let message = error.to_string();

        // Source-dependent failures are parked, not timed: they become
        // eligible again only when a site records the file as AVAILABLE.
        let awaiting_source = matches!(
            error,
            SyncError::NoSourceAvailable | SyncError::NotFound { .. }
        );

        if awaiting_source {
            sqlx::query(
                r#"
                UPDATE site_status SET
                    state = 'FAILED',
                    last_error = ?,
                    next_eligible_at = NULL,
                    awaiting_source = 1,
                    updated_at = ?
                WHERE file_id = ? AND site_name = ?
                "#,
            )
            .bind(&message)
            .bind(now)
            .bind(file_id.as_str())
            .bind(site_name)
            .execute(&self.pool)
            .await?;

            warn!(%file_id, site = site_name, error = %message, "Pair parked until a source appears");
            return Ok(());
        }

        // Only the claiming worker mutates an IN_PROGRESS row, so the
        // read-then-update below is not racy.
        let retry_count: i64 = sqlx::query_scalar(
            "SELECT retry_count FROM site_status WHERE file_id = ? AND site_name = ?",
        )
        .bind(file_id.as_str())
        .bind(site_name)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(0);

        let new_retry_count = retry_count as u32 + 1;
        let next_eligible_at = if policy.is_exhausted(new_retry_count) {
            None
        } else {
            let delay_ms = policy.delay_ms(new_retry_count, error.retry_after_secs());
            Some(now + (delay_ms / 1_000).max(1) as i64)
        };

        sqlx::query(
            r#"
            UPDATE site_status SET
                state = 'FAILED',
                retry_count = ?,
                last_error = ?,
                next_eligible_at = ?,
                updated_at = ?
            WHERE file_id = ? AND site_name = ?
            "#,
        )
        .bind(new_retry_count as i64)
        .bind(&message)
        .bind(next_eligible_at)
        .bind(now)
        .bind(file_id.as_str())
        .bind(site_name)
        .execute(&self.pool)
        .await?;

        if next_eligible_at.is_some() {
            warn!(
                %file_id,
                site = site_name,
                retry_count = new_retry_count,
                error = %message,
                "Transfer failed, will retry after backoff"
            );
        } else {
            warn!(
                %file_id,
                site = site_name,
                retry_count = new_retry_count,
                error = %message,
                "Transfer failed permanently, manual retry required"
            );
        }

        Ok(())
    }

    async fn record_cancel(&self, file_id: FileId, site_name: &str) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            UPDATE site_status SET
                state = 'NOT_AVAILABLE',
                updated_at = ?
            WHERE file_id = ? AND site_name = ? AND state = 'IN_PROGRESS'
            "#,
        )
        .bind(now)
        .bind(file_id.as_str())
        .bind(site_name)
        .execute(&self.pool)
        .await?;

        info!(%file_id, site = site_name, "Transfer cancelled, pair reset");
        Ok(())
    }

    async fn candidates(&self, site_name: &str, now: i64) -> Result<Vec<TransferCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT f.id, f.representation_id, f.path, f.size, f.hash,
                   s.retry_count, s.priority
            FROM site_status s
            JOIN representation_files f ON f.id = s.file_id
            WHERE s.site_name = ? AND s.wanted = 1 AND s.awaiting_source = 0
              AND (
                  s.state = 'NOT_AVAILABLE'
                  OR (s.state = 'FAILED'
                      AND s.next_eligible_at IS NOT NULL
                      AND s.next_eligible_at <= ?)
              )
            ORDER BY s.priority DESC, f.path ASC
            "#,
        )
        .bind(site_name)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::candidate_from_row).collect()
    }

    async fn sites_holding(&self, file_id: FileId) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            r#"
            SELECT site_name FROM site_status
            WHERE file_id = ? AND state = 'AVAILABLE'
            ORDER BY site_name ASC
            "#,
        )
        .bind(file_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn available_files(&self, site_name: &str) -> Result<Vec<TransferCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT f.id, f.representation_id, f.path, f.size, f.hash,
                   s.retry_count, s.priority
            FROM site_status s
            JOIN representation_files f ON f.id = s.file_id
            WHERE s.site_name = ? AND s.state = 'AVAILABLE'
            ORDER BY f.path ASC
            "#,
        )
        .bind(site_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::candidate_from_row).collect()
    }

    async fn status(&self, file_id: FileId, site_name: &str) -> Result<Option<SiteStatus>> {
        let row = sqlx::query(
            r#"
            SELECT file_id, site_name, state, wanted, retry_count, last_error,
                   updated_at, next_eligible_at, awaiting_source,
                   remote_size, remote_hash, priority
            FROM site_status
            WHERE file_id = ? AND site_name = ?
            "#,
        )
        .bind(file_id.as_str())
        .bind(site_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(SiteStatus {
                file_id: FileId::from_string(&row.get::<String, _>("file_id"))?,
                site_name: row.get("site_name"),
                state: row.get::<String, _>("state").parse::<SyncState>()?,
                wanted: row.get::<i64, _>("wanted") != 0,
                retry_count: row.get::<i64, _>("retry_count") as u32,
                last_error: row.get("last_error"),
                updated_at: row.get("updated_at"),
                next_eligible_at: row.get("next_eligible_at"),
                awaiting_source: row.get::<i64, _>("awaiting_source") != 0,
                remote_size: row.get("remote_size"),
                remote_hash: row.get("remote_hash"),
                priority: row.get::<i64, _>("priority") as i32,
            })),
            None => Ok(None),
        }
    }

    async fn pause(&self, file_id: FileId, site_name: &str) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            UPDATE site_status SET state = 'PAUSED', updated_at = ?
            WHERE file_id = ? AND site_name = ?
              AND state IN ('NOT_AVAILABLE', 'FAILED')
            "#,
        )
        .bind(now)
        .bind(file_id.as_str())
        .bind(site_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resume(&self, file_id: FileId, site_name: &str) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            UPDATE site_status SET state = 'NOT_AVAILABLE', updated_at = ?
            WHERE file_id = ? AND site_name = ? AND state = 'PAUSED'
            "#,
        )
        .bind(now)
        .bind(file_id.as_str())
        .bind(site_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_status(&self, file_id: FileId, site_name: &str) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            UPDATE site_status SET
                state = 'NOT_AVAILABLE',
                retry_count = 0,
                last_error = NULL,
                next_eligible_at = NULL,
                awaiting_source = 0,
                updated_at = ?
            WHERE file_id = ? AND site_name = ? AND state != 'IN_PROGRESS'
            "#,
        )
        .bind(now)
        .bind(file_id.as_str())
        .bind(site_name)
        .execute(&self.pool)
        .await?;

        info!(%file_id, site = site_name, "Pair reset for manual retry");
        Ok(())
    }

    async fn set_priority(&self, file_id: FileId, site_name: &str, priority: i32) -> Result<()> {
        sqlx::query(
            "UPDATE site_status SET priority = ? WHERE file_id = ? AND site_name = ?",
        )
        .bind(priority as i64)
        .bind(file_id.as_str())
        .bind(site_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recover_in_progress(&self) -> Result<u64> {
        let now = now_ts();
        let recovered = sqlx::query(
            r#"
            UPDATE site_status SET state = 'NOT_AVAILABLE', updated_at = ?
            WHERE state = 'IN_PROGRESS'
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if recovered > 0 {
            info!(recovered, "Reset stranded in-progress pairs");
        }
        Ok(recovered)
    }

    async fn downgrade_available(
        &self,
        file_id: FileId,
        site_name: &str,
        reason: &str,
    ) -> Result<()> {
        let now = now_ts();
        let updated = sqlx::query(
            r#"
            UPDATE site_status SET
                state = 'NOT_AVAILABLE',
                remote_size = NULL,
                remote_hash = NULL,
                last_error = ?,
                updated_at = ?
            WHERE file_id = ? AND site_name = ? AND state = 'AVAILABLE'
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(file_id.as_str())
        .bind(site_name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            warn!(%file_id, site = site_name, reason, "Remote content invalid, pair downgraded");
        }
        Ok(())
    }
}
