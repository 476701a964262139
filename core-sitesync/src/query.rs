//! # Query Service
//!
//! Read-only, filtered and paginated views over the ledger for UI consumers
//! (sync overview tables and per-file drill-downs). Queries always compare
//! exactly two sites from the caller's point of view: the "local" site and
//! one "remote" site.
//!
//! Representation-level states are rolled up in memory from member-file rows
//! with [`aggregate_status`]; filters on those states therefore also apply
//! after the roll-up.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::model::{FileId, RepresentationId};
use crate::registry::{SiteRegistry, SiteRole};
use crate::status::{aggregate_status, SyncState};
use crate::Result;

/// The two sites a query compares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSites {
    pub local_site: String,
    pub remote_site: String,
}

impl UserSites {
    /// Default comparison pair for a project: the active site against the
    /// highest-priority enabled remote. `None` when no remote is enabled.
    pub fn from_registry(registry: &SiteRegistry) -> Option<Self> {
        let remote = registry
            .list_sites(SiteRole::Remote)
            .into_iter()
            .find(|site| {
                registry
                    .site_config(site)
                    .map(|c| c.enabled)
                    .unwrap_or(false)
            })?;
        Some(Self {
            local_site: registry.active_site().to_string(),
            remote_site: remote.to_string(),
        })
    }
}

/// Sort key for the overview table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    Folder,
    Product,
    Name,
    Version,
    FileCount,
    LocalState,
    RemoteState,
}

/// Filter, sort and pagination parameters for [`QueryService::state`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateQuery {
    /// Restrict to these representations; empty means all.
    #[serde(default)]
    pub representation_ids: Vec<RepresentationId>,
    /// Case-insensitive substring match on the folder name.
    #[serde(default)]
    pub folder_filter: Option<String>,
    /// Case-insensitive substring match on the product name.
    #[serde(default)]
    pub product_filter: Option<String>,
    /// Exact-match set on representation names; empty means all.
    #[serde(default)]
    pub name_filter: Vec<String>,
    /// Keep rows whose rolled-up local state is one of these.
    #[serde(default)]
    pub local_status_filter: Vec<SyncState>,
    /// Keep rows whose rolled-up remote state is one of these.
    #[serde(default)]
    pub remote_status_filter: Vec<SyncState>,
    pub sort_by: SortField,
    pub ascending: bool,
    /// 1-based page index.
    pub page: usize,
    pub page_length: usize,
}

impl Default for StateQuery {
    fn default() -> Self {
        Self {
            representation_ids: Vec::new(),
            folder_filter: None,
            product_filter: None,
            name_filter: Vec::new(),
            local_status_filter: Vec::new(),
            remote_status_filter: Vec::new(),
            sort_by: SortField::Folder,
            ascending: true,
            page: 1,
            page_length: 30,
        }
    }
}

/// Rolled-up status of one representation at one site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteStatusModel {
    pub state: SyncState,
    /// Highest member-file retry count.
    pub retry_count: u32,
    /// First member-file error message, when any file failed.
    pub last_error: Option<String>,
    /// Latest member-file transition, Unix seconds.
    pub updated_at: i64,
    /// Bytes verified present at the site.
    pub transferred_size: u64,
}

/// Per-file drill-down row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRow {
    pub file_id: FileId,
    pub base_name: String,
    pub path: String,
    pub size: u64,
    pub local_state: SyncState,
    pub remote_state: SyncState,
}

/// One overview-table row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepresentationRow {
    pub representation_id: RepresentationId,
    pub folder: String,
    pub product: String,
    pub version: i64,
    pub name: String,
    pub local_status: SiteStatusModel,
    pub remote_status: SiteStatusModel,
    pub files: Vec<FileRow>,
}

/// A page of overview rows plus the unpaginated match count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteSyncSummary {
    pub representations: Vec<RepresentationRow>,
    pub total_count: usize,
    pub page: usize,
    pub page_length: usize,
}

/// Values available for building filter dropdowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteSyncParams {
    /// Total tracked representations.
    pub count: i64,
    /// Distinct representation names.
    pub names: Vec<String>,
}

struct FileRecord {
    file_id: FileId,
    path: String,
    size: u64,
    local: SiteState,
    remote: SiteState,
}

#[derive(Clone)]
struct SiteState {
    state: SyncState,
    retry_count: u32,
    last_error: Option<String>,
    updated_at: i64,
    remote_size: Option<i64>,
}

impl Default for SiteState {
    fn default() -> Self {
        Self {
            state: SyncState::NotAvailable,
            retry_count: 0,
            last_error: None,
            updated_at: 0,
            remote_size: None,
        }
    }
}

/// Read-only view over the ledger store.
pub struct QueryService {
    pool: SqlitePool,
}

impl QueryService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Filter-dropdown values: representation count and distinct names.
    pub async fn params(&self) -> Result<SiteSyncParams> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM representations")
            .fetch_one(&self.pool)
            .await?;
        let names: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT name FROM representations ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(SiteSyncParams { count, names })
    }

    /// Per-file drill-down for one representation, ordered by path.
    #[tracing::instrument(skip(self))]
    pub async fn file_details(
        &self,
        representation_id: RepresentationId,
        sites: &UserSites,
    ) -> Result<Vec<FileRow>> {
        let rows = sqlx::query(
            r#"
            SELECT f.id AS file_id, f.path, f.size,
                   l.state AS local_state, m.state AS remote_state
            FROM representation_files f
            LEFT JOIN site_status l ON l.file_id = f.id AND l.site_name = ?
            LEFT JOIN site_status m ON m.file_id = f.id AND m.site_name = ?
            WHERE f.representation_id = ?
            ORDER BY f.path
            "#,
        )
        .bind(&sites.local_site)
        .bind(&sites.remote_site)
        .bind(representation_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let path: String = row.get("path");
                Ok(FileRow {
                    file_id: FileId::from_string(&row.get::<String, _>("file_id"))?,
                    base_name: base_name(&path).to_string(),
                    size: row.get::<i64, _>("size") as u64,
                    local_state: parse_state(row.get("local_state"))?,
                    remote_state: parse_state(row.get("remote_state"))?,
                    path,
                })
            })
            .collect()
    }

    /// Filtered, sorted, paginated sync overview for a local/remote site pair.
    #[tracing::instrument(skip(self, query))]
    pub async fn state(&self, sites: &UserSites, query: &StateQuery) -> Result<SiteSyncSummary> {
        let rows = sqlx::query(
            r#"
            SELECT r.id AS representation_id, r.folder, r.product, r.version, r.name,
                   f.id AS file_id, f.path, f.size,
                   l.state AS local_state, l.retry_count AS local_retries,
                   l.last_error AS local_error, l.updated_at AS local_updated,
                   l.remote_size AS local_size,
                   m.state AS remote_state, m.retry_count AS remote_retries,
                   m.last_error AS remote_error, m.updated_at AS remote_updated,
                   m.remote_size AS remote_size
            FROM representations r
            JOIN representation_files f ON f.representation_id = r.id
            LEFT JOIN site_status l ON l.file_id = f.id AND l.site_name = ?
            LEFT JOIN site_status m ON m.file_id = f.id AND m.site_name = ?
            ORDER BY r.id, f.path
            "#,
        )
        .bind(&sites.local_site)
        .bind(&sites.remote_site)
        .fetch_all(&self.pool)
        .await?;

        // Group file rows under their representation, preserving query order.
        let mut grouped: Vec<(RepresentationId, String, String, i64, String, Vec<FileRecord>)> =
            Vec::new();
        for row in &rows {
            let repre_id =
                RepresentationId::from_string(&row.get::<String, _>("representation_id"))?;
            let record = FileRecord {
                file_id: FileId::from_string(&row.get::<String, _>("file_id"))?,
                path: row.get("path"),
                size: row.get::<i64, _>("size") as u64,
                local: site_state(row, "local")?,
                remote: site_state(row, "remote")?,
            };
            let continues_last = grouped.last().map(|(id, ..)| *id == repre_id).unwrap_or(false);
            if continues_last {
                if let Some((_, _, _, _, _, files)) = grouped.last_mut() {
                    files.push(record);
                }
            } else {
                grouped.push((
                    repre_id,
                    row.get("folder"),
                    row.get("product"),
                    row.get("version"),
                    row.get("name"),
                    vec![record],
                ));
            }
        }

        let mut matched: Vec<RepresentationRow> = grouped
            .into_iter()
            .filter(|(id, folder, product, _, name, _)| {
                if !query.representation_ids.is_empty()
                    && !query.representation_ids.contains(id)
                {
                    return false;
                }
                if let Some(filter) = &query.folder_filter {
                    if !contains_ignore_case(folder, filter) {
                        return false;
                    }
                }
                if let Some(filter) = &query.product_filter {
                    if !contains_ignore_case(product, filter) {
                        return false;
                    }
                }
                if !query.name_filter.is_empty() && !query.name_filter.contains(name) {
                    return false;
                }
                true
            })
            .map(|(id, folder, product, version, name, files)| RepresentationRow {
                representation_id: id,
                folder,
                product,
                version,
                name,
                local_status: roll_up(files.iter().map(|f| &f.local)),
                remote_status: roll_up(files.iter().map(|f| &f.remote)),
                files: files
                    .into_iter()
                    .map(|f| FileRow {
                        file_id: f.file_id,
                        base_name: base_name(&f.path).to_string(),
                        path: f.path,
                        size: f.size,
                        local_state: f.local.state,
                        remote_state: f.remote.state,
                    })
                    .collect(),
            })
            .filter(|row| {
                (query.local_status_filter.is_empty()
                    || query.local_status_filter.contains(&row.local_status.state))
                    && (query.remote_status_filter.is_empty()
                        || query
                            .remote_status_filter
                            .contains(&row.remote_status.state))
            })
            .collect();

        matched.sort_by(|a, b| {
            let ordering = match query.sort_by {
                SortField::Folder => a.folder.cmp(&b.folder),
                SortField::Product => a.product.cmp(&b.product),
                SortField::Name => a.name.cmp(&b.name),
                SortField::Version => a.version.cmp(&b.version),
                SortField::FileCount => a.files.len().cmp(&b.files.len()),
                SortField::LocalState => a
                    .local_status
                    .state
                    .as_str()
                    .cmp(b.local_status.state.as_str()),
                SortField::RemoteState => a
                    .remote_status
                    .state
                    .as_str()
                    .cmp(b.remote_status.state.as_str()),
            };
            let ordering = if query.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            // Stable tiebreak so pagination never straddles duplicates.
            ordering.then_with(|| a.representation_id.cmp(&b.representation_id))
        });

        let total_count = matched.len();
        let page = query.page.max(1);
        let page_length = query.page_length.max(1);
        let representations = matched
            .into_iter()
            .skip((page - 1) * page_length)
            .take(page_length)
            .collect();

        Ok(SiteSyncSummary {
            representations,
            total_count,
            page,
            page_length,
        })
    }
}

fn parse_state(token: Option<String>) -> Result<SyncState> {
    match token {
        Some(token) => token.parse(),
        None => Ok(SyncState::NotAvailable),
    }
}

fn site_state(row: &sqlx::sqlite::SqliteRow, prefix: &str) -> Result<SiteState> {
    let state: Option<String> = row.get(format!("{}_state", prefix).as_str());
    match state {
        Some(token) => Ok(SiteState {
            state: token.parse()?,
            retry_count: row.get::<i64, _>(format!("{}_retries", prefix).as_str()) as u32,
            last_error: row.get(format!("{}_error", prefix).as_str()),
            updated_at: row.get(format!("{}_updated", prefix).as_str()),
            remote_size: row.get(format!("{}_size", prefix).as_str()),
        }),
        // Sites with no ledger row simply do not hold the file.
        None => Ok(SiteState::default()),
    }
}

fn roll_up<'a>(states: impl Iterator<Item = &'a SiteState>) -> SiteStatusModel {
    let states: Vec<&SiteState> = states.collect();
    let rolled = aggregate_status(&states.iter().map(|s| s.state).collect::<Vec<_>>());
    SiteStatusModel {
        state: rolled,
        retry_count: states.iter().map(|s| s.retry_count).max().unwrap_or(0),
        last_error: states.iter().find_map(|s| s.last_error.clone()),
        updated_at: states.iter().map(|s| s.updated_at).max().unwrap_or(0),
        transferred_size: states
            .iter()
            .filter(|s| s.state == SyncState::Available)
            .filter_map(|s| s.remote_size)
            .map(|size| size.max(0) as u64)
            .sum(),
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
