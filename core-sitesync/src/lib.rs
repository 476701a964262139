//! # Site Sync Engine
//!
//! Synchronizes published production files between named sites (studio file
//! server, artist workstations, cloud drives) until every site holds the
//! files it is configured to want.
//!
//! ## Components
//!
//! - **Presence Ledger** (`ledger`): authoritative, durable record of which
//!   sites hold, want, or failed to receive every tracked file
//! - **Site Registry** (`registry`): immutable per-project mapping of site
//!   names to storage providers and roles
//! - **Queue Engine** (`engine`): reconciliation loop that turns
//!   "wanted but absent" ledger pairs into bounded, cancellable transfer jobs
//! - **Query Service** (`query`): read-only filtered/sorted/paginated views
//!   over the ledger for UI consumers
//! - **Backoff / Limiter** (`backoff`, `limiter`): retry policy and per-site
//!   pacing against rate-limited backends
//!
//! The engine is crash-safe by construction: state lives in the ledger, and a
//! restarted engine simply re-scans and resumes whatever was in flight.

pub mod backoff;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod limiter;
pub mod model;
pub mod query;
pub mod registry;
pub mod status;

pub use backoff::BackoffPolicy;
pub use engine::{EngineConfig, QueueEngine, TransferJob};
pub use error::{Result, SyncError};
pub use ledger::{
    PresenceLedger, SiteWant, SqlitePresenceLedger, TransferCandidate,
};
pub use limiter::RateLimiter;
pub use model::{FileId, FileInfo, Representation, RepresentationId};
pub use query::{
    FileRow, QueryService, RepresentationRow, SiteStatusModel, SiteSyncParams, SiteSyncSummary,
    SortField, StateQuery, UserSites,
};
pub use registry::{SiteConfig, SiteRegistry, SiteRegistryBuilder, SiteRole};
pub use status::{aggregate_status, SiteStatus, SyncState};
