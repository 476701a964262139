//! Per-site sync state machine.
//!
//! One `SiteStatus` exists per (file, site) pair for every site that either
//! wants the file or has historically held it. Rows are never deleted when
//! configuration changes, only flipped to unwanted.
//!
//! ## State machine
//!
//! ```text
//! NOT_AVAILABLE → IN_PROGRESS → AVAILABLE
//!       ↑              ↓            ↓
//!       └───────────  FAILED   (revalidation miss)
//!       ↕ (pause/resume)
//!    PAUSED
//! ```
//!
//! `FAILED → NOT_AVAILABLE` happens when the backoff deadline elapses or on
//! manual retry. `AVAILABLE → NOT_AVAILABLE` happens when revalidation finds
//! the remote content missing or changed.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::model::FileId;
use crate::{Result, SyncError};

/// Sync state of one file at one site.
///
/// The string tokens are an external contract rendered verbatim by UI
/// consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// Wanted but absent; no attempt in flight.
    NotAvailable,
    /// A transfer job is dispatched for this pair.
    InProgress,
    /// Present and hash-verified.
    Available,
    /// Last attempt failed, or attempts are exhausted.
    Failed,
    /// Site disabled or user-paused; never auto-selected by the scan loop.
    Paused,
}

impl SyncState {
    /// Wire/database token.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::NotAvailable => "NOT_AVAILABLE",
            SyncState::InProgress => "IN_PROGRESS",
            SyncState::Available => "AVAILABLE",
            SyncState::Failed => "FAILED",
            SyncState::Paused => "PAUSED",
        }
    }

    /// Whether the scan loop may turn this pair into a transfer job
    /// (backoff eligibility is checked separately).
    pub fn is_schedulable(&self) -> bool {
        matches!(self, SyncState::NotAvailable | SyncState::Failed)
    }

    /// Valid transitions, used to guard manual ledger operations.
    pub fn can_transition(&self, to: SyncState) -> bool {
        matches!(
            (self, to),
            (SyncState::NotAvailable, SyncState::InProgress)
                | (SyncState::NotAvailable, SyncState::Paused)
                | (SyncState::InProgress, SyncState::Available)
                | (SyncState::InProgress, SyncState::Failed)
                | (SyncState::InProgress, SyncState::NotAvailable)
                | (SyncState::Failed, SyncState::InProgress)
                | (SyncState::Failed, SyncState::NotAvailable)
                | (SyncState::Failed, SyncState::Paused)
                | (SyncState::Available, SyncState::NotAvailable)
                | (SyncState::Paused, SyncState::NotAvailable)
        )
    }
}

impl FromStr for SyncState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NOT_AVAILABLE" => Ok(SyncState::NotAvailable),
            "IN_PROGRESS" => Ok(SyncState::InProgress),
            "AVAILABLE" => Ok(SyncState::Available),
            "FAILED" => Ok(SyncState::Failed),
            "PAUSED" => Ok(SyncState::Paused),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Full status record for one (file, site) pair as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteStatus {
    pub file_id: FileId,
    pub site_name: String,
    pub state: SyncState,
    /// Desired-state flag; toggled by configuration, never by transfers.
    pub wanted: bool,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Unix seconds of the last attempt/transition.
    pub updated_at: i64,
    /// When a FAILED pair becomes schedulable again. `None` on a FAILED pair
    /// means manual intervention (or a ledger change) is required.
    pub next_eligible_at: Option<i64>,
    /// Set when the pair failed because no site held the file; cleared when a
    /// source appears.
    pub awaiting_source: bool,
    /// Last verified size/hash at this site.
    pub remote_size: Option<i64>,
    pub remote_hash: Option<String>,
    pub priority: i32,
}

/// Aggregate member-file states into one representation-level state.
///
/// Mirrors the server-side roll-up rendered in sync overview tables: fully
/// absent and fully present dominate, then failures, activity, pauses.
pub fn aggregate_status(states: &[SyncState]) -> SyncState {
    if states.is_empty() || states.iter().all(|s| *s == SyncState::NotAvailable) {
        SyncState::NotAvailable
    } else if states.iter().all(|s| *s == SyncState::Available) {
        SyncState::Available
    } else if states.iter().any(|s| *s == SyncState::Failed) {
        SyncState::Failed
    } else if states.iter().any(|s| *s == SyncState::InProgress) {
        SyncState::InProgress
    } else if states.iter().any(|s| *s == SyncState::Paused) {
        SyncState::Paused
    } else {
        SyncState::NotAvailable
    }
}
