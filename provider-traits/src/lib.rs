//! Protocol adapter contract for site sync storage backends.
//!
//! Every sync endpoint (a studio file server, an artist workstation, a cloud
//! drive account) is driven through the [`StorageProvider`] trait. The queue
//! engine never talks to a concrete backend directly; it resolves a provider
//! through the site registry and uses this uniform surface for existence
//! checks, stat/hash retrieval and transfers.
//!
//! Adapter implementations must:
//! - write transfers to a temporary location and atomically promote the file
//!   to its final path on success, so a crash mid-transfer never leaves a
//!   destination that looks complete;
//! - translate vendor transient errors (throttling, quota, expired token)
//!   into [`ProviderError::Retryable`] so the engine can apply backoff
//!   instead of failing the pair permanently.

pub mod error;
pub mod provider;

pub use error::{ProviderError, Result};
pub use provider::{FileStat, StorageProvider, TransferCapabilities};
