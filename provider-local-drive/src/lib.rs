//! Local filesystem storage provider.
//!
//! Implements the `StorageProvider` contract over a directory root. Used for
//! studio file servers and artist workstations, and as the source/destination
//! end of every cloud transfer (files are always spooled through local disk).
//!
//! Transfers are staged as `<name>.part-<uuid>` next to the destination and
//! promoted with an atomic rename, so an interrupted copy is never mistakable
//! for a completed one.

pub mod drive;
pub mod error;

pub use drive::LocalDriveProvider;
pub use error::LocalDriveError;
