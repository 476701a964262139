//! Workspace placeholder crate.
//!
//! Re-exports the individual workspace crates so host applications can depend
//! on `sitesync-workspace` and reach the engine, the adapter contract and the
//! bundled local-drive adapter without wiring each crate individually.

pub use core_sitesync as core;
pub use provider_local_drive as local_drive;
pub use provider_traits as traits;
