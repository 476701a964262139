//! Core entities: representations and their member files.
//!
//! A `Representation` is one deliverable artifact-set from a published
//! version (e.g. all files of one exported format). Rows are created at
//! publish time and are immutable afterwards except for per-site sync status,
//! which lives in the ledger's `site_status` table.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, SyncError};

/// Unique identifier for a representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepresentationId(Uuid);

impl RepresentationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(
            Uuid::parse_str(s).map_err(|e| SyncError::InvalidId(e.to_string()))?,
        ))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RepresentationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RepresentationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Ok(Self(
            Uuid::parse_str(s).map_err(|e| SyncError::InvalidId(e.to_string()))?,
        ))
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One physical file belonging to a representation.
///
/// `hash` is the comparison key across sites: two sites hold the same file
/// iff their content hashes match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: FileId,
    /// Site-relative path (each provider resolves it under its own root).
    pub path: String,
    pub size: u64,
    pub hash: String,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, size: u64, hash: impl Into<String>) -> Self {
        Self {
            id: FileId::new(),
            path: path.into(),
            size,
            hash: hash.into(),
        }
    }

    /// File name without directories, as shown in per-file drill-downs.
    pub fn base_name(&self) -> &str {
        self.path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.path.as_str())
    }
}

/// One deliverable file-set from a published version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Representation {
    pub id: RepresentationId,
    /// Folder (shot/asset) the parent product lives under.
    pub folder: String,
    /// Product (subset) name, e.g. "renderMain".
    pub product: String,
    pub version: i64,
    /// Representation name, e.g. "exr" or "abc".
    pub name: String,
    pub files: Vec<FileInfo>,
}

impl Representation {
    pub fn new(
        folder: impl Into<String>,
        product: impl Into<String>,
        version: i64,
        name: impl Into<String>,
        files: Vec<FileInfo>,
    ) -> Self {
        Self {
            id: RepresentationId::new(),
            folder: folder.into(),
            product: product.into(),
            version,
            name: name.into(),
            files,
        }
    }

    /// Total byte size of all member files.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}
