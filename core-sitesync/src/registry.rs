//! Per-project site registry.
//!
//! Maps logical site names to storage providers plus per-site configuration.
//! A registry is built once per project context and is immutable for its
//! lifetime; changing a site's configuration means building a fresh registry,
//! never mutating providers while jobs are in flight.

use std::collections::HashMap;
use std::sync::Arc;

use provider_traits::{StorageProvider, TransferCapabilities};
use serde::{Deserialize, Serialize};

use crate::{Result, SyncError};

/// Role a site plays for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteRole {
    /// The producer side: where publishes land first (studio server or the
    /// user's own machine).
    Active,
    /// A consumer endpoint the engine pushes to / pulls from.
    Remote,
}

/// Per-site configuration, fixed at registry build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub name: String,
    pub role: SiteRole,
    /// Disabled sites keep their ledger rows but are skipped by the scan
    /// loop and reported as PAUSED-equivalent by operators.
    pub enabled: bool,
    /// Dispatch ordering weight across sites; higher first.
    pub priority: i32,
}

impl SiteConfig {
    pub fn new(name: impl Into<String>, role: SiteRole) -> Self {
        Self {
            name: name.into(),
            role,
            enabled: true,
            priority: 50,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug)]
struct SiteEntry {
    config: SiteConfig,
    provider: Arc<dyn StorageProvider>,
}

/// Builder for [`SiteRegistry`]; validates the site set before freezing it.
pub struct SiteRegistryBuilder {
    project: String,
    sites: Vec<SiteEntry>,
}

impl SiteRegistryBuilder {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            sites: Vec::new(),
        }
    }

    pub fn site(mut self, config: SiteConfig, provider: Arc<dyn StorageProvider>) -> Self {
        self.sites.push(SiteEntry { config, provider });
        self
    }

    /// Freeze the registry.
    ///
    /// # Errors
    ///
    /// Fails when a site name is duplicated or when there is not exactly one
    /// Active site.
    pub fn build(self) -> Result<SiteRegistry> {
        let mut by_name = HashMap::new();
        for (index, entry) in self.sites.iter().enumerate() {
            if by_name.insert(entry.config.name.clone(), index).is_some() {
                return Err(SyncError::Configuration(format!(
                    "duplicate site name: {}",
                    entry.config.name
                )));
            }
        }

        let active_count = self
            .sites
            .iter()
            .filter(|e| e.config.role == SiteRole::Active)
            .count();
        if active_count != 1 {
            return Err(SyncError::Configuration(format!(
                "project {} must have exactly one active site, found {}",
                self.project, active_count
            )));
        }

        Ok(SiteRegistry {
            project: self.project,
            sites: self.sites,
            by_name,
        })
    }
}

/// Immutable mapping of site names to providers for one project.
#[derive(Debug)]
pub struct SiteRegistry {
    project: String,
    sites: Vec<SiteEntry>,
    by_name: HashMap<String, usize>,
}

impl SiteRegistry {
    pub fn builder(project: impl Into<String>) -> SiteRegistryBuilder {
        SiteRegistryBuilder::new(project)
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Resolve a site name to its provider.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownSite`] when the site is not configured
    /// for this project.
    pub fn resolve(&self, site_name: &str) -> Result<Arc<dyn StorageProvider>> {
        self.entry(site_name)
            .map(|entry| Arc::clone(&entry.provider))
    }

    /// Site configuration lookup.
    pub fn site_config(&self, site_name: &str) -> Result<&SiteConfig> {
        self.entry(site_name).map(|entry| &entry.config)
    }

    /// Provider capabilities for a site.
    pub fn capabilities(&self, site_name: &str) -> Result<TransferCapabilities> {
        self.entry(site_name)
            .map(|entry| entry.provider.capabilities())
    }

    /// Site names with the given role, ordered by priority then insertion.
    pub fn list_sites(&self, role: SiteRole) -> Vec<&str> {
        let mut sites: Vec<&SiteEntry> = self
            .sites
            .iter()
            .filter(|e| e.config.role == role)
            .collect();
        sites.sort_by_key(|e| std::cmp::Reverse(e.config.priority));
        sites.iter().map(|e| e.config.name.as_str()).collect()
    }

    /// All enabled site names, active site first, then remotes by priority.
    pub fn enabled_sites(&self) -> Vec<&str> {
        let mut names = vec![self.active_site()];
        names.extend(
            self.list_sites(SiteRole::Remote)
                .into_iter()
                .filter(|name| self.entry(name).map(|e| e.config.enabled).unwrap_or(false)),
        );
        names
    }

    /// The single Active site for this project.
    pub fn active_site(&self) -> &str {
        // Exactly one Active site is guaranteed by the builder.
        self.sites
            .iter()
            .find(|e| e.config.role == SiteRole::Active)
            .map(|e| e.config.name.as_str())
            .unwrap_or_default()
    }

    /// Every configured site name, in insertion order.
    pub fn all_sites(&self) -> Vec<&str> {
        self.sites.iter().map(|e| e.config.name.as_str()).collect()
    }

    fn entry(&self, site_name: &str) -> Result<&SiteEntry> {
        self.by_name
            .get(site_name)
            .map(|&i| &self.sites[i])
            .ok_or_else(|| SyncError::UnknownSite {
                site: site_name.to_string(),
            })
    }
}
