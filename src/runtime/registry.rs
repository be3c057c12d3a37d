//! Domain control-instance registry
//!
//! Sub-actions (typically authentication) run on one shared "control" site
//! per domain, so concurrent views of the same platform queue behind a single
//! login instead of each starting their own. The registry only holds weak
//! references; views keep their control instance alive.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use super::site::{Site, WeakSite};

/// Map from domain to its live control instance
#[derive(Default)]
pub struct DomainRegistry {
    sites: Mutex<HashMap<String, WeakSite>>,
}

impl DomainRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live control instance for `domain`, building one with
    /// `create` when none exists. Dead entries are pruned first.
    pub fn get_or_create<F>(&self, domain: &str, create: F) -> Site
    where
        F: FnOnce() -> Site,
    {
        let mut sites = self.sites.lock();
        sites.retain(|_, site| site.is_alive());
        if let Some(site) = sites.get(domain).and_then(WeakSite::upgrade) {
            return site;
        }
        let site = create();
        debug!(domain, "created control instance");
        sites.insert(domain.to_string(), site.downgrade());
        site
    }

    /// Live control instance for `domain`, if any.
    pub fn get(&self, domain: &str) -> Option<Site> {
        self.sites.lock().get(domain).and_then(WeakSite::upgrade)
    }

    /// Number of live control instances.
    pub fn live_count(&self) -> usize {
        let mut sites = self.sites.lock();
        sites.retain(|_, site| site.is_alive());
        sites.len()
    }
}

impl std::fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainRegistry")
            .field("domains", &self.sites.lock().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}
