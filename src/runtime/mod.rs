//! Site runtime
//!
//! Sites, their action contexts and the collaborators they run against:
//! transport, page host, settings and the per-domain control registry.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod catalog;
pub mod context;
pub mod error;
pub mod events;
pub mod host;
pub mod registry;
pub mod scheduler;
pub mod site;
pub mod sweeper;
pub mod transport;

pub use catalog::{SiteCatalog, SiteConfig};
pub use context::{ActionContext, ContextEvent, ContextHandle, ContextId, ContextStatus, ExecMode};
pub use error::{
    ActionError, ActionResult, ConfigError, ConfigResult, FailureReport, StepError, StepResult,
    TransportError, TransportResult,
};
pub use events::SiteEvent;
pub use host::{AuthPageResult, MemorySettings, NoPageHost, PageHost, Services, Settings};
pub use registry::DomainRegistry;
pub use scheduler::AdmissionCause;
pub use site::{RequestId, Site, SiteRole, WeakSite};
pub use transport::{HttpTransport, Transport};

/// Runtime tuning shared by all sites
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How often the timeout sweep runs
    pub sweep_interval: Duration,
    /// Age after which an active context is abandoned
    pub context_timeout: Duration,
    /// Delay between admission attempts of `call_when_ready`
    pub when_ready_backoff: Duration,
    /// Per-request transport timeout
    pub request_timeout: Duration,
    /// Entries per listing page
    pub page_size: u64,
    /// Log every step result
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(2),
            context_timeout: Duration::from_secs(600),
            when_ready_backoff: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(10),
            page_size: 20,
            debug: false,
        }
    }
}

impl RuntimeConfig {
    /// Services with an HTTP transport using [`request_timeout`](Self::request_timeout).
    pub fn services(&self) -> Services {
        Services::new(std::sync::Arc::new(HttpTransport::new(self.request_timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"page_size": 50, "debug": true}"#).unwrap();
        assert_eq!(config.page_size, 50);
        assert!(config.debug);
        assert_eq!(config.context_timeout, Duration::from_secs(600));
        assert_eq!(config.sweep_interval, Duration::from_secs(2));
    }
}
