//! Host collaborators injected into sites
//!
//! The interactive page display and the persistent settings store belong to
//! the embedding application. Sites reach them only through these traits.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use super::context::ContextHandle;
use super::registry::DomainRegistry;
use super::transport::{HttpTransport, Transport};

/// Settings key enabling per-step result logging.
pub const LOG_ACT_DEST: &str = "log.log_act_dest";

/// Displays interactive (authentication) pages on behalf of a context
pub trait PageHost: Send + Sync {
    /// Show `url`. The host later calls [`ActionContext::set_value`] on
    /// `context` with an [`AuthPageResult`].
    ///
    /// [`ActionContext::set_value`]: super::context::ActionContext::set_value
    fn show_page(&self, url: &str, context: ContextHandle);
}

/// Page host for headless use; pages are never shown
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPageHost;

impl PageHost for NoPageHost {
    fn show_page(&self, url: &str, context: ContextHandle) {
        warn!(
            %url,
            action = context.name(),
            context = %context.id(),
            "no page host available; context stays suspended"
        );
    }
}

/// Result reported by the host once an interactive page is done
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPageResult {
    /// Final page URL
    pub url: String,
    /// Whether the page reached its success state
    #[serde(rename = "ok")]
    pub success: bool,
    /// Extracted page text
    pub text: String,
}

impl AuthPageResult {
    /// Stash form passed to `set_value`.
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Persistent key/value settings
pub trait Settings: Send + Sync {
    /// Read a setting.
    fn get(&self, key: &str) -> Option<Value>;
    /// Write a setting.
    fn set(&self, key: &str, value: Value);
}

/// In-memory settings store
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<String, Value>>,
}

impl MemorySettings {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Settings for MemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.values.write().insert(key.to_string(), value);
    }
}

/// Collaborators shared by every site of one application
#[derive(Clone)]
pub struct Services {
    /// HTTP transport
    pub transport: Arc<dyn Transport>,
    /// Interactive page display
    pub pages: Arc<dyn PageHost>,
    /// Persistent settings
    pub settings: Arc<dyn Settings>,
    /// Domain control-instance registry
    pub registry: Arc<DomainRegistry>,
}

impl Services {
    /// Services around `transport` with headless defaults for the rest.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pages: Arc::new(NoPageHost),
            settings: Arc::new(MemorySettings::new()),
            registry: Arc::new(DomainRegistry::new()),
        }
    }

    /// Replace the page host.
    pub fn with_pages(mut self, pages: Arc<dyn PageHost>) -> Self {
        self.pages = pages;
        self
    }

    /// Replace the settings store.
    pub fn with_settings(mut self, settings: Arc<dyn Settings>) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the domain registry.
    pub fn with_registry(mut self, registry: Arc<DomainRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Whether the settings ask for every step result to be logged.
    pub fn log_all(&self) -> bool {
        crate::interpreter::to_bool(self.settings.get(LOG_ACT_DEST).as_ref())
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new(Arc::new(HttpTransport::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_result_uses_ok_key() {
        let value = AuthPageResult {
            url: "https://site/done".into(),
            success: true,
            text: "welcome".into(),
        }
        .into_value();
        assert_eq!(
            value,
            json!({"url": "https://site/done", "ok": true, "text": "welcome"})
        );
    }

    #[test]
    fn log_flag_follows_settings() {
        let settings = Arc::new(MemorySettings::new());
        let services = Services::default().with_settings(settings.clone());
        assert!(!services.log_all());
        settings.set(LOG_ACT_DEST, json!(true));
        assert!(services.log_all());
    }
}
