//! Site configuration catalog
//!
//! The catalog is one JSON object mapping site names to their configuration.
//! Inside a site entry a few keys are reserved (`name`, `vars`, `api_url`,
//! `api_endpoint_prefix`, `api_header`); every list-valued key declares an
//! action plan. Plans are validated here, once, when the catalog loads.

use anyhow::Context as _;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::RuntimeConfig;
use super::error::{ActionError, ActionResult, ConfigError, ConfigResult};
use super::host::Services;
use super::site::Site;
use crate::interpreter::{Plan, build_plan};

const RESERVED: &[&str] = &["name", "vars", "api_url", "api_endpoint_prefix", "api_header"];

/// Validated configuration of one site
#[derive(Debug, Clone, Default)]
pub struct SiteConfig {
    name: String,
    title: Option<String>,
    vars: Map<String, Value>,
    api_url: Option<String>,
    api_endpoint_prefix: Option<String>,
    api_headers: Vec<String>,
    plans: BTreeMap<String, Arc<Plan>>,
}

impl SiteConfig {
    /// Validate a site entry.
    pub fn from_value(name: &str, value: &Value) -> ConfigResult<Self> {
        let entry = value.as_object().ok_or_else(|| ConfigError::InvalidSite {
            site: name.to_string(),
            reason: "site entry must be an object".into(),
        })?;

        let mut config = SiteConfig {
            name: name.to_string(),
            ..Default::default()
        };
        for (key, field) in entry {
            match key.as_str() {
                "name" => config.title = Some(site_string(name, key, field)?),
                "vars" => {
                    config.vars = field
                        .as_object()
                        .cloned()
                        .ok_or_else(|| invalid(name, "`vars` must be an object"))?;
                }
                "api_url" => config.api_url = Some(site_string(name, key, field)?),
                "api_endpoint_prefix" => {
                    config.api_endpoint_prefix = Some(site_string(name, key, field)?)
                }
                "api_header" => {
                    config.api_headers = match field {
                        Value::String(header) => vec![header.clone()],
                        Value::Array(headers) => headers
                            .iter()
                            .map(|header| {
                                header
                                    .as_str()
                                    .map(str::to_string)
                                    .ok_or_else(|| invalid(name, "`api_header` must hold strings"))
                            })
                            .collect::<ConfigResult<_>>()?,
                        _ => return Err(invalid(name, "`api_header` must be a string")),
                    };
                }
                action => match field {
                    Value::Array(steps) => {
                        let plan =
                            build_plan(action, steps).map_err(|source| ConfigError::Plan {
                                site: name.to_string(),
                                action: action.to_string(),
                                source,
                            })?;
                        config.plans.insert(action.to_string(), Arc::new(plan));
                    }
                    _ => debug!(site = name, key = action, "ignoring non-plan key"),
                },
            }
        }
        Ok(config)
    }

    /// Catalog key of the site.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display name, falling back to the catalog key.
    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }

    /// Initial persistent variables.
    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    /// Explicit API base URL.
    pub fn api_url(&self) -> Option<&str> {
        self.api_url.as_deref()
    }

    /// API path prefix or URL.
    pub fn api_endpoint_prefix(&self) -> Option<&str> {
        self.api_endpoint_prefix.as_deref()
    }

    /// Extra API headers (`"Name: value"`).
    pub fn api_headers(&self) -> &[String] {
        &self.api_headers
    }

    /// Plan declared for `action`, if it has at least one step.
    pub fn plan(&self, action: &str) -> Option<Arc<Plan>> {
        self.plans.get(action).filter(|plan| !plan.is_empty()).cloned()
    }

    /// Whether `action` has a non-empty plan.
    pub fn has_plan(&self, action: &str) -> bool {
        self.plan(action).is_some()
    }

    /// Names of every declared plan.
    pub fn plan_names(&self) -> impl Iterator<Item = &str> {
        self.plans.keys().map(String::as_str)
    }

    /// Whether detecting this site needs an API request.
    pub fn compatibility_uses_api(&self) -> bool {
        self.plans
            .get("compatibility")
            .is_some_and(|plan| plan.uses_api())
    }
}

fn invalid(site: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidSite {
        site: site.to_string(),
        reason: reason.to_string(),
    }
}

fn site_string(site: &str, key: &str, value: &Value) -> ConfigResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(site, &format!("`{key}` must be a string")))
}

/// All known site configurations
#[derive(Debug, Clone, Default)]
pub struct SiteCatalog {
    sites: BTreeMap<String, Arc<SiteConfig>>,
}

impl SiteCatalog {
    /// Parse catalog JSON text.
    pub fn from_json_str(text: &str) -> ConfigResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// Build a catalog from a parsed JSON object.
    pub fn from_value(value: &Value) -> ConfigResult<Self> {
        let entries = value.as_object().ok_or_else(|| ConfigError::InvalidSite {
            site: String::from("<catalog>"),
            reason: "catalog must be an object".into(),
        })?;
        let sites = entries
            .iter()
            .map(|(name, entry)| Ok((name.clone(), Arc::new(SiteConfig::from_value(name, entry)?))))
            .collect::<ConfigResult<BTreeMap<_, _>>>()?;
        Ok(Self { sites })
    }

    /// Load a catalog file from disk.
    pub fn load_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading site catalog {}", path.display()))?;
        let catalog = Self::from_json_str(&text)
            .with_context(|| format!("parsing site catalog {}", path.display()))?;
        info!(path = %path.display(), sites = catalog.len(), "loaded site catalog");
        Ok(catalog)
    }

    /// Configuration of `name`.
    pub fn get(&self, name: &str) -> Option<Arc<SiteConfig>> {
        self.sites.get(name).cloned()
    }

    /// Site names in detection order: address-only checks first, sites whose
    /// compatibility check calls the API last.
    pub fn detection_order(&self) -> Vec<Arc<SiteConfig>> {
        let (local, remote): (Vec<_>, Vec<_>) = self
            .sites
            .values()
            .cloned()
            .partition(|config| !config.compatibility_uses_api());
        local.into_iter().chain(remote).collect()
    }

    /// Number of sites.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Iterate over all sites by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<SiteConfig>)> {
        self.sites.iter().map(|(name, config)| (name.as_str(), config))
    }

    /// Open `address` with the site called `name`.
    pub async fn open(
        &self,
        name: &str,
        address: &str,
        services: &Services,
        runtime: &RuntimeConfig,
    ) -> ActionResult<Site> {
        let config = self
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSite(name.to_string()))?;
        Site::open(config, address, services.clone(), runtime.clone()).await
    }

    /// Open the first site whose `compatibility` plan accepts `address`.
    pub async fn detect(
        &self,
        address: &str,
        services: &Services,
        runtime: &RuntimeConfig,
    ) -> ConfigResult<Option<Site>> {
        for config in self.detection_order() {
            if !config.has_plan("compatibility") {
                continue;
            }
            let site = match Site::open(config.clone(), address, services.clone(), runtime.clone())
                .await
            {
                Ok(site) => site,
                Err(ActionError::Config(err)) => return Err(err),
                Err(err) => {
                    debug!(site = config.name(), "open failed during detection: {err}");
                    continue;
                }
            };
            if site.check_compatibility().await {
                info!(site = config.name(), %address, "compatible site detected");
                return Ok(Some(site));
            }
        }
        Ok(None)
    }
}
