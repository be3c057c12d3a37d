//! Site connector instances
//!
//! A [`Site`] binds one [`SiteConfig`] to a user-supplied address and drives
//! action contexts for it. Async-mode contexts run on spawned tasks: every
//! suspension registers a pending reply and the task that completes it
//! re-enters the runner at the context's cursor. Wait-mode contexts are driven
//! inline by the caller.
//!
//! Site state sits behind a `parking_lot::Mutex` that is never held across an
//! `.await` or while calling collaborators. Lock order is site, then context.

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::RuntimeConfig;
use super::catalog::SiteConfig;
use super::context::{ActionContext, ContextHandle, ContextStatus, ExecMode};
use super::error::{ActionError, ActionResult, ConfigError, FailureReport, StepError, StepResult};
use super::events::{self, SiteEvent};
use super::host::Services;
use super::sweeper;
use super::transport::fetch;
use crate::interpreter::{
    Flow, PlanHost, Stash, StepFailure, Suspension, VARS_KEY, build_plan_value, resume, run,
    to_bool, to_text,
};

const EVENT_CAPACITY: usize = 256;

/// Identifier of one in-flight suspension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a site serves a view or is its domain's control instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteRole {
    /// Per-view instance
    View,
    /// Shared per-domain instance running sub-actions
    Control,
}

/// Shared handle to a site connector
#[derive(Clone)]
pub struct Site {
    inner: Arc<SiteInner>,
}

/// Non-owning site handle
#[derive(Clone)]
pub struct WeakSite(Weak<SiteInner>);

impl WeakSite {
    /// Upgrade to a strong handle if the site is alive.
    pub fn upgrade(&self) -> Option<Site> {
        self.0.upgrade().map(|inner| Site { inner })
    }

    /// Whether the site is still alive.
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

struct SiteInner {
    role: SiteRole,
    config: Arc<SiteConfig>,
    address: Url,
    services: Services,
    runtime: RuntimeConfig,
    state: Mutex<SiteState>,
    events: broadcast::Sender<SiteEvent>,
}

#[derive(Default)]
struct SiteState {
    vars: Map<String, Value>,
    channel: String,
    page_index: u64,
    list_action: Option<String>,
    active: Vec<Weak<ActionContext>>,
    scheduled: Vec<Weak<ActionContext>>,
    pending: HashMap<RequestId, Weak<ActionContext>>,
    delegated: Vec<Weak<ActionContext>>,
    control: Option<Site>,
}

impl SiteState {
    fn is_busy(&self) -> bool {
        self.active
            .iter()
            .chain(self.scheduled.iter())
            .filter_map(Weak::upgrade)
            .any(|ctx| !ctx.status().is_terminal())
    }
}

fn same(weak: &Weak<ActionContext>, ctx: &ActionContext) -> bool {
    std::ptr::eq(weak.as_ptr(), ctx)
}

impl Site {
    /// Create a view instance for `address`.
    pub fn new(
        config: Arc<SiteConfig>,
        address: Url,
        services: Services,
        runtime: RuntimeConfig,
    ) -> Self {
        Self::with_role(config, address, services, runtime, SiteRole::View)
    }

    fn with_role(
        config: Arc<SiteConfig>,
        address: Url,
        services: Services,
        runtime: RuntimeConfig,
        role: SiteRole,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = SiteState {
            vars: config.vars().clone(),
            ..Default::default()
        };
        let site = Self {
            inner: Arc::new(SiteInner {
                role,
                config,
                address,
                services,
                runtime,
                state: Mutex::new(state),
                events,
            }),
        };
        sweeper::spawn(&site);
        site
    }

    /// Parse `address`, create a view instance and extract the channel name
    /// from the address when the site declares `extract_channel_name`.
    pub async fn open(
        config: Arc<SiteConfig>,
        address: &str,
        services: Services,
        runtime: RuntimeConfig,
    ) -> ActionResult<Self> {
        let url = Url::parse(address).map_err(|source| ConfigError::InvalidAddress {
            address: address.to_string(),
            source,
        })?;
        let site = Self::new(config, url, services, runtime);
        if site.has_action("extract_channel_name") {
            match site.call_wait("extract_channel_name", Map::new()).await {
                Ok(Value::Null) | Ok(Value::Bool(_)) => {}
                Ok(name) => {
                    let name = to_text(&name);
                    debug!(site = site.name(), channel = %name, "channel extracted from address");
                    site.set_channel_name(&name);
                }
                Err(err) => debug!(site = site.name(), "channel extraction failed: {err}"),
            }
        }
        Ok(site)
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakSite {
        WeakSite(Arc::downgrade(&self.inner))
    }

    /// Whether both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &Site) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Catalog name of the site.
    pub fn name(&self) -> &str {
        self.inner.config.name()
    }

    /// Site configuration.
    pub fn config(&self) -> &Arc<SiteConfig> {
        &self.inner.config
    }

    /// Address the site was opened with.
    pub fn address(&self) -> &Url {
        &self.inner.address
    }

    /// Host part of the address.
    pub fn domain(&self) -> String {
        self.inner.address.host_str().unwrap_or_default().to_string()
    }

    /// View or control instance.
    pub fn role(&self) -> SiteRole {
        self.inner.role
    }

    /// Runtime tuning.
    pub fn runtime(&self) -> &RuntimeConfig {
        &self.inner.runtime
    }

    /// Injected collaborators.
    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    /// Whether `action` has a non-empty plan.
    pub fn has_action(&self, action: &str) -> bool {
        self.inner.config.has_plan(action)
    }

    /// Subscribe to broadcast results.
    pub fn subscribe(&self) -> broadcast::Receiver<SiteEvent> {
        self.inner.events.subscribe()
    }

    /// Current channel (search) name.
    pub fn channel(&self) -> String {
        self.inner.state.lock().channel.clone()
    }

    /// Snapshot of the persistent variables.
    pub fn vars(&self) -> Map<String, Value> {
        self.inner.state.lock().vars.clone()
    }

    /// One persistent variable.
    pub fn var(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().vars.get(key).cloned()
    }

    /// Write a persistent variable.
    pub fn set_var(&self, key: &str, value: Value) {
        self.inner.state.lock().vars.insert(key.to_string(), value);
    }

    /// Current page index.
    pub fn page_index(&self) -> u64 {
        self.inner.state.lock().page_index
    }

    /// Select the page used by list actions.
    pub fn set_page_index(&self, index: u64) {
        self.inner.state.lock().page_index = index;
    }

    /// Entries per page.
    pub fn page_size(&self) -> u64 {
        self.inner.runtime.page_size
    }

    /// Number of live contexts in the active set.
    pub fn active_count(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.active.retain(|weak| weak.strong_count() > 0);
        state.active.len()
    }

    /// Whether a context is running or about to start.
    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().is_busy()
    }

    /// Number of suspensions waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Control instance cached by this view, if one was created.
    pub fn control(&self) -> Option<Site> {
        self.inner.state.lock().control.clone()
    }

    /// Variables every new stash starts from.
    pub fn global_variables(&self) -> Map<String, Value> {
        let (vars, page_index) = {
            let state = self.inner.state.lock();
            (state.vars.clone(), state.page_index)
        };
        let page_size = self.page_size();

        let mut globals = Map::new();
        globals.insert(VARS_KEY.to_string(), Value::Object(vars));
        globals.insert("URL".into(), json!(self.inner.address.as_str()));
        globals.insert("DOMAIN".into(), json!(self.domain()));
        globals.insert("PAGE_INDEX".into(), json!(page_index));
        globals.insert("PAGE_NUMBER".into(), json!(page_index + 1));
        globals.insert("PAGE_SIZE".into(), json!(page_size));
        globals.insert("PAGE_OFFSET".into(), json!(page_index * page_size));
        globals.insert("API_URL".into(), json!(self.api_url()));
        let headers = self.inner.config.api_headers();
        if !headers.is_empty() {
            globals.insert("API_HEADERS".into(), json!(headers));
        }
        globals
    }

    fn api_url(&self) -> String {
        let config = &self.inner.config;
        if let Some(url) = config.api_url() {
            return url.to_string();
        }
        let mut url = self.inner.address.clone();
        if let Some(prefix) = config.api_endpoint_prefix() {
            match Url::parse(prefix) {
                Ok(absolute) => url = absolute,
                Err(_) => {
                    url.set_path(prefix);
                    url.set_query(None);
                    url.set_fragment(None);
                }
            }
        }
        url.to_string()
    }

    /// Build a context for `action` without scheduling it.
    pub fn create_context(
        &self,
        action: &str,
        params: Map<String, Value>,
        mode: ExecMode,
    ) -> ActionResult<ContextHandle> {
        self.prepare_context(action, params, mode).map(Arc::new)
    }

    pub(crate) fn prepare_context(
        &self,
        action: &str,
        params: Map<String, Value>,
        mode: ExecMode,
    ) -> ActionResult<ActionContext> {
        let plan = self
            .inner
            .config
            .plan(action)
            .ok_or_else(|| ActionError::UnknownAction(action.to_string()))?;
        let mut stash = Stash::from_map(self.global_variables());
        stash.merge_params(params);
        Ok(ActionContext::new(action, plan, stash, mode))
    }

    /// Return this domain's control instance, creating it on first use.
    pub fn control_instance(&self) -> Site {
        if let Some(control) = self.control() {
            return control;
        }
        let domain = self.domain();
        let control = self
            .inner
            .services
            .registry
            .get_or_create(&domain, || self.control_copy());
        self.inner.state.lock().control = Some(control.clone());
        control
    }

    fn control_copy(&self) -> Site {
        let control = Site::with_role(
            self.inner.config.clone(),
            self.inner.address.clone(),
            self.inner.services.clone(),
            self.inner.runtime.clone(),
            SiteRole::Control,
        );
        let channel = self.channel();
        if !channel.is_empty() {
            control.set_channel_name(&channel);
        }
        control
    }

    // ---- driver ----

    pub(crate) fn mark_scheduled(&self, ctx: &ContextHandle) {
        ctx.set_status(ContextStatus::Scheduled);
        self.inner
            .state
            .lock()
            .scheduled
            .push(Arc::downgrade(ctx));
    }

    /// Admit `ctx` unless another context is active or scheduled.
    pub(crate) fn try_admit(&self, ctx: &ContextHandle) -> bool {
        let mut state = self.inner.state.lock();
        if state.is_busy() {
            return false;
        }
        ctx.set_status(ContextStatus::Scheduled);
        state.scheduled.push(Arc::downgrade(ctx));
        true
    }

    /// Start an async-mode context.
    pub(crate) fn start(&self, ctx: ContextHandle) {
        let first_run = ctx.cursor() == 0;
        {
            let mut state = self.inner.state.lock();
            state
                .scheduled
                .retain(|weak| weak.strong_count() > 0 && !same(weak, &ctx));
            if first_run && !state.active.iter().any(|weak| same(weak, &ctx)) {
                state.active.push(Arc::downgrade(&ctx));
            }
        }
        if ctx.status().is_terminal() {
            self.deactivate(&ctx);
            return;
        }
        ctx.start();
        info!(
            site = self.name(),
            action = ctx.name(),
            context = %ctx.id(),
            "starting action plan"
        );
        self.advance(ctx, None);
    }

    fn advance(&self, ctx: ContextHandle, incoming: Option<Value>) {
        if ctx.status().is_terminal() {
            debug!(action = ctx.name(), context = %ctx.id(), "context settled; nothing to resume");
            return;
        }
        ctx.set_status(ContextStatus::Running);
        let flow = self.step(&ctx, incoming);
        match flow {
            Flow::Finished(value) => self.complete(&ctx, value),
            Flow::Failed(failure) => self.report_failure(&ctx, failure),
            Flow::Suspended(suspension) => self.suspend(ctx, suspension),
        }
    }

    fn step(&self, ctx: &ContextHandle, incoming: Option<Value>) -> Flow {
        let mut exec = ctx.take_execution();
        let flow = {
            let mut host = SiteHost {
                site: self,
                ctx: ctx.as_ref(),
                log_all: self.inner.runtime.debug || self.inner.services.log_all(),
            };
            match incoming {
                Some(value) => resume(ctx.plan(), &mut exec, &mut host, value),
                None => run(ctx.plan(), &mut exec, &mut host),
            }
        };
        ctx.restore_execution(exec);
        flow
    }

    fn suspend(&self, ctx: ContextHandle, suspension: Suspension) {
        ctx.set_status(ContextStatus::Suspended);
        let operation = match self.operation(&ctx, suspension) {
            Ok(operation) => operation,
            Err(reason) => {
                self.fail_at(&ctx, reason);
                return;
            }
        };

        let request = RequestId::new();
        self.inner
            .state
            .lock()
            .pending
            .insert(request, Arc::downgrade(&ctx));
        debug!(action = ctx.name(), context = %ctx.id(), %request, "suspended");

        let site = self.downgrade();
        tokio::spawn(async move {
            let result = operation.await;
            let held = ctx;
            match site.upgrade() {
                Some(site) => site.on_reply(request, result),
                None => debug!(action = held.name(), %request, "site dropped; reply discarded"),
            }
        });
    }

    fn operation(
        &self,
        ctx: &ContextHandle,
        suspension: Suspension,
    ) -> StepResult<BoxFuture<'static, StepResult<Value>>> {
        let operation = match suspension {
            Suspension::Fetch(request) => {
                let transport = self.inner.services.transport.clone();
                async move { fetch(transport.as_ref(), &request).await }.boxed()
            }
            Suspension::ShowPage { url } => {
                let reply = self.show_page(ctx, &url);
                async move { reply.await.map_err(|_| StepError::PageDismissed) }.boxed()
            }
            Suspension::SubAction { action, params } => {
                let child = self.delegate_for(ctx, &action, params)?;
                async move { relay(child, action).await }.boxed()
            }
        };
        Ok(operation)
    }

    fn show_page(&self, ctx: &ContextHandle, url: &str) -> oneshot::Receiver<Value> {
        let (sender, receiver) = oneshot::channel();
        ctx.install_reply(sender);
        info!(action = ctx.name(), %url, "showing interactive page");
        self.inner.services.pages.show_page(url, ctx.clone());
        receiver
    }

    fn delegate_for(
        &self,
        ctx: &ContextHandle,
        action: &str,
        params: Map<String, Value>,
    ) -> StepResult<ContextHandle> {
        if self.inner.role == SiteRole::Control {
            return Err(StepError::SelfDelegation(action.to_string()));
        }
        let control = self.control_instance();
        info!(site = self.name(), action, parent = %ctx.id(), "calling sub-action via control instance");
        control
            .delegate(action, params, Some(ctx.id()))
            .map_err(|err| StepError::SubAction {
                action: action.to_string(),
                reason: err.to_string(),
            })
    }

    /// Deliver the reply to a suspension and resume its context.
    pub(crate) fn on_reply(&self, request: RequestId, result: StepResult<Value>) {
        let entry = self.inner.state.lock().pending.remove(&request);
        let Some(ctx) = entry.and_then(|weak| weak.upgrade()) else {
            debug!(%request, "reply for reaped context discarded");
            return;
        };
        if ctx.status().is_terminal() {
            debug!(action = ctx.name(), %request, "reply for settled context discarded");
            return;
        }
        match result {
            Ok(value) => self.advance(ctx, Some(value)),
            Err(reason) => self.fail_at(&ctx, reason),
        }
    }

    fn fail_at(&self, ctx: &ContextHandle, reason: StepError) {
        let mut exec = ctx.take_execution();
        let failure = exec.fail(reason);
        ctx.restore_execution(exec);
        self.report_failure(ctx, failure);
    }

    fn deactivate(&self, ctx: &ActionContext) {
        let mut state = self.inner.state.lock();
        state
            .active
            .retain(|weak| weak.strong_count() > 0 && !same(weak, ctx));
        state
            .scheduled
            .retain(|weak| weak.strong_count() > 0 && !same(weak, ctx));
    }

    fn complete(&self, ctx: &ContextHandle, value: Value) {
        self.deactivate(ctx);
        // running off the end of the plan produces no broadcast result
        let explicit = ctx.cursor() < ctx.plan().len();
        if !ctx.finish(value.clone()) {
            return;
        }
        debug!(action = ctx.name(), context = %ctx.id(), signal = ctx.is_signal_enabled(), "action finished");
        if explicit && !ctx.is_signal_enabled() {
            self.broadcast_result(ctx.name(), &value);
        }
    }

    fn failure_report(&self, ctx: &ActionContext, failure: StepFailure) -> Arc<FailureReport> {
        let step = ctx
            .plan()
            .step(failure.index)
            .map(|step| step.source.clone())
            .unwrap_or(Value::Null);
        warn!(
            site = self.name(),
            action = ctx.name(),
            index = failure.index,
            "action failed: {}",
            failure.reason
        );
        Arc::new(FailureReport {
            action: ctx.name().to_string(),
            context: ctx.id(),
            step_index: failure.index,
            step,
            stash: failure.stash.to_value(),
            reason: failure.reason,
            failed_at: Utc::now(),
        })
    }

    fn report_failure(&self, ctx: &ContextHandle, failure: StepFailure) {
        self.deactivate(ctx);
        let report = self.failure_report(ctx, failure);
        if ctx.fail(report.clone()) && !ctx.is_signal_enabled() {
            let _ = self.inner.events.send(SiteEvent::ActionFailed(report));
        }
    }

    fn broadcast_result(&self, action: &str, value: &Value) {
        if action == "get_channel" {
            match value {
                Value::Object(info) => self.set_channel_info(info.clone()),
                other => self.set_channel_name(&to_text(other)),
            }
        }
        if let Some(event) = events::for_result(action, value) {
            let _ = self.inner.events.send(event);
        }
    }

    /// Drive a wait-mode context to completion on the caller's task.
    pub(crate) async fn drive_wait(&self, ctx: ContextHandle) -> ActionResult<Value> {
        ctx.start();
        debug!(site = self.name(), action = ctx.name(), "running action plan (wait)");
        let transport = self
            .inner
            .services
            .transport
            .isolated()
            .unwrap_or_else(|| self.inner.services.transport.clone());

        let mut incoming = None;
        loop {
            ctx.set_status(ContextStatus::Running);
            let suspension = match self.step(&ctx, incoming.take()) {
                Flow::Finished(value) => {
                    ctx.finish(value.clone());
                    return Ok(value);
                }
                Flow::Failed(failure) => {
                    let report = self.failure_report(&ctx, failure);
                    ctx.fail(report.clone());
                    return Err(ActionError::Failed(report));
                }
                Flow::Suspended(suspension) => suspension,
            };

            ctx.set_status(ContextStatus::Suspended);
            let result = match suspension {
                Suspension::Fetch(request) => fetch(transport.as_ref(), &request).await,
                Suspension::ShowPage { url } => self
                    .show_page(&ctx, &url)
                    .await
                    .map_err(|_| StepError::PageDismissed),
                Suspension::SubAction { action, params } => {
                    match self.delegate_for(&ctx, &action, params) {
                        Ok(child) => relay(child, action).await,
                        Err(reason) => Err(reason),
                    }
                }
            };

            match result {
                Ok(value) => incoming = Some(value),
                Err(reason) => {
                    let mut exec = ctx.take_execution();
                    let failure = exec.fail(reason);
                    ctx.restore_execution(exec);
                    let report = self.failure_report(&ctx, failure);
                    ctx.fail(report.clone());
                    return Err(ActionError::Failed(report));
                }
            }
        }
    }

    pub(crate) fn expire(&self, ctx: &ContextHandle) {
        warn!(
            site = self.name(),
            action = ctx.name(),
            context = %ctx.id(),
            elapsed_ms = ctx.elapsed().map(|e| e.as_millis() as u64).unwrap_or_default(),
            "timeout; context abandoned"
        );
        ctx.abandon();
    }

    /// Remove expired contexts from the active set and their pending replies.
    pub(crate) fn take_expired(&self) -> Vec<ContextHandle> {
        let ceiling = self.inner.runtime.context_timeout;
        let mut state = self.inner.state.lock();
        let mut expired = Vec::new();
        state.active.retain(|weak| match weak.upgrade() {
            None => false,
            Some(ctx) => {
                if ctx.elapsed().is_some_and(|elapsed| elapsed > ceiling) {
                    expired.push(ctx);
                    false
                } else {
                    true
                }
            }
        });
        if !expired.is_empty() {
            state.pending.retain(|request, weak| {
                let reaped = weak.upgrade().is_none_or(|ctx| {
                    expired.iter().any(|gone| Arc::ptr_eq(gone, &ctx))
                });
                if reaped {
                    warn!(%request, "dropping pending reply of abandoned context");
                }
                !reaped
            });
        }
        expired
    }

    // ---- delegation ----

    /// Run `action` on this (control) instance for a parent context, joining
    /// a live delegated context of the same name if there is one.
    pub(crate) fn delegate(
        &self,
        action: &str,
        params: Map<String, Value>,
        parent: Option<super::context::ContextId>,
    ) -> ActionResult<ContextHandle> {
        let prepared = Arc::new(
            self.prepare_context(action, params, ExecMode::Async)?
                .delegated_from(parent),
        );
        prepared.enable_signal();

        let ctx = {
            let mut state = self.inner.state.lock();
            state.delegated.retain(|weak| {
                weak.upgrade()
                    .is_some_and(|ctx| !ctx.status().is_terminal())
            });
            let existing = state
                .delegated
                .iter()
                .filter_map(Weak::upgrade)
                .find(|ctx| ctx.name() == action);
            match existing {
                Some(existing) => {
                    debug!(action, context = %existing.id(), "joining in-flight sub-action");
                    return Ok(existing);
                }
                None => {
                    state.delegated.push(Arc::downgrade(&prepared));
                    prepared
                }
            }
        };
        self.schedule_when_ready(ctx.clone());
        Ok(ctx)
    }

    // ---- connector operations ----

    /// Run `compatibility` and test its result.
    pub async fn check_compatibility(&self) -> bool {
        if !self.has_action("compatibility") {
            return false;
        }
        match self.call_wait("compatibility", Map::new()).await {
            Ok(value) => to_bool(Some(&value)),
            Err(err) => {
                debug!(site = self.name(), "compatibility check failed: {err}");
                false
            }
        }
    }

    /// Canonical form of a player address, when the site declares one.
    pub async fn normalize_player_address(&self, address: &str) -> String {
        if !self.has_action("normalize_video_url") {
            return address.to_string();
        }
        let mut params = Map::new();
        params.insert("url".into(), json!(address));
        match self.call_wait("normalize_video_url", params).await {
            Ok(Value::String(normalized)) => normalized,
            Ok(_) => address.to_string(),
            Err(err) => {
                debug!(site = self.name(), "address normalization failed: {err}");
                address.to_string()
            }
        }
    }

    /// Store a bare channel name as `VARS.CHANNEL = {name}`.
    pub fn set_channel_name(&self, name: &str) {
        let mut info = Map::new();
        info.insert("name".into(), json!(name));
        self.set_channel_info(info);
    }

    /// Store channel info as `VARS.CHANNEL`.
    pub fn set_channel_info(&self, info: Map<String, Value>) {
        let name = info.get("name").map(to_text).unwrap_or_default();
        debug!(site = self.name(), channel = %name, "channel set");
        let mut state = self.inner.state.lock();
        state.channel = name;
        state.vars.insert("CHANNEL".into(), Value::Object(info));
    }

    /// Look up a channel by search name (`get_channel`).
    pub fn load_channel(&self, search: &str) -> ActionResult<ContextHandle> {
        let mut params = Map::new();
        params.insert("name".into(), json!(search));
        self.call_async("get_channel", params)
    }

    /// Load the current channel, if one is set.
    pub fn load_channel_default(&self) -> ActionResult<Option<ContextHandle>> {
        let channel = self.channel();
        if channel.is_empty() {
            warn!(site = self.name(), "cannot load channel; no search name set");
            return Ok(None);
        }
        self.load_channel(&channel).map(Some)
    }

    /// Load the site's display name (`get_name`).
    pub fn load_site_name(&self) -> ActionResult<ContextHandle> {
        self.call_async("get_name", Map::new())
    }

    /// List the channel's videos and remember that listing for paging.
    pub fn load_channel_videos(&self, page: Option<u64>) -> ActionResult<ContextHandle> {
        {
            let mut state = self.inner.state.lock();
            if let Some(page) = page {
                state.page_index = page;
            }
            state.list_action = Some("get_channel_videos".into());
        }
        self.call_when_ready("get_channel_videos", Map::new())
    }

    /// Repeat the remembered listing, optionally on another page.
    pub fn load_videos(&self, page: Option<u64>) -> ActionResult<Option<ContextHandle>> {
        let action = {
            let mut state = self.inner.state.lock();
            if let Some(page) = page {
                state.page_index = page;
            }
            state.list_action.clone()
        };
        let Some(action) = action else {
            warn!(site = self.name(), "cannot load video list; no listing selected");
            return Ok(None);
        };
        self.call_when_ready(&action, Map::new()).map(Some)
    }

    /// Resolve the sources of a listed video.
    pub fn load_video(&self, item: Map<String, Value>) -> ActionResult<ContextHandle> {
        let action = if self.has_action("get_video_urls") {
            "get_video_urls"
        } else {
            "get_video_url"
        };
        self.call_async(action, item)
    }

    /// Resolve the sources of a video address.
    pub fn load_video_url(&self, url: &str) -> ActionResult<ContextHandle> {
        let mut item = Map::new();
        item.insert("url".into(), json!(url));
        self.load_video(item)
    }

    /// Resolve relative (`/path`) addresses against the site address.
    pub fn resolve_address(&self, address: &str) -> Result<Url, ConfigError> {
        let resolved = if address.starts_with('/') {
            self.inner.address.join(address)
        } else {
            Url::parse(address)
        };
        resolved.map_err(|source| ConfigError::InvalidAddress {
            address: address.to_string(),
            source,
        })
    }

    /// Fetch `address` raw; the result arrives on the context only.
    pub fn download(&self, address: &str) -> ActionResult<ContextHandle> {
        let url = self.resolve_address(address)?;
        let plan = build_plan_value(
            "download",
            &json!([
                {"http": url.as_str(), "type": "get", "raw": true, "dest": "bytes"},
                {"return": "bytes"}
            ]),
        )
        .map_err(|source| ConfigError::Plan {
            site: self.name().to_string(),
            action: "download".into(),
            source,
        })?;
        let ctx = Arc::new(ActionContext::new(
            "download",
            Arc::new(plan),
            Stash::new(),
            ExecMode::Async,
        ));
        ctx.enable_signal();
        Ok(self.call(ctx))
    }

    /// Fetch a thumbnail and broadcast it as [`SiteEvent::ThumbnailLoaded`].
    pub fn load_thumbnail(&self, url: &str, tag: impl Into<String>) -> Result<(), ConfigError> {
        let url = self.resolve_address(url)?;
        let tag = tag.into();
        let transport = self.inner.services.transport.clone();
        let site = self.downgrade();
        tokio::spawn(async move {
            let result = transport.get(&url, &[]).await;
            let Some(site) = site.upgrade() else {
                return;
            };
            match result {
                Ok(bytes) => {
                    let _ = site.inner.events.send(SiteEvent::ThumbnailLoaded {
                        url: url.to_string(),
                        tag,
                        bytes,
                    });
                }
                Err(err) => warn!(%url, "thumbnail fetch failed: {err}"),
            }
        });
        Ok(())
    }
}

async fn relay(child: ContextHandle, action: String) -> StepResult<Value> {
    child
        .outcome()
        .await
        .map_err(|err| StepError::SubAction {
            action,
            reason: err.to_string(),
        })
}

impl fmt::Debug for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Site")
            .field("name", &self.name())
            .field("address", &self.inner.address.as_str())
            .field("role", &self.inner.role)
            .finish()
    }
}

struct SiteHost<'a> {
    site: &'a Site,
    ctx: &'a ActionContext,
    log_all: bool,
}

impl PlanHost for SiteHost<'_> {
    fn set_var(&mut self, key: &str, value: Value) {
        self.site.set_var(key, value);
    }

    fn emit_item(&mut self, value: &Value) {
        self.ctx.emit_item(value);
        if !self.ctx.is_signal_enabled() {
            if let Some(event) = events::for_result(self.ctx.name(), value) {
                let _ = self.site.inner.events.send(event);
            }
        }
    }

    fn log_all(&self) -> bool {
        self.log_all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::transport::Transport;
    use crate::runtime::error::TransportResult;
    use crate::interpreter::RequestBody;
    use async_trait::async_trait;

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn get(&self, url: &Url, _: &[(String, String)]) -> TransportResult<Vec<u8>> {
            Err(crate::runtime::error::TransportError::Network(url.to_string()))
        }

        async fn post(
            &self,
            url: &Url,
            _: &[(String, String)],
            _: &RequestBody,
        ) -> TransportResult<Vec<u8>> {
            Err(crate::runtime::error::TransportError::Network(url.to_string()))
        }

        async fn head(&self, url: &Url) -> TransportResult<()> {
            Err(crate::runtime::error::TransportError::Network(url.to_string()))
        }
    }

    fn site(config: Value) -> Site {
        let config = SiteConfig::from_value("test", &config).unwrap();
        Site::new(
            Arc::new(config),
            Url::parse("https://videos.example.com/c/someone?tab=1").unwrap(),
            Services::new(Arc::new(Offline)),
            RuntimeConfig::default(),
        )
    }

    #[test]
    fn globals_describe_site_and_page() {
        let site = site(json!({
            "vars": {"client": "abc"},
            "api_endpoint_prefix": "/api/v1/",
            "api_header": "X-Key: k"
        }));
        site.set_page_index(2);
        let globals = site.global_variables();
        assert_eq!(globals["DOMAIN"], json!("videos.example.com"));
        assert_eq!(globals["PAGE_INDEX"], json!(2));
        assert_eq!(globals["PAGE_NUMBER"], json!(3));
        assert_eq!(globals["PAGE_SIZE"], json!(20));
        assert_eq!(globals["PAGE_OFFSET"], json!(40));
        assert_eq!(globals["API_URL"], json!("https://videos.example.com/api/v1/"));
        assert_eq!(globals["API_HEADERS"], json!(["X-Key: k"]));
        assert_eq!(globals["VARS"], json!({"client": "abc"}));
    }

    #[test]
    fn absolute_prefix_replaces_url() {
        let site = site(json!({"api_endpoint_prefix": "https://api.example.net/v3/"}));
        assert_eq!(site.global_variables()["API_URL"], json!("https://api.example.net/v3/"));
        let site = site_with_api_url();
        assert_eq!(site.global_variables()["API_URL"], json!("https://explicit.example/"));
    }

    fn site_with_api_url() -> Site {
        site(json!({"api_url": "https://explicit.example/", "api_endpoint_prefix": "/ignored"}))
    }

    #[test]
    fn unknown_action_creates_no_context() {
        let site = site(json!({"empty": []}));
        assert!(matches!(
            site.create_context("empty", Map::new(), ExecMode::Async),
            Err(ActionError::UnknownAction(name)) if name == "empty"
        ));
    }

    #[test]
    fn caller_params_win_except_vars() {
        let site = site(json!({"vars": {"t": 1}, "p": [{"return": "URL"}]}));
        let mut params = Map::new();
        params.insert("URL".into(), json!("override"));
        params.insert("VARS".into(), json!({"t": 2}));
        let ctx = site.create_context("p", params, ExecMode::Async).unwrap();
        let stash = ctx.stash();
        assert_eq!(stash.get("URL"), Some(&json!("override")));
        assert_eq!(stash.lookup("VARS.t"), Some(&json!(1)));
    }

    #[test]
    fn channel_name_lands_in_vars() {
        let site = site(json!({}));
        site.set_channel_name("someone");
        assert_eq!(site.channel(), "someone");
        assert_eq!(site.var("CHANNEL"), Some(json!({"name": "someone"})));
    }

    #[test]
    fn relative_addresses_resolve_against_site() {
        let site = site(json!({}));
        assert_eq!(
            site.resolve_address("/thumb/1.jpg").unwrap().as_str(),
            "https://videos.example.com/thumb/1.jpg"
        );
        assert!(site.resolve_address("not a url").is_err());
    }
}
