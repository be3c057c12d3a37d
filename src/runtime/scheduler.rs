//! Context admission
//!
//! Three ways to run an action on a site: `call` starts it after one
//! scheduler tick, `call_when_ready` additionally waits until no other
//! context is active or scheduled, and `call_wait` drives it inline.

use serde_json::{Map, Value};
use tracing::debug;

use super::context::{ContextHandle, ExecMode};
use super::error::ActionResult;
use super::site::Site;

/// Reason a context was admitted (for observability)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionCause {
    /// Started unconditionally
    Immediate,
    /// Admitted on an idle site
    Idle,
    /// Admitted after waiting for the site to go idle
    Retry,
}

impl Site {
    /// Start `ctx` on the next scheduler tick.
    pub fn call(&self, ctx: ContextHandle) -> ContextHandle {
        self.mark_scheduled(&ctx);
        self.launch(ctx.clone(), AdmissionCause::Immediate);
        ctx
    }

    /// Create a context for `action` and start it on the next tick.
    pub fn call_async(
        &self,
        action: &str,
        params: Map<String, Value>,
    ) -> ActionResult<ContextHandle> {
        let ctx = self.create_context(action, params, ExecMode::Async)?;
        Ok(self.call(ctx))
    }

    /// Create a context for `action` that starts once the site is idle.
    pub fn call_when_ready(
        &self,
        action: &str,
        params: Map<String, Value>,
    ) -> ActionResult<ContextHandle> {
        let ctx = self.create_context(action, params, ExecMode::Async)?;
        self.schedule_when_ready(ctx.clone());
        Ok(ctx)
    }

    /// Run `action` to completion on the caller's task.
    pub async fn call_wait(&self, action: &str, params: Map<String, Value>) -> ActionResult<Value> {
        let ctx = self.create_context(action, params, ExecMode::Wait)?;
        self.drive_wait(ctx).await
    }

    pub(crate) fn schedule_when_ready(&self, ctx: ContextHandle) {
        if self.try_admit(&ctx) {
            self.launch(ctx, AdmissionCause::Idle);
            return;
        }

        debug!(site = self.name(), action = ctx.name(), "site busy; postponing");
        let site = self.downgrade();
        let backoff = self.runtime().when_ready_backoff;
        tokio::spawn(async move {
            let mut attempts = 0u32;
            loop {
                tokio::time::sleep(backoff).await;
                attempts += 1;
                let Some(site) = site.upgrade() else {
                    return;
                };
                if ctx.status().is_terminal() {
                    return;
                }
                if site.try_admit(&ctx) {
                    debug!(action = ctx.name(), attempts, "admitted after waiting");
                    site.launch(ctx, AdmissionCause::Retry);
                    return;
                }
            }
        });
    }

    fn launch(&self, ctx: ContextHandle, cause: AdmissionCause) {
        debug!(site = self.name(), action = ctx.name(), ?cause, "context admitted");
        let site = self.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            site.start(ctx);
        });
    }
}
