//! Action contexts
//!
//! An [`ActionContext`] is the live record of one run of a named plan: its
//! cursor and stash, timer, status and terminal outcome. Contexts are shared
//! through [`ContextHandle`]s. Sites keep only weak references in their
//! active set and pending-reply map.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::error::{ActionError, ActionResult, FailureReport};
use crate::interpreter::{Execution, Plan, Stash};

const EVENT_CAPACITY: usize = 64;

/// Shared handle to a context.
pub type ContextHandle = Arc<ActionContext>;

/// Unique context identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub Uuid);

impl ContextId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a context is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Caller awaits the whole run inline
    Wait,
    /// Run on spawned tasks, resuming at the cursor after each reply
    Async,
}

/// Lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    /// Created, not yet scheduled
    Created,
    /// Start deferred to a later tick
    Scheduled,
    /// Steps are being evaluated
    Running,
    /// Waiting for one outside operation
    Suspended,
    /// Terminal success
    Finished,
    /// Terminal failure
    Failed,
    /// Reaped by the timeout sweep
    Abandoned,
}

impl ContextStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ContextStatus::Finished | ContextStatus::Failed | ContextStatus::Abandoned
        )
    }
}

/// Event on a context's private channel
#[derive(Debug, Clone)]
pub enum ContextEvent {
    /// Execution started
    Started,
    /// `yield` produced an element
    Item(Value),
    /// Terminal success
    Finished(Value),
    /// Terminal failure
    Failed(Arc<FailureReport>),
    /// Reaped by the timeout sweep
    Abandoned,
}

#[derive(Debug, Clone)]
enum Outcome {
    Finished(Value),
    Failed(Arc<FailureReport>),
    Abandoned,
}

struct ContextState {
    exec: Execution,
    mode: ExecMode,
    status: ContextStatus,
    started_at: Option<Instant>,
    outcome: Option<Outcome>,
}

/// Execution record for one run of a plan
pub struct ActionContext {
    id: ContextId,
    name: String,
    plan: Arc<Plan>,
    parent: Option<ContextId>,
    delegated: bool,
    signal: AtomicBool,
    state: Mutex<ContextState>,
    reply: Mutex<Option<oneshot::Sender<Value>>>,
    events: broadcast::Sender<ContextEvent>,
}

impl ActionContext {
    /// Create a context for `plan` starting at the first step.
    pub fn new(name: impl Into<String>, plan: Arc<Plan>, stash: Stash, mode: ExecMode) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id: ContextId::new(),
            name: name.into(),
            plan,
            parent: None,
            delegated: false,
            signal: AtomicBool::new(false),
            state: Mutex::new(ContextState {
                exec: Execution::new(stash),
                mode,
                status: ContextStatus::Created,
                started_at: None,
                outcome: None,
            }),
            reply: Mutex::new(None),
            events,
        }
    }

    /// Mark this context as a sub-action run on behalf of `parent`.
    pub(crate) fn delegated_from(mut self, parent: Option<ContextId>) -> Self {
        self.parent = parent;
        self.delegated = true;
        self
    }

    /// Identifier.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Action name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plan being executed.
    pub fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    /// Context that delegated this one, if any.
    pub fn parent(&self) -> Option<ContextId> {
        self.parent
    }

    /// Whether this context runs a delegated sub-action.
    pub fn is_delegated(&self) -> bool {
        self.delegated
    }

    /// Whether results go to the private channel only.
    pub fn is_signal_enabled(&self) -> bool {
        self.signal.load(Ordering::Acquire)
    }

    /// Deliver results privately instead of broadcasting them on the site.
    pub fn enable_signal(&self) {
        self.signal.store(true, Ordering::Release);
    }

    /// Current status.
    pub fn status(&self) -> ContextStatus {
        self.state.lock().status
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecMode {
        self.state.lock().mode
    }

    /// Index of the next (or suspended) step.
    pub fn cursor(&self) -> usize {
        self.state.lock().exec.cursor
    }

    /// Copy of the current stash.
    pub fn stash(&self) -> Stash {
        self.state.lock().exec.stash.clone()
    }

    /// Time since [`start`](Self::start), if started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.state.lock().started_at.map(|at| at.elapsed())
    }

    /// Subscribe to the private event channel.
    pub fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.events.subscribe()
    }

    /// Start the timer and announce the start.
    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return;
            }
            state.started_at = Some(Instant::now());
            state.status = ContextStatus::Running;
        }
        let _ = self.events.send(ContextEvent::Started);
    }

    /// Inject the result of an interactive operation into a suspended context.
    ///
    /// Returns `false` when nothing was waiting; the value is then discarded.
    pub fn set_value(&self, value: Value) -> bool {
        let waiting = self.reply.lock().take();
        match waiting {
            Some(sender) => sender.send(value).is_ok(),
            None => {
                debug!(action = %self.name, context = %self.id, "set_value with nothing waiting, discarded");
                false
            }
        }
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(&self) -> ActionResult<Value> {
        let mut events = self.events.subscribe();
        if let Some(result) = self.stored_outcome() {
            return result;
        }
        loop {
            match events.recv().await {
                Ok(ContextEvent::Finished(value)) => return Ok(value),
                Ok(ContextEvent::Failed(report)) => return Err(ActionError::Failed(report)),
                Ok(ContextEvent::Abandoned) => return Err(ActionError::TimedOut(self.name.clone())),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(result) = self.stored_outcome() {
                        return result;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return self
                        .stored_outcome()
                        .unwrap_or_else(|| Err(ActionError::Dropped(self.name.clone())));
                }
            }
        }
    }

    /// Stored terminal outcome, if the context has one.
    pub fn stored_outcome(&self) -> Option<ActionResult<Value>> {
        let state = self.state.lock();
        state.outcome.as_ref().map(|outcome| match outcome {
            Outcome::Finished(value) => Ok(value.clone()),
            Outcome::Failed(report) => Err(ActionError::Failed(report.clone())),
            Outcome::Abandoned => Err(ActionError::TimedOut(self.name.clone())),
        })
    }

    pub(crate) fn set_status(&self, status: ContextStatus) {
        let mut state = self.state.lock();
        if !state.status.is_terminal() {
            state.status = status;
        }
    }

    /// Move the execution out for a runner pass.
    pub(crate) fn take_execution(&self) -> Execution {
        std::mem::take(&mut self.state.lock().exec)
    }

    /// Put the execution back after a runner pass.
    pub(crate) fn restore_execution(&self, exec: Execution) {
        self.state.lock().exec = exec;
    }

    pub(crate) fn install_reply(&self, sender: oneshot::Sender<Value>) {
        *self.reply.lock() = Some(sender);
    }

    pub(crate) fn clear_reply(&self) {
        self.reply.lock().take();
    }

    pub(crate) fn emit_item(&self, value: &Value) {
        let _ = self.events.send(ContextEvent::Item(value.clone()));
    }

    /// Terminal success. Returns `false` if already terminal.
    pub(crate) fn finish(&self, value: Value) -> bool {
        if !self.settle(ContextStatus::Finished, Outcome::Finished(value.clone())) {
            return false;
        }
        let _ = self.events.send(ContextEvent::Finished(value));
        true
    }

    /// Terminal failure. Returns `false` if already terminal.
    pub(crate) fn fail(&self, report: Arc<FailureReport>) -> bool {
        if !self.settle(ContextStatus::Failed, Outcome::Failed(report.clone())) {
            return false;
        }
        let _ = self.events.send(ContextEvent::Failed(report));
        true
    }

    /// Reaped by the sweep. Returns `false` if already terminal.
    pub(crate) fn abandon(&self) -> bool {
        if !self.settle(ContextStatus::Abandoned, Outcome::Abandoned) {
            return false;
        }
        self.clear_reply();
        let _ = self.events.send(ContextEvent::Abandoned);
        true
    }

    fn settle(&self, status: ContextStatus, outcome: Outcome) -> bool {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        state.outcome = Some(outcome);
        true
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("cursor", &self.cursor())
            .finish()
    }
}
