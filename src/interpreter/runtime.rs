use serde_json::{Map, Value};
use tracing::{debug, trace};
use url::Url;

use super::ir::{DebugMode, Dest, Op, Plan, Step};
use super::ops::{self, LoopStep};
use super::value::{Stash, VARS_KEY};
use crate::runtime::error::StepError;
use crate::util::json::summarize;

const LOG_LIMIT: usize = 2048;

/// Host trait implemented by whatever owns the execution (usually a site).
pub trait PlanHost {
    /// Persist a `VARS.key` write in the owner's variable table.
    fn set_var(&mut self, key: &str, value: Value);
    /// Deliver one element produced by `yield`.
    fn emit_item(&mut self, value: &Value);
    /// Whether every step result should be logged.
    fn log_all(&self) -> bool {
        false
    }
}

/// Resumable position of one plan execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    /// Index of the next (or suspended) step.
    pub cursor: usize,
    /// Variables threaded through the steps.
    pub stash: Stash,
}

impl Execution {
    /// Start at the first step with the given stash.
    pub fn new(stash: Stash) -> Self {
        Self { cursor: 0, stash }
    }

    /// Record a failure at the cursor, keeping a copy of the stash for
    /// diagnostics and clearing the live one.
    pub fn fail(&mut self, reason: StepError) -> StepFailure {
        let stash = std::mem::take(&mut self.stash);
        StepFailure {
            index: self.cursor,
            reason,
            stash,
        }
    }
}

/// A failed step.
#[derive(Debug)]
pub struct StepFailure {
    /// Index of the failed step.
    pub index: usize,
    /// Why it failed.
    pub reason: StepError,
    /// Stash as it was when the step failed.
    pub stash: Stash,
}

/// Where a call to [`run`] or [`resume`] stopped.
#[derive(Debug)]
pub enum Flow {
    /// Terminal success.
    Finished(Value),
    /// Terminal failure.
    Failed(StepFailure),
    /// Waiting for exactly one outside operation; resume with its value.
    Suspended(Suspension),
}

/// Outside operation a suspended execution waits for.
#[derive(Debug, Clone, PartialEq)]
pub enum Suspension {
    /// Network request.
    Fetch(FetchRequest),
    /// Interactive page shown by the host UI.
    ShowPage {
        /// Page URL.
        url: String,
    },
    /// Sub-action on the domain control instance.
    SubAction {
        /// Action name.
        action: String,
        /// Parameters (the caller's stash).
        params: Map<String, Value>,
    },
}

/// Prepared network request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    /// Method.
    pub method: FetchMethod,
    /// Absolute URL.
    pub url: Url,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// Body for POST.
    pub body: Option<RequestBody>,
    /// How the response becomes a stash value.
    pub shape: ResponseShape,
}

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// HEAD
    Head,
}

/// Encoded request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBody {
    /// Content type header value.
    pub content_type: &'static str,
    /// Body bytes.
    pub bytes: Vec<u8>,
}

impl RequestBody {
    /// JSON body.
    pub fn json(bytes: Vec<u8>) -> Self {
        Self {
            content_type: "application/json",
            bytes,
        }
    }

    /// Urlencoded form body.
    pub fn form(text: String) -> Self {
        Self {
            content_type: "application/x-www-form-urlencoded",
            bytes: text.into_bytes(),
        }
    }
}

/// Declared shape of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Decode the body as JSON.
    Json,
    /// Keep the body as (lossy UTF-8) text.
    Text,
    /// Only whether the request succeeded.
    Exists,
}

enum Outcome {
    Value(Value),
    Next,
    Jump(usize),
    Finish(Value),
    Suspend(Suspension),
}

/// Run from the cursor until the plan finishes, fails or suspends.
pub fn run<H: PlanHost + ?Sized>(plan: &Plan, exec: &mut Execution, host: &mut H) -> Flow {
    loop {
        let index = exec.cursor;
        let Some(step) = plan.step(index) else {
            trace!(action = %plan.name, "all steps consumed");
            return Flow::Finished(Value::Bool(true));
        };

        if let Some(gate) = &step.gate {
            if !gate.admits(&exec.stash) {
                trace!(action = %plan.name, index, key = %gate.key, "step skipped by condition");
                exec.cursor += 1;
                continue;
            }
        }

        trace!(action = %plan.name, index, op = step.op.keyword(), "step");
        match evaluate(step, index, &mut exec.stash, host) {
            Ok(Outcome::Value(value)) => {
                store(step, value, &mut exec.stash, host);
                exec.cursor += 1;
            }
            Ok(Outcome::Next) => exec.cursor += 1,
            Ok(Outcome::Jump(origin)) => exec.cursor = origin,
            Ok(Outcome::Finish(value)) => return Flow::Finished(value),
            Ok(Outcome::Suspend(suspension)) => return Flow::Suspended(suspension),
            Err(reason) => {
                debug!(
                    action = %plan.name,
                    index,
                    stash = %summarize(&exec.stash.to_value(), LOG_LIMIT),
                    "step failed: {reason}"
                );
                return Flow::Failed(exec.fail(reason));
            }
        }
    }
}

/// Store the reply to the suspended step at the cursor and keep running.
pub fn resume<H: PlanHost + ?Sized>(
    plan: &Plan,
    exec: &mut Execution,
    host: &mut H,
    value: Value,
) -> Flow {
    if let Some(step) = plan.step(exec.cursor) {
        store(step, value, &mut exec.stash, host);
    }
    exec.cursor += 1;
    run(plan, exec, host)
}

fn evaluate<H: PlanHost + ?Sized>(
    step: &Step,
    index: usize,
    stash: &mut Stash,
    host: &mut H,
) -> Result<Outcome, StepError> {
    let outcome = match &step.op {
        Op::SubAction { action } => Outcome::Suspend(Suspension::SubAction {
            action: action.clone(),
            params: stash.vars().clone(),
        }),
        Op::Api { endpoint, body } => {
            Outcome::Suspend(Suspension::Fetch(ops::api_request(endpoint, body, stash)?))
        }
        Op::Http { url, method, raw } => {
            Outcome::Suspend(Suspension::Fetch(ops::http_request(url, *method, *raw, stash)?))
        }
        Op::LoadAuth { url_key } => Outcome::Suspend(Suspension::ShowPage {
            url: ops::page_url(url_key, stash)?,
        }),
        Op::Match(spec) => Outcome::Value(ops::compare(spec, stash)?),
        Op::Get(spec) => Outcome::Value(ops::get(spec, step.ignore, stash)?),
        Op::Set(spec) => Outcome::Value(ops::set(spec, stash)?),
        Op::Array { source, item } => {
            Outcome::Value(ops::enter_array(source, item, index, step.ignore, stash)?)
        }
        Op::Append { source, target } => Outcome::Value(ops::append(source, target, stash)?),
        Op::Return { key } => {
            let spec = super::ir::GetSpec::path(key.as_str());
            Outcome::Finish(ops::get(&spec, false, stash)?)
        }
        Op::Yield { item } => match ops::advance_loop(item, stash)? {
            LoopStep::Next { origin, current } => {
                host.emit_item(&current);
                Outcome::Jump(origin)
            }
            LoopStep::Exhausted { current, .. } => {
                if let Some(current) = current {
                    host.emit_item(&current);
                }
                Outcome::Next
            }
        },
        Op::ReturnArray { item } => match ops::advance_loop(item, stash)? {
            LoopStep::Next { origin, .. } => Outcome::Jump(origin),
            LoopStep::Exhausted { accumulated, .. } => Outcome::Finish(Value::Array(accumulated)),
        },
        Op::Continue { item } => match ops::advance_loop(item, stash)? {
            LoopStep::Next { origin, .. } => Outcome::Jump(origin),
            LoopStep::Exhausted { .. } => Outcome::Next,
        },
    };
    Ok(outcome)
}

fn store<H: PlanHost + ?Sized>(step: &Step, value: Value, stash: &mut Stash, host: &mut H) {
    let item_dest;
    let dest = match &step.op {
        Op::Array { item, .. } => {
            item_dest = Dest::Key(item.clone());
            Some(&item_dest)
        }
        _ => step.dest.as_ref(),
    };

    let log_result = step.debug.is_some() || host.log_all();
    let logged = if log_result { Some(value.clone()) } else { None };

    match dest {
        Some(Dest::Key(key)) => {
            stash.insert(key.clone(), value);
        }
        Some(Dest::Nested { outer, inner }) => stash.insert_nested(outer, inner, value),
        Some(Dest::Var(key)) => {
            stash.insert_nested(VARS_KEY, key, value.clone());
            host.set_var(key, value);
        }
        None => {}
    }

    if let Some(value) = logged {
        match step.debug {
            Some(DebugMode::Stash) => {
                debug!(stash = %summarize(&stash.to_value(), LOG_LIMIT), "end of step")
            }
            _ => debug!(result = %summarize(&value, LOG_LIMIT), "end of step"),
        }
    }
}
